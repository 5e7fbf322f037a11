//! Audio output via cpal
//!
//! Moves decoded PCM from the decode thread to the device callback and
//! meters what actually reaches the device.

use std::collections::VecDeque;
use std::sync::{ Arc, Mutex, MutexGuard };
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use thiserror::Error;

use crate::transport::amplitude_to_db;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Failed to get stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to control stream: {0}" )]
    Stream( String ),
}


/// Weight of the newest callback block in the smoothed level.
const LEVEL_SMOOTHING: f32 = 0.5;


fn lock<T>( mutex: &Mutex<T> ) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else( |poisoned| poisoned.into_inner() )
}


/// Ring of interleaved samples shared between the decode thread and the device callback.
///
/// Converts between source and device channel layouts on the way out, keeps a
/// smoothed RMS level of the emitted signal and then applies volume.
pub struct SampleBuffer {
    buffer: Mutex<VecDeque<f32>>,
    capacity: usize,
    paused: AtomicBool,
    volume: AtomicU32,
    /// Smoothed RMS of the last callback blocks, as f32 bits
    level: AtomicU32,
    source_channels: usize,
    output_channels: usize,
}


impl SampleBuffer {
    /// Creates a buffer holding at most `capacity` source samples.
    pub fn new( capacity: usize, source_channels: u16, output_channels: u16 ) -> Self {
        Self {
            buffer: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            paused: AtomicBool::new( false ),
            volume: AtomicU32::new( 1.0_f32.to_bits() ),
            level: AtomicU32::new( 0.0_f32.to_bits() ),
            source_channels: source_channels.max( 1 ) as usize,
            output_channels: output_channels.max( 1 ) as usize,
        }
    }


    /// Pushes interleaved source samples. Returns how many were accepted.
    pub fn push( &self, samples: &[f32] ) -> usize {
        let mut buf = lock( &self.buffer );
        let accepted = samples.len().min( self.capacity.saturating_sub( buf.len() ) );
        buf.extend( samples[ ..accepted ].iter().copied() );
        accepted
    }


    /// Fills `output` with device-layout samples, padding with silence.
    ///
    /// @returns The number of output samples that carried audio
    pub fn pop( &self, output: &mut [f32] ) -> usize {
        if self.paused.load( Ordering::Relaxed ) {
            output.fill( 0.0 );
            self.store_level( 0.0 );
            return 0;
        }

        let src_ch = self.source_channels;
        let out_ch = self.output_channels;
        let written = {
            let mut buf = lock( &self.buffer );
            let frames = ( output.len() / out_ch ).min( buf.len() / src_ch );
            let mut frame = vec![ 0.0_f32; src_ch ];

            for out_frame in output.chunks_exact_mut( out_ch ).take( frames ) {
                for slot in frame.iter_mut() {
                    *slot = buf.pop_front().unwrap_or( 0.0 );
                }
                remix( &frame, out_frame );
            }
            frames * out_ch
        };
        output[ written.. ].fill( 0.0 );
        self.meter( &output[ ..written ] );

        let volume = self.volume();
        if volume != 1.0 {
            for sample in output[ ..written ].iter_mut() {
                *sample *= volume;
            }
        }
        written
    }


    fn meter( &self, block: &[f32] ) {
        let rms = if block.is_empty() {
            0.0
        } else {
            ( block.iter().map( |s| s * s ).sum::<f32>() / block.len() as f32 ).sqrt()
        };
        let previous = f32::from_bits( self.level.load( Ordering::Relaxed ) );
        self.store_level( previous * ( 1.0 - LEVEL_SMOOTHING ) + rms * LEVEL_SMOOTHING );
    }


    fn store_level( &self, level: f32 ) {
        self.level.store( level.to_bits(), Ordering::Relaxed );
    }


    pub fn len( &self ) -> usize {
        lock( &self.buffer ).len()
    }


    pub fn is_empty( &self ) -> bool {
        lock( &self.buffer ).is_empty()
    }


    pub fn clear( &self ) {
        lock( &self.buffer ).clear();
    }


    pub fn set_paused( &self, paused: bool ) {
        self.paused.store( paused, Ordering::Relaxed );
    }


    pub fn is_paused( &self ) -> bool {
        self.paused.load( Ordering::Relaxed )
    }


    /// Sets the gain applied on the way out, clamped to [0, 1].
    pub fn set_volume( &self, volume: f32 ) {
        self.volume.store( volume.clamp( 0.0, 1.0 ).to_bits(), Ordering::Relaxed );
    }


    pub fn volume( &self ) -> f32 {
        f32::from_bits( self.volume.load( Ordering::Relaxed ) )
    }


    /// Smoothed RMS amplitude of the emitted signal, before volume.
    pub fn level( &self ) -> f32 {
        f32::from_bits( self.level.load( Ordering::Relaxed ) )
    }


    /// Smoothed average power of the emitted signal in dBFS.
    pub fn average_power_db( &self ) -> f32 {
        amplitude_to_db( self.level() )
    }
}


/// Maps one source frame onto one device frame.
fn remix( src: &[f32], out: &mut [f32] ) {
    match ( src.len(), out.len() ) {
        ( s, o ) if s == o => out.copy_from_slice( src ),
        ( 1, _ ) => out.fill( src[ 0 ] ),
        ( _, 1 ) => out[ 0 ] = src.iter().sum::<f32>() / src.len() as f32,
        ( s, _ ) => {
            for ( ch, slot ) in out.iter_mut().enumerate() {
                *slot = src[ ch.min( s - 1 ) ];
            }
        }
    }
}


/// Audio device stream.
///
/// Not Send: cpal streams must stay on the thread that built them.
pub struct AudioOutput {
    stream: cpal::Stream,
    sample_rate: u32,
}


impl AudioOutput {
    /// Opens the default output device for a source format.
    ///
    /// Prefers a config with the source's channel count and rate, then any
    /// config at the source rate, then the device default.
    ///
    /// @returns The output and the buffer the decode thread should feed
    pub fn new(
        source_sample_rate: u32,
        source_channels: u16,
    ) -> Result<( Self, Arc<SampleBuffer> ), OutputError> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or( OutputError::NoDevice )?;

        tracing::info!( "Using output device: {:?}", device.name() );

        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .collect();

        let covers_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= source_sample_rate && c.max_sample_rate().0 >= source_sample_rate
        };

        let config = match supported.iter().find( |c| c.channels() == source_channels && covers_rate( c ) )
            .or_else( || supported.iter().find( |c| covers_rate( c ) ) )
        {
            Some( range ) => range.clone().with_sample_rate( cpal::SampleRate( source_sample_rate ) ).config(),
            None => {
                let default_config = device
                    .default_output_config()
                    .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;
                tracing::info!(
                    "Device does not support {} Hz, resampling to {} Hz",
                    source_sample_rate,
                    default_config.sample_rate().0
                );
                default_config.config()
            }
        };

        tracing::info!( "Audio output config: {} Hz, {} channels", config.sample_rate.0, config.channels );

        // About half a second of source audio
        let capacity = ( source_sample_rate as usize ) * ( source_channels as usize ) / 2;
        let sample_buffer = Arc::new( SampleBuffer::new( capacity, source_channels, config.channels ) );
        let callback_buffer = Arc::clone( &sample_buffer );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback_buffer.pop( data );
                },
                |err| tracing::error!( "Audio output error: {}", err ),
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        Ok((
            Self { stream, sample_rate: config.sample_rate.0 },
            sample_buffer,
        ))
    }


    pub fn play( &self ) -> Result<(), OutputError> {
        self.stream.play().map_err( |e| OutputError::Stream( e.to_string() ) )
    }

    /// Device sample rate.
    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_pop_mono_to_stereo_duplicates() {
        let buf = SampleBuffer::new( 16, 1, 2 );
        buf.push( &[ 0.1, 0.2 ] );
        let mut out = [ 9.0_f32; 6 ];
        assert_eq!( buf.pop( &mut out ), 4 );
        assert_eq!( out, [ 0.1, 0.1, 0.2, 0.2, 0.0, 0.0 ] );
    }


    #[test]
    fn test_pop_stereo_to_mono_mixes() {
        let buf = SampleBuffer::new( 16, 2, 1 );
        buf.push( &[ 0.2, 0.4 ] );
        let mut out = [ 0.0_f32; 2 ];
        assert_eq!( buf.pop( &mut out ), 1 );
        assert!( ( out[ 0 ] - 0.3 ).abs() < 1e-6 );
    }


    #[test]
    fn test_push_respects_capacity() {
        let buf = SampleBuffer::new( 4, 2, 2 );
        assert_eq!( buf.push( &[ 0.0; 6 ] ), 4 );
        assert_eq!( buf.len(), 4 );
    }


    #[test]
    fn test_paused_outputs_silence_and_zero_level() {
        let buf = SampleBuffer::new( 16, 1, 1 );
        buf.push( &[ 0.5; 8 ] );
        buf.set_paused( true );
        let mut out = [ 1.0_f32; 4 ];
        assert_eq!( buf.pop( &mut out ), 0 );
        assert_eq!( out, [ 0.0; 4 ] );
        assert_eq!( buf.level(), 0.0 );
        assert_eq!( buf.len(), 8 );
    }


    #[test]
    fn test_level_ignores_volume() {
        let buf = SampleBuffer::new( 64, 1, 1 );
        buf.set_volume( 0.1 );
        buf.push( &[ 1.0; 32 ] );
        let mut out = [ 0.0_f32; 32 ];
        buf.pop( &mut out );
        assert!( ( out[ 0 ] - 0.1 ).abs() < 1e-6 );
        assert!( ( buf.level() - 0.5 ).abs() < 1e-6 );
        assert!( buf.average_power_db() < 0.0 );
    }


    #[test]
    fn test_volume_is_clamped() {
        let buf = SampleBuffer::new( 4, 1, 1 );
        buf.set_volume( 1.5 );
        assert_eq!( buf.volume(), 1.0 );
        buf.set_volume( -1.0 );
        assert_eq!( buf.volume(), 0.0 );
    }
}
