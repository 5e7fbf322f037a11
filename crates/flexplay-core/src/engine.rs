//! Symphonia/cpal audio engine
//!
//! The real `Transport`: a decode thread feeds a shared sample buffer that
//! the cpal callback drains. Playback rate is applied by steering the
//! resampler ratio, so speed and pitch change together.

use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicU32, AtomicU64, Ordering };
use std::thread;
use std::time::Duration;

use rubato::{ FastFixedOut, PolynomialDegree, Resampler };

use crate::decoder::Decoder;
use crate::output::{ AudioOutput, SampleBuffer };
use crate::transport::{ Transport, TransportError, SILENCE_FLOOR_DB };


/// Largest rate change the resampler is built to absorb, either way.
const MAX_RELATIVE_RATIO: f64 = 4.0;

/// Resampler output chunk in frames.
const CHUNK_FRAMES: usize = 1024;


/// Converts planar samples back to interleaved format.
/// [[L0, L1, ...], [R0, R1, ...]] → [L0, R0, L1, R1, ...]
fn interleave( channels: &[Vec<f32>] ) -> Vec<f32> {
    let frames = channels.first().map_or( 0, Vec::len );
    let mut out = Vec::with_capacity( frames * channels.len() );
    for f in 0..frames {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
    out
}


/// State shared with the decode thread.
#[derive( Clone )]
struct Shared {
    sample_buffer: Arc<SampleBuffer>,
    stop_flag: Arc<AtomicBool>,
    /// Source frames handed to the resampler so far, including the seek offset
    frames_played: Arc<AtomicU64>,
    /// Set when the decoder hit end of file and the buffer drained
    track_ended: Arc<AtomicBool>,
    /// Playback rate as f32 bits
    rate: Arc<AtomicU32>,
}


impl Shared {
    fn stopped( &self ) -> bool {
        self.stop_flag.load( Ordering::Relaxed )
    }


    fn rate( &self ) -> f32 {
        f32::from_bits( self.rate.load( Ordering::Relaxed ) )
    }


    /// Pushes everything in `samples`, waiting for room unless stopped.
    fn push_all( &self, samples: &[f32] ) {
        let mut offset = 0;
        while offset < samples.len() && !self.stopped() {
            let pushed = self.sample_buffer.push( &samples[ offset.. ] );
            offset += pushed;
            if pushed == 0 {
                thread::sleep( Duration::from_millis( 5 ) );
            }
        }
    }
}


/// The open track.
struct PlaybackHandle {
    path: PathBuf,
    shared: Shared,
    // Dropping the output stops the device stream
    _output: AudioOutput,
    thread: Option<thread::JoinHandle<Decoder>>,
    source_rate: u32,
    device_rate: u32,
    channels: usize,
}


impl PlaybackHandle {
    /// Stops the decode thread and takes the decoder back.
    fn halt( &mut self ) -> Option<Decoder> {
        self.shared.stop_flag.store( true, Ordering::Relaxed );
        self.shared.sample_buffer.clear();
        let decoder = self.thread.take().and_then( |t| t.join().ok() );
        self.shared.sample_buffer.clear();
        decoder
    }


    /// Starts a decode thread for `decoder`, which must already be at `start_frame`.
    fn spawn( &mut self, decoder: Decoder, start_frame: u64 ) -> Result<(), TransportError> {
        let base_ratio = self.device_rate as f64 / self.source_rate as f64;
        let resampler = FastFixedOut::<f32>::new(
            base_ratio / self.shared.rate() as f64,
            MAX_RELATIVE_RATIO,
            PolynomialDegree::Cubic,
            CHUNK_FRAMES,
            self.channels,
        ).map_err( |e| TransportError::Output( format!( "Failed to create resampler: {}", e ) ) )?;

        self.shared.stop_flag = Arc::new( AtomicBool::new( false ) );
        self.shared.track_ended = Arc::new( AtomicBool::new( false ) );
        self.shared.frames_played.store( start_frame, Ordering::Relaxed );

        let shared = self.shared.clone();
        self.thread = Some( thread::spawn( move || decode_loop( decoder, resampler, base_ratio, shared ) ) );
        Ok(())
    }
}


/// The decode loop that runs in a separate thread. Hands the decoder back when it exits.
fn decode_loop(
    mut decoder: Decoder,
    mut resampler: FastFixedOut<f32>,
    base_ratio: f64,
    shared: Shared,
) -> Decoder {
    let channels = decoder.channels().max( 1 );
    let mut pending: Vec<Vec<f32>> = ( 0..channels ).map( |_| Vec::new() ).collect();
    let mut applied_rate = shared.rate();
    // Keep about 50ms decoded ahead
    let target_buffer = ( decoder.sample_rate() as usize * channels ) / 20;

    loop {
        if shared.stopped() {
            tracing::debug!( "Decode loop: stop signal received" );
            break;
        }

        if shared.sample_buffer.is_paused() {
            thread::sleep( Duration::from_millis( 10 ) );
            continue;
        }

        if shared.sample_buffer.len() > target_buffer {
            thread::sleep( Duration::from_millis( 5 ) );
            continue;
        }

        let rate = shared.rate();
        if rate != applied_rate {
            if let Err( e ) = resampler.set_resample_ratio( base_ratio / rate as f64, true ) {
                tracing::warn!( "Could not apply rate {}: {}", rate, e );
            }
            applied_rate = rate;
        }

        match decoder.decode_next() {
            Ok( Some( samples ) ) => {
                shared.frames_played.fetch_add( ( samples.len() / channels ) as u64, Ordering::Relaxed );

                for frame in samples.chunks( channels ) {
                    for ( ch, sample ) in frame.iter().enumerate() {
                        pending[ ch ].push( *sample );
                    }
                }

                let mut out = Vec::new();
                while pending[ 0 ].len() >= resampler.input_frames_next() {
                    let needed = resampler.input_frames_next();
                    let chunk: Vec<Vec<f32>> = pending.iter_mut().map( |ch| ch.drain( ..needed ).collect() ).collect();
                    match resampler.process( &chunk, None ) {
                        Ok( resampled ) => out.extend( interleave( &resampled ) ),
                        Err( e ) => {
                            tracing::error!( "Resample error: {}", e );
                            break;
                        }
                    }
                }
                shared.push_all( &out );
            }
            Ok( None ) => {
                if !pending[ 0 ].is_empty() {
                    match resampler.process_partial( Some( pending.as_slice() ), None ) {
                        Ok( resampled ) => shared.push_all( &interleave( &resampled ) ),
                        Err( e ) => tracing::error!( "Final resample error: {}", e ),
                    }
                }
                tracing::info!( "Decode loop: reached end of file" );
                finish( &shared );
                break;
            }
            Err( e ) => {
                tracing::error!( "Decode error: {}", e );
                finish( &shared );
                break;
            }
        }
    }

    tracing::debug!( "Decode loop: exiting" );
    decoder
}


/// Waits for the buffer to drain, then flags the natural end.
fn finish( shared: &Shared ) {
    while !shared.sample_buffer.is_empty() && !shared.stopped() {
        thread::sleep( Duration::from_millis( 10 ) );
    }
    if !shared.stopped() {
        shared.track_ended.store( true, Ordering::Relaxed );
    }
}


/// Audio engine backed by the default output device.
///
/// Not Send; build it on the thread that drives it.
pub struct AudioEngine {
    playback: Option<PlaybackHandle>,
    rate: Arc<AtomicU32>,
    volume: f32,
}


impl AudioEngine {
    pub fn new() -> Self {
        Self {
            playback: None,
            rate: Arc::new( AtomicU32::new( 1.0_f32.to_bits() ) ),
            volume: 1.0,
        }
    }}


impl Default for AudioEngine {
    fn default() -> Self {
        Self::new()
    }
}


impl Transport for AudioEngine {
    fn open( &mut self, path: &Path ) -> Result<f64, TransportError> {
        self.close();

        tracing::info!( "Opening: {:?}", path );

        let decoder = Decoder::open( path ).map_err( |e| TransportError::Open( e.to_string() ) )?;
        let source_rate = decoder.sample_rate();
        let channels = decoder.channels().max( 1 );
        let duration = decoder.duration().unwrap_or( 0.0 );

        let ( output, sample_buffer ) = AudioOutput::new( source_rate, channels as u16 )
            .map_err( |e| TransportError::Output( e.to_string() ) )?;
        sample_buffer.set_volume( self.volume );
        sample_buffer.set_paused( true );
        output.play().map_err( |e| TransportError::Output( e.to_string() ) )?;

        if source_rate != output.sample_rate() {
            tracing::info!( "Resampling: {} Hz → {} Hz", source_rate, output.sample_rate() );
        }

        let mut handle = PlaybackHandle {
            path: path.to_path_buf(),
            shared: Shared {
                sample_buffer,
                stop_flag: Arc::new( AtomicBool::new( false ) ),
                frames_played: Arc::new( AtomicU64::new( 0 ) ),
                track_ended: Arc::new( AtomicBool::new( false ) ),
                rate: Arc::clone( &self.rate ),
            },
            device_rate: output.sample_rate(),
            _output: output,
            thread: None,
            source_rate,
            channels,
        };
        handle.spawn( decoder, 0 )?;
        self.playback = Some( handle );

        Ok( duration )
    }


    fn play( &mut self ) {
        if let Some( ref handle ) = self.playback {
            handle.shared.sample_buffer.set_paused( false );
            tracing::info!( "Resumed" );
        }
    }


    fn pause( &mut self ) {
        if let Some( ref handle ) = self.playback {
            handle.shared.sample_buffer.set_paused( true );
            tracing::info!( "Paused" );
        }
    }


    fn close( &mut self ) {
        if let Some( mut handle ) = self.playback.take() {
            handle.halt();
            tracing::info!( "Closed {:?}", handle.path );
        }
    }


    fn seek( &mut self, position_secs: f64 ) -> Result<(), TransportError> {
        let handle = self.playback.as_mut().ok_or( TransportError::NotOpen )?;
        let previous = handle.shared.frames_played.load( Ordering::Relaxed );

        let mut decoder = match handle.halt() {
            Some( decoder ) => decoder,
            None => Decoder::open( &handle.path ).map_err( |e| TransportError::Open( e.to_string() ) )?,
        };

        tracing::info!( "Seeking to {:.1}s in {:?}", position_secs, handle.path );

        let sought = decoder.seek( position_secs );
        let start_frame = match sought {
            Ok(()) => ( position_secs.max( 0.0 ) * handle.source_rate as f64 ) as u64,
            Err( _ ) => previous,
        };
        handle.spawn( decoder, start_frame )?;

        sought.map_err( |e| TransportError::Decode( e.to_string() ) )
    }


    fn position( &self ) -> f64 {
        self.playback.as_ref().map_or( 0.0, |h| {
            h.shared.frames_played.load( Ordering::Relaxed ) as f64 / h.source_rate as f64
        })
    }


    fn set_rate( &mut self, rate: f32 ) {
        self.rate.store( rate.to_bits(), Ordering::Relaxed );
    }


    fn set_volume( &mut self, volume: f32 ) {
        self.volume = volume.clamp( 0.0, 1.0 );
        if let Some( ref handle ) = self.playback {
            handle.shared.sample_buffer.set_volume( self.volume );
        }
    }


    fn average_power( &self ) -> f32 {
        self.playback.as_ref().map_or( SILENCE_FLOOR_DB, |h| h.shared.sample_buffer.average_power_db() )
    }


    fn finished( &self ) -> bool {
        self.playback.as_ref().is_some_and( |h| h.shared.track_ended.load( Ordering::Relaxed ) )
    }
}


impl Drop for AudioEngine {
    fn drop( &mut self ) {
        self.close();
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_interleave() {
        let planar = vec![ vec![ 1.0, 2.0 ], vec![ 3.0, 4.0 ] ];
        assert_eq!( interleave( &planar ), vec![ 1.0, 3.0, 2.0, 4.0 ] );
        assert!( interleave( &[] ).is_empty() );
    }


    #[test]
    fn test_closed_engine_reports_idle_values() {
        let mut engine = AudioEngine::new();
        assert_eq!( engine.position(), 0.0 );
        assert!( !engine.finished() );
        assert_eq!( engine.average_power(), SILENCE_FLOOR_DB );
        assert!( matches!( engine.seek( 3.0 ), Err( TransportError::NotOpen ) ) );
        engine.close();
    }


    #[test]
    fn test_open_missing_file_fails() {
        let mut engine = AudioEngine::new();
        let result = engine.open( Path::new( "/definitely/not/here.flac" ) );
        assert!( matches!( result, Err( TransportError::Open( _ ) ) ) );
        assert!( engine.playback.is_none() );
    }
}
