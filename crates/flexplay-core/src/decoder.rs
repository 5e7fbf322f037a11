//! Audio decoding via Symphonia
//!
//! Decodes supported formats into interleaved f32 PCM and reads the tags
//! and cover art the catalog shows.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo };
use symphonia::core::io::{ MediaSourceStream, MediaSourceStreamOptions };
use symphonia::core::meta::{ MetadataOptions, MetadataRevision, StandardTagKey };
use symphonia::core::probe::{ Hint, ProbedMetadata };
use symphonia::core::units::Time;
use thiserror::Error;


/// Tags and cover art read from a file.
#[derive( Debug, Clone, Default )]
pub struct AudioMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub artwork: Option<Arc<[u8]>>,
}


impl AudioMetadata {
    /// Fills fields still missing from one metadata revision.
    fn absorb( &mut self, revision: &MetadataRevision ) {
        for tag in revision.tags() {
            let slot = match tag.std_key {
                Some( StandardTagKey::TrackTitle ) => &mut self.title,
                Some( StandardTagKey::Artist ) => &mut self.artist,
                Some( StandardTagKey::Album ) => &mut self.album,
                _ => continue,
            };
            let value = tag.value.to_string();
            if slot.is_none() && !value.trim().is_empty() {
                *slot = Some( value.trim().to_string() );
            }
        }

        if self.artwork.is_none() {
            if let Some( visual ) = revision.visuals().first() {
                self.artwork = Some( Arc::from( &visual.data[ .. ] ) );
            }
        }
    }
}


/// Errors that can occur during decoding.
#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "Failed to open file: {0}" )]
    FileOpen( #[from] std::io::Error ),

    #[error( "Unsupported format" )]
    UnsupportedFormat,

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Decoder creation failed: {0}" )]
    DecoderCreation( String ),

    #[error( "Decode error: {0}" )]
    Decode( String ),

    #[error( "Seek error: {0}" )]
    Seek( String ),
}


/// Audio decoder wrapper around Symphonia.
pub struct Decoder {
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    sample_rate: u32,
    channels: usize,
    sample_buf: Option<SampleBuffer<f32>>,
    duration: Option<f64>,
    probe_metadata: ProbedMetadata,
}


impl Decoder {
    /// Opens an audio file for decoding.
    pub fn open( path: &Path ) -> Result<Self, DecoderError> {
        let file = File::open( path )?;
        let mss = MediaSourceStream::new( Box::new( file ), MediaSourceStreamOptions { buffer_len: 64 * 1024 } );

        let mut hint = Hint::new();
        if let Some( ext ) = path.extension().and_then( |e| e.to_str() ) {
            hint.with_extension( ext );
        }

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |_| DecoderError::UnsupportedFormat )?;

        let probe_metadata = probed.metadata;
        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( DecoderError::NoAudioTrack )?;

        let track_id = track.id;
        let codec_params = &track.codec_params;
        let sample_rate = codec_params.sample_rate.unwrap_or( 44100 );
        let channels = codec_params.channels.map( |c| c.count() ).unwrap_or( 2 );
        let duration = codec_params.n_frames.map( |frames| frames as f64 / sample_rate as f64 );

        tracing::info!( "Opened audio: {} Hz, {} channels, duration: {:?}s", sample_rate, channels, duration );

        let decoder = symphonia::default::get_codecs()
            .make( codec_params, &DecoderOptions::default() )
            .map_err( |e| DecoderError::DecoderCreation( e.to_string() ) )?;

        Ok( Self {
            format_reader,
            decoder,
            track_id,
            sample_rate,
            channels,
            sample_buf: None,
            duration,
            probe_metadata,
        })
    }


    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    pub fn channels( &self ) -> usize {
        self.channels
    }


    /// Returns the duration in seconds, if the container knows it.
    pub fn duration( &self ) -> Option<f64> {
        self.duration
    }


    /// Reads tags and artwork, container-level tags taking precedence over stream-level ones.
    pub fn metadata( &mut self ) -> AudioMetadata {
        let mut meta = AudioMetadata::default();

        if let Some( log ) = self.probe_metadata.get() {
            if let Some( revision ) = log.current() {
                meta.absorb( revision );
            }
        }
        if let Some( revision ) = self.format_reader.metadata().current() {
            meta.absorb( revision );
        }

        meta
    }


    /// Decodes the next packet of our track into interleaved samples.
    ///
    /// Returns None at end of file.
    pub fn decode_next( &mut self ) -> Result<Option<Vec<f32>>, DecoderError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( ref e ) ) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok( None );
                }
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode( &packet ) {
                Ok( decoded ) => decoded,
                // Corrupt packet, skip it
                Err( SymphoniaError::DecodeError( _ ) ) => continue,
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();

            if self.sample_buf.as_ref().map_or( true, |buf| buf.capacity() < frames * spec.channels.count() ) {
                self.sample_buf = None;
            }
            let sample_buf = self.sample_buf.get_or_insert_with( || SampleBuffer::new( frames as u64, spec ) );
            sample_buf.copy_interleaved_ref( decoded );

            return Ok( Some( sample_buf.samples().to_vec() ) );
        }
    }


    /// Seeks to a position in seconds.
    pub fn seek( &mut self, position_secs: f64 ) -> Result<(), DecoderError> {
        let seek_to = SeekTo::Time {
            time: Time::from( position_secs.max( 0.0 ) ),
            track_id: Some( self.track_id ),
        };

        self.format_reader
            .seek( SeekMode::Accurate, seek_to )
            .map_err( |e| DecoderError::Seek( e.to_string() ) )?;
        self.decoder.reset();

        Ok(())
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use tempfile::TempDir;


    #[test]
    fn test_open_missing_file() {
        let result = Decoder::open( Path::new( "/no/such/track.flac" ) );
        assert!( matches!( result, Err( DecoderError::FileOpen( _ ) ) ) );
    }


    #[test]
    fn test_open_garbage_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join( "noise.mp3" );
        std::fs::write( &path, b"definitely not an mp3 stream" ).unwrap();
        assert!( matches!( Decoder::open( &path ), Err( DecoderError::UnsupportedFormat ) ) );
    }
}
