//! Audio transport contract
//!
//! The coordinator drives exactly one transport. `engine::AudioEngine` is the
//! real one; tests use a scripted fake.

use std::path::Path;

use thiserror::Error;


/// Errors reported by a transport.
#[derive( Debug, Error )]
pub enum TransportError {
    #[error( "Failed to open file: {0}" )]
    Open( String ),

    #[error( "Decode error: {0}" )]
    Decode( String ),

    #[error( "Audio output error: {0}" )]
    Output( String ),

    #[error( "Nothing is open" )]
    NotOpen,
}


/// Average power reported when nothing is audible.
pub const SILENCE_FLOOR_DB: f32 = -160.0;


/// A single-track audio transport.
pub trait Transport {
    /// Opens `path` paused at position zero.
    ///
    /// @returns The measured duration in seconds
    fn open( &mut self, path: &Path ) -> Result<f64, TransportError>;

    /// Starts or resumes output.
    fn play( &mut self );

    /// Pauses output, keeping position.
    fn pause( &mut self );

    /// Releases the decoder and output device. Safe to call when nothing is open.
    fn close( &mut self );

    /// Repositions the open track.
    fn seek( &mut self, position_secs: f64 ) -> Result<(), TransportError>;

    /// Current position in seconds.
    fn position( &self ) -> f64;

    /// Sets the speed multiplier.
    fn set_rate( &mut self, rate: f32 );

    /// Sets the output gain in [0, 1].
    fn set_volume( &mut self, volume: f32 );

    /// Instantaneous average power in dBFS.
    fn average_power( &self ) -> f32;

    /// True once the decoder hit end of file and the output drained.
    fn finished( &self ) -> bool;
}


/// Converts linear RMS amplitude to dBFS.
pub fn amplitude_to_db( amplitude: f32 ) -> f32 {
    if amplitude <= 0.0 {
        SILENCE_FLOOR_DB
    } else {
        ( 20.0 * amplitude.log10() ).max( SILENCE_FLOOR_DB )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::silence::db_to_amplitude;


    #[test]
    fn test_amplitude_to_db() {
        assert_eq!( amplitude_to_db( 0.0 ), SILENCE_FLOOR_DB );
        assert!( amplitude_to_db( 1.0 ).abs() < 1e-6 );
        assert!( ( db_to_amplitude( amplitude_to_db( 0.25 ) ) - 0.25 ).abs() < 1e-5 );
    }
}
