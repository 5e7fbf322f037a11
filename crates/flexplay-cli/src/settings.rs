//! Application settings management
//!
//! Persistent preferences for media controls, silence skipping and the
//! initial playback rate and volume.

use std::fs;
use std::path::{ Path, PathBuf };

use serde::{ Deserialize, Serialize };

use flexplay_core::coordinator::PlaybackOptions;
use flexplay_core::SilenceParams;


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Enable System Media Transport Controls (Windows)
    pub smtc_enabled: bool,

    /// End tracks early on trailing silence
    pub skip_silence: bool,

    pub silence: SilenceParams,

    /// Initial playback rate
    pub playback_rate: f32,

    /// Initial volume, 0.0 to 1.0
    pub volume: f32,

    /// Overrides the managed-import directory
    pub library_dir: Option<PathBuf>,

    /// Log filter used when no `-v` is given
    pub log_level: String,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            smtc_enabled: true,
            skip_silence: false,
            silence: SilenceParams::default(),
            playback_rate: 1.0,
            volume: 1.0,
            library_dir: None,
            log_level: "warn".to_string(),
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "flexplay" ).join( "settings.json" ) )
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some( path ) => Self::load_from( &path ),
            None => Self::default(),
        }
    }


    /// Loads settings from `path`; unreadable or malformed files give defaults.
    pub fn load_from( path: &Path ) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( path ) {
            Ok( contents ) => serde_json::from_str( &contents ).unwrap_or_else( |e| {
                tracing::warn!( "Ignoring malformed settings {:?}: {}", path, e );
                Self::default()
            }),
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    /// Saves settings to disk.
    pub fn save( &self ) {
        if let Some( path ) = Self::settings_path() {
            self.save_to( &path );
        }
    }


    pub fn save_to( &self, path: &Path ) {
        if let Some( parent ) = path.parent() {
            if let Err( e ) = fs::create_dir_all( parent ) {
                tracing::warn!( "Failed to create settings directory: {}", e );
                return;
            }
        }

        match serde_json::to_string_pretty( self ) {
            Ok( json ) => {
                if let Err( e ) = fs::write( path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }


    /// Session options derived from these settings.
    pub fn playback_options( &self ) -> PlaybackOptions {
        PlaybackOptions {
            skip_silence: self.skip_silence,
            silence: self.silence,
            rate: self.playback_rate,
            volume: self.volume.clamp( 0.0, 1.0 ),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use tempfile::TempDir;


    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!( Settings::load_from( &dir.path().join( "settings.json" ) ), Settings::default() );
    }


    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join( "nested" ).join( "settings.json" );
        let settings = Settings { skip_silence: true, playback_rate: 1.5, ..Settings::default() };

        settings.save_to( &path );
        assert_eq!( Settings::load_from( &path ), settings );
    }


    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, r#"{ "skip_silence": true, "silence": { "tail_window_secs": 30.0 } }"# ).unwrap();

        let settings = Settings::load_from( &path );
        assert!( settings.skip_silence );
        assert!( settings.smtc_enabled );
        assert_eq!( settings.silence.tail_window_secs, 30.0 );
        assert_eq!( settings.silence.required_consecutive_secs, 3.0 );
    }


    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, "not json" ).unwrap();
        assert_eq!( Settings::load_from( &path ), Settings::default() );
    }


    #[test]
    fn test_playback_options_clamp_volume() {
        let settings = Settings { volume: 3.0, ..Settings::default() };
        assert_eq!( settings.playback_options().volume, 1.0 );
    }
}
