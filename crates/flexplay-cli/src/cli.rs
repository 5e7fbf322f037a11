//! Command-line argument parsing for FlexPlay.

use std::path::PathBuf;

use clap::Parser;


/// FlexPlay - A local music player with sleep timer and silence skipping.
#[derive( Parser, Debug )]
#[command( name = "flexplay" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Managed library directory (overrides the setting).
    #[arg( short, long )]
    pub library_dir: Option<PathBuf>,

    /// Disable OS media controls for this run.
    #[arg( long )]
    pub no_media_controls: bool,

    /// End tracks early on trailing silence.
    #[arg( short, long )]
    pub skip_silence: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg( short, long, action = clap::ArgAction::Count )]
    pub verbose: u8,

    /// Files or directories to import and start playing.
    #[arg( trailing_var_arg = true )]
    pub files: Vec<PathBuf>,
}


impl Args {
    /// Log filter implied by `-v`, if any.
    pub fn log_level( &self ) -> Option<&'static str> {
        match self.verbose {
            0 => None,
            1 => Some( "info" ),
            2 => Some( "debug" ),
            _ => Some( "trace" ),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_flags_and_files() {
        let args = Args::parse_from( [ "flexplay", "-vv", "--skip-silence", "a.mp3", "album" ] );
        assert_eq!( args.log_level(), Some( "debug" ) );
        assert!( args.skip_silence );
        assert!( !args.no_media_controls );
        assert_eq!( args.files, vec![ PathBuf::from( "a.mp3" ), PathBuf::from( "album" ) ] );
    }


    #[test]
    fn test_defaults() {
        let args = Args::parse_from( [ "flexplay" ] );
        assert_eq!( args.log_level(), None );
        assert!( args.library_dir.is_none() );
        assert!( args.files.is_empty() );
    }
}
