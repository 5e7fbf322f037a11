//! Prompt command parsing
//!
//! Commands are typed with or without a leading `/`. Track numbers are
//! 1-based on input and 0-based once parsed.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::RepeatMode;


/// Longest sleep timer accepted at the prompt.
pub const MAX_SLEEP_MINUTES: u64 = 24 * 60;


/// Errors that can occur during command parsing.
#[derive( Debug, Error )]
pub enum CommandError {
    #[error( "Unknown command: {0}" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "Missing argument: {0}" )]
    MissingArgument( String ),
}


/// Parsed prompt command.
#[derive( Debug, Clone, PartialEq )]
pub enum Command {
    // Catalog commands
    Import { path: PathBuf },
    Library,
    Favorites,
    /// Select a playlist as the source, or list playlists
    Playlist { name: Option<String> },
    NewPlaylist { name: String },
    AddToPlaylist { name: String, index: usize },
    /// Toggle favorite on a listed track, or the current one
    Fav { index: Option<usize> },

    // Playback commands
    /// Play a listed track, or toggle play/pause
    Play { index: Option<usize> },
    Pause,
    Stop,
    Next,
    Prev,
    Seek { position: Duration },
    Forward,
    Back,
    /// Set the rate, or step to the next preset
    Rate { rate: Option<f32> },
    Volume { level: Option<u32> },
    Sleep { arg: SleepArg },
    Shuffle,
    /// Set repeat mode, or cycle it
    Repeat { mode: Option<RepeatModeArg> },
    Silence { enabled: Option<bool> },
    /// Start or end an audio interruption, as a host session would
    Interrupt { phase: InterruptPhase },

    // Info commands
    Status,
    Queue,
    Help,
    Quit,
}


/// Repeat mode argument for parsing.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum RepeatModeArg {
    Off,
    One,
    All,
}


impl FromStr for RepeatModeArg {
    type Err = CommandError;


    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Ok( RepeatModeArg::Off ),
            "one" | "1" => Ok( RepeatModeArg::One ),
            "all" | "2" => Ok( RepeatModeArg::All ),
            _ => Err( CommandError::InvalidArgument(
                format!( "Invalid repeat mode: '{}'. Use 'off', 'one', or 'all'", s )
            )),
        }
    }
}


impl From<RepeatModeArg> for RepeatMode {
    fn from( arg: RepeatModeArg ) -> Self {
        match arg {
            RepeatModeArg::Off => RepeatMode::None,
            RepeatModeArg::One => RepeatMode::One,
            RepeatModeArg::All => RepeatMode::All,
        }
    }
}


/// Interruption phase for the `interrupt` command.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum InterruptPhase {
    Begin,
    /// End the interruption; `resume` is the host's resume hint
    End { resume: bool },
}


/// Sleep timer argument.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum SleepArg {
    /// Show the remaining time
    Status,
    Off,
    Minutes( u64 ),
}


impl Command {
    /// Parses a command line.
    ///
    /// @param input - The command string, with or without the leading `/`
    ///
    /// @returns The parsed command or an error
    pub fn parse( input: &str ) -> Result<Self, CommandError> {
        let input = input.trim();
        let input = input.strip_prefix( '/' ).unwrap_or( input );
        let ( cmd, args ) = match input.split_once( char::is_whitespace ) {
            Some(( cmd, rest )) => ( cmd.to_lowercase(), Some( rest.trim() ).filter( |s| !s.is_empty() ) ),
            None => ( input.to_lowercase(), None ),
        };

        match cmd.as_str() {
            // Catalog commands
            "import" | "i" => {
                let path = args.ok_or_else( || CommandError::MissingArgument( "path".into() ) )?;
                Ok( Command::Import { path: PathBuf::from( path ) } )
            }
            "library" | "lib" | "ls" => Ok( Command::Library ),
            "favorites" | "favs" => Ok( Command::Favorites ),
            "playlist" | "pl" => Ok( Command::Playlist { name: args.map( str::to_string ) } ),
            "newpl" => {
                let name = args.ok_or_else( || CommandError::MissingArgument( "playlist name".into() ) )?;
                Ok( Command::NewPlaylist { name: name.to_string() } )
            }
            "pladd" => {
                let args = args.ok_or_else( || CommandError::MissingArgument( "playlist name and track number".into() ) )?;
                let ( name, number ) = args
                    .rsplit_once( char::is_whitespace )
                    .ok_or_else( || CommandError::MissingArgument( "track number".into() ) )?;
                Ok( Command::AddToPlaylist { name: name.trim().to_string(), index: parse_index( number )? } )
            }
            "fav" | "f" => Ok( Command::Fav { index: args.map( parse_index ).transpose()? } ),

            // Playback commands
            "play" | "p" => Ok( Command::Play { index: args.map( parse_index ).transpose()? } ),
            "pause" | "pa" => Ok( Command::Pause ),
            "stop" | "st" => Ok( Command::Stop ),
            "next" | "n" => Ok( Command::Next ),
            "prev" | "previous" | "pr" => Ok( Command::Prev ),
            "seek" | "sk" => {
                let time_str = args.ok_or_else( || CommandError::MissingArgument( "time position".into() ) )?;
                Ok( Command::Seek { position: parse_time( time_str )? } )
            }
            "fwd" | "ff" => Ok( Command::Forward ),
            "back" | "rew" => Ok( Command::Back ),
            "rate" | "speed" => {
                let rate = args.map( parse_rate ).transpose()?;
                Ok( Command::Rate { rate } )
            }
            "vol" | "volume" => {
                let level = args
                    .map( |s| s.parse::<u32>().map_err( |_| CommandError::InvalidArgument( format!( "Invalid volume: {}", s ) ) ) )
                    .transpose()?;
                Ok( Command::Volume { level } )
            }
            "sleep" => {
                let arg = match args.map( str::to_lowercase ).as_deref() {
                    None => SleepArg::Status,
                    Some( "off" | "0" | "cancel" ) => SleepArg::Off,
                    Some( minutes ) => match minutes.parse::<u64>() {
                        Ok( m ) if m <= MAX_SLEEP_MINUTES => SleepArg::Minutes( m ),
                        _ => {
                            return Err( CommandError::InvalidArgument(
                                format!( "Invalid minutes: {} (0-{})", minutes, MAX_SLEEP_MINUTES )
                            ));
                        }
                    },
                };
                Ok( Command::Sleep { arg } )
            }
            "shuffle" | "sh" => Ok( Command::Shuffle ),
            "repeat" | "rep" => {
                let mode = args.map( |s| s.parse() ).transpose()?;
                Ok( Command::Repeat { mode } )
            }
            "silence" => {
                let enabled = match args.map( str::to_lowercase ).as_deref() {
                    None => None,
                    Some( "on" ) => Some( true ),
                    Some( "off" ) => Some( false ),
                    Some( other ) => {
                        return Err( CommandError::InvalidArgument( format!( "Use 'on' or 'off', not '{}'", other ) ) );
                    }
                };
                Ok( Command::Silence { enabled } )
            }
            "interrupt" | "int" => {
                let phase = match args.map( str::to_lowercase ).as_deref() {
                    None | Some( "begin" | "start" ) => InterruptPhase::Begin,
                    Some( "end" | "resume" ) => InterruptPhase::End { resume: true },
                    Some( "end-paused" ) => InterruptPhase::End { resume: false },
                    Some( other ) => {
                        return Err( CommandError::InvalidArgument(
                            format!( "Use 'begin', 'end' or 'end-paused', not '{}'", other )
                        ));
                    }
                };
                Ok( Command::Interrupt { phase } )
            }

            // Info commands
            "status" | "s" => Ok( Command::Status ),
            "queue" | "q" => Ok( Command::Queue ),
            "help" | "h" | "?" => Ok( Command::Help ),
            "quit" | "exit" => Ok( Command::Quit ),

            "" => Err( CommandError::Unknown( "empty command".into() ) ),
            other => Err( CommandError::Unknown( other.to_string() ) ),
        }
    }
}


/// Parses a 1-based track number into a 0-based index.
fn parse_index( s: &str ) -> Result<usize, CommandError> {
    match s.trim().parse::<usize>() {
        Ok( n ) if n >= 1 => Ok( n - 1 ),
        _ => Err( CommandError::InvalidArgument( format!( "Invalid track number: {}", s ) ) ),
    }
}


fn parse_rate( s: &str ) -> Result<f32, CommandError> {
    let s = s.trim().trim_end_matches( 'x' );
    match s.parse::<f32>() {
        Ok( rate ) if rate.is_finite() && rate > 0.0 => Ok( rate ),
        _ => Err( CommandError::InvalidArgument( format!( "Invalid rate: {}", s ) ) ),
    }
}


/// Parses a time string like "1:30", "1:02:03" or "90" into a Duration.
///
/// @param s - Time string in format "H:MM:SS", "MM:SS" or just seconds
///
/// @returns Duration or error
pub fn parse_time( s: &str ) -> Result<Duration, CommandError> {
    let s = s.trim();
    let invalid = || CommandError::InvalidArgument( format!( "Invalid time: {}", s ) );

    let parts: Vec<&str> = s.split( ':' ).collect();
    if parts.len() > 3 {
        return Err( invalid() );
    }

    let mut total = 0u64;
    for part in parts {
        let value: u64 = part.parse().map_err( |_| invalid() )?;
        total = total
            .checked_mul( 60 )
            .and_then( |t| t.checked_add( value ) )
            .ok_or_else( invalid )?;
    }
    Ok( Duration::from_secs( total ) )
}


/// Formats seconds as "M:SS".
pub fn format_time( secs: f64 ) -> String {
    let secs = secs.max( 0.0 ) as u64;
    format!( "{}:{:02}", secs / 60, secs % 60 )
}


/// Returns help text listing all available commands.
pub fn help_text() -> &'static str {
    r#"Library Commands:
  /import <path>        Copy a file or folder into the library
  /library              Use the whole library as source and list it
  /favorites            Use favorites as source and list them
  /playlist [name]      Use a playlist as source, or list playlists
  /newpl <name>         Create a playlist
  /pladd <name> <n>     Add listed track n to a playlist
  /fav [n]              Toggle favorite on track n or the current track

Playback Commands:
  /play [n]             Play listed track n, or toggle play/pause
  /pause                Toggle play/pause
  /stop                 Stop playback
  /next  /prev          Next or previous track
  /seek <time>          Seek to position (e.g., 1:30)
  /fwd  /back           Skip 10 seconds
  /rate [x]             Set rate 0.5-2.0, or step through presets
  /vol [0-100]          Set volume
  /sleep [min|off]      Sleep timer (15, 30, 45, 60, 90, 120)
  /shuffle              Toggle shuffle
  /repeat [mode]        Set repeat (off/one/all), or cycle it
  /silence [on|off]     Skip trailing silence
  /interrupt [phase]    Simulate a host interruption (begin, end, end-paused)

Other Commands:
  /status               Show what is playing
  /queue                Show the play queue
  /help                 Show this help
  /quit                 Exit flexplay"#
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_import() {
        let cmd = Command::parse( "/import /music/My Album" ).unwrap();
        assert_eq!( cmd, Command::Import { path: PathBuf::from( "/music/My Album" ) } );
    }


    #[test]
    fn test_parse_play_index_is_zero_based() {
        assert_eq!( Command::parse( "play 3" ).unwrap(), Command::Play { index: Some( 2 ) } );
        assert_eq!( Command::parse( "p" ).unwrap(), Command::Play { index: None } );
        assert!( matches!( Command::parse( "play 0" ), Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_pladd_with_spaces_in_name() {
        let cmd = Command::parse( "pladd Late Night 4" ).unwrap();
        assert_eq!( cmd, Command::AddToPlaylist { name: "Late Night".into(), index: 3 } );
    }


    #[test]
    fn test_parse_seek() {
        assert_eq!( Command::parse( "seek 1:30" ).unwrap(), Command::Seek { position: Duration::from_secs( 90 ) } );
        assert_eq!( Command::parse( "seek 45" ).unwrap(), Command::Seek { position: Duration::from_secs( 45 ) } );
        assert_eq!( Command::parse( "seek 1:00:05" ).unwrap(), Command::Seek { position: Duration::from_secs( 3605 ) } );
        assert!( Command::parse( "seek 1:x" ).is_err() );
    }


    #[test]
    fn test_parse_time_rejects_overflow() {
        assert!( matches!( parse_time( "999999999999999999:0:0" ), Err( CommandError::InvalidArgument( _ ) ) ) );
        assert!( matches!( parse_time( "18446744073709551615:0" ), Err( CommandError::InvalidArgument( _ ) ) ) );
        assert!( matches!( parse_time( "1:2:3:4" ), Err( CommandError::InvalidArgument( _ ) ) ) );
        assert_eq!( parse_time( "18446744073709551615" ).unwrap(), Duration::from_secs( u64::MAX ) );
    }


    #[test]
    fn test_parse_rate() {
        assert_eq!( Command::parse( "rate 1.5x" ).unwrap(), Command::Rate { rate: Some( 1.5 ) } );
        assert_eq!( Command::parse( "rate" ).unwrap(), Command::Rate { rate: None } );
        assert!( Command::parse( "rate -1" ).is_err() );
    }


    #[test]
    fn test_parse_sleep() {
        assert_eq!( Command::parse( "sleep 30" ).unwrap(), Command::Sleep { arg: SleepArg::Minutes( 30 ) } );
        assert_eq!( Command::parse( "sleep off" ).unwrap(), Command::Sleep { arg: SleepArg::Off } );
        assert_eq!( Command::parse( "sleep" ).unwrap(), Command::Sleep { arg: SleepArg::Status } );
    }


    #[test]
    fn test_parse_sleep_rejects_huge_minutes() {
        assert_eq!(
            Command::parse( "sleep 1440" ).unwrap(),
            Command::Sleep { arg: SleepArg::Minutes( MAX_SLEEP_MINUTES ) }
        );
        assert!( matches!( Command::parse( "sleep 1441" ), Err( CommandError::InvalidArgument( _ ) ) ) );
        assert!( matches!(
            Command::parse( "sleep 18446744073709551615" ),
            Err( CommandError::InvalidArgument( _ ) )
        ));
    }


    #[test]
    fn test_parse_interrupt() {
        assert_eq!( Command::parse( "interrupt" ).unwrap(), Command::Interrupt { phase: InterruptPhase::Begin } );
        assert_eq!(
            Command::parse( "/int end" ).unwrap(),
            Command::Interrupt { phase: InterruptPhase::End { resume: true } }
        );
        assert_eq!(
            Command::parse( "interrupt end-paused" ).unwrap(),
            Command::Interrupt { phase: InterruptPhase::End { resume: false } }
        );
        assert!( Command::parse( "interrupt later" ).is_err() );
    }


    #[test]
    fn test_parse_repeat() {
        assert_eq!( Command::parse( "repeat all" ).unwrap(), Command::Repeat { mode: Some( RepeatModeArg::All ) } );
        assert_eq!( Command::parse( "repeat" ).unwrap(), Command::Repeat { mode: None } );
        assert_eq!( RepeatMode::from( RepeatModeArg::Off ), RepeatMode::None );
    }


    #[test]
    fn test_parse_silence() {
        assert_eq!( Command::parse( "silence on" ).unwrap(), Command::Silence { enabled: Some( true ) } );
        assert!( Command::parse( "silence maybe" ).is_err() );
    }


    #[test]
    fn test_parse_unknown() {
        assert!( matches!( Command::parse( "foobar" ), Err( CommandError::Unknown( _ ) ) ) );
        assert!( matches!( Command::parse( "   " ), Err( CommandError::Unknown( _ ) ) ) );
    }


    #[test]
    fn test_parse_missing_arg() {
        assert!( matches!( Command::parse( "import" ), Err( CommandError::MissingArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "pladd Mix" ), Err( CommandError::MissingArgument( _ ) ) ) );
    }


    #[test]
    fn test_format_time() {
        assert_eq!( format_time( 0.0 ), "0:00" );
        assert_eq!( format_time( 125.7 ), "2:05" );
    }
}
