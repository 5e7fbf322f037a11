//! FlexPlay CLI - Command-prompt music player

mod cli;
mod media_controls;
mod settings;
mod store;

use std::io::{ self, BufRead, Write };
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{ Context, Result };
use clap::Parser;

use cli::Args;
use settings::Settings;
use store::{ LibraryStore, SharedStore, Source };

use flexplay_core::{
    command::{ self, format_time, InterruptPhase, SleepArg },
    control::{ self, Control, ControlHandle, SessionSnapshot },
    coordinator::{ Coordinator, PlaybackState, PlayerEvent, MAX_SLEEP_TIMER, RATE_PRESETS, SLEEP_PRESETS_MINUTES },
    library::{ managed_import_dir, Importer },
    AudioEngine, BookmarkHost, ChannelSink, Command, FileResolver, NowPlayingSink, NullSink, PathBookmarks,
    RepeatMode, TrackReference,
};


/// How long to wait for the control thread before reporting on a command.
const SETTLE: Duration = Duration::from_millis( 150 );


/// Application state for the prompt.
struct App {
    control: ControlHandle,
    store: SharedStore,
    importer: Importer,
    settings: Settings,
    media_thread: Option<thread::JoinHandle<()>>,
    should_quit: bool,
}


impl App {
    fn new( args: &Args, settings: Settings ) -> Result<Self> {
        let managed_dir = args.library_dir.clone()
            .or_else( || settings.library_dir.clone() )
            .or_else( managed_import_dir )
            .context( "No directory available for the managed library" )?;
        let catalog_path = LibraryStore::default_path().context( "No data directory for the catalog" )?;

        let mut library = LibraryStore::open( &catalog_path, &managed_dir )?;
        let repaired = library.validate();
        if repaired > 0 {
            tracing::info!( "Validated catalog, {} record(s) fixed", repaired );
            library.save()?;
        }
        let store = SharedStore::new( library );

        let host: Arc<dyn BookmarkHost> = Arc::new( PathBookmarks );
        let importer = Importer::new( managed_dir.clone(), Arc::clone( &host ) );

        let media_enabled = settings.smtc_enabled && !args.no_media_controls;
        let ( now_playing_tx, now_playing_rx ) = std::sync::mpsc::channel();
        let catalog = store.clone();
        let resolver = FileResolver::new( host, managed_dir );
        let mut options = settings.playback_options();
        options.skip_silence |= args.skip_silence;

        let control = control::spawn( move || {
            let sink: Box<dyn NowPlayingSink> = if media_enabled {
                Box::new( ChannelSink::new( now_playing_tx ) )
            } else {
                Box::new( NullSink )
            };
            Coordinator::new( AudioEngine::new(), catalog, resolver, sink, options )
        })?;

        let media_thread = if media_enabled {
            Some( media_controls::spawn( control.sender(), now_playing_rx )? )
        } else {
            None
        };

        let mut app = Self { control, store, importer, settings, media_thread, should_quit: false };

        if !args.files.is_empty() {
            app.import_and_play( &args.files );
        }

        Ok( app )
    }


    fn import_and_play( &mut self, paths: &[std::path::PathBuf] ) {
        let mut first = None;
        for path in paths {
            match self.store.import( &self.importer, path ) {
                Ok( ids ) => first = first.or( ids.first().copied() ),
                Err( e ) => println!( "Could not import {}: {}", path.display(), e ),
            }
        }

        let Some( first ) = first else {
            return;
        };
        if let Err( e ) = self.store.write().set_source( Source::Library ) {
            println!( "Error: {}", e );
            return;
        }
        let index = self.store.read().current_source().iter().position( |t| t.id == first );
        if let Some( index ) = index {
            self.send( Control::PlayFromSource { index } );
        }
    }


    fn execute_command( &mut self, input: &str ) {
        match Command::parse( input ) {
            Ok( cmd ) => {
                if let Err( e ) = self.run_command( cmd ) {
                    println!( "Error: {}", e );
                }
            }
            Err( e ) => println!( "{}", e ),
        }
    }


    fn run_command( &mut self, cmd: Command ) -> Result<()> {
        match cmd {
            Command::Import { path } => {
                let ids = self.store.import( &self.importer, &path )?;
                println!( "Imported {} track(s)", ids.len() );
            }
            Command::Library => {
                self.store.write().set_source( Source::Library )?;
                self.print_source();
            }
            Command::Favorites => {
                self.store.write().set_source( Source::Favorites )?;
                self.print_source();
            }
            Command::Playlist { name: Some( name ) } => {
                self.store.write().set_source( Source::Playlist( name ) )?;
                self.print_source();
            }
            Command::Playlist { name: None } => {
                let store = self.store.read();
                if store.playlists().is_empty() {
                    println!( "No playlists. Create one with /newpl <name>" );
                }
                for playlist in store.playlists() {
                    println!( "  {} ({} tracks)", playlist.name, playlist.tracks.len() );
                }
            }
            Command::NewPlaylist { name } => {
                self.store.write().create_playlist( &name )?;
                println!( "Created playlist '{}'", name );
            }
            Command::AddToPlaylist { name, index } => {
                let track = self.source_track( index )?;
                self.store.write().add_to_playlist( &name, track.id )?;
                println!( "Added \"{}\" to '{}'", track.title, name );
            }
            Command::Fav { index } => {
                let id = match index {
                    Some( index ) => self.source_track( index )?.id,
                    None => self.control.snapshot().current_track.context( "Nothing is playing" )?.id,
                };
                let track = self.store.write().toggle_favorite( id )?;
                println!( "{} \"{}\"", if track.is_favorite { "Favorited" } else { "Unfavorited" }, track.title );
            }

            Command::Play { index: Some( index ) } => {
                self.source_track( index )?;
                self.send( Control::PlayFromSource { index } );
            }
            Command::Play { index: None } | Command::Pause => self.send( Control::TogglePlayPause ),
            Command::Stop => self.send( Control::Stop ),
            Command::Next => self.send( Control::Next ),
            Command::Prev => self.send( Control::Previous ),
            Command::Seek { position } => self.send( Control::Seek( position.as_secs_f64() ) ),
            Command::Forward => self.send( Control::SkipForward ),
            Command::Back => self.send( Control::SkipBackward ),
            Command::Rate { rate } => {
                let rate = rate.unwrap_or_else( || next_rate_preset( self.control.snapshot().rate ) );
                self.send( Control::SetRate( rate ) );
            }
            Command::Volume { level: Some( level ) } => {
                self.send( Control::SetVolume( level.min( 100 ) as f32 / 100.0 ) );
            }
            Command::Volume { level: None } => {
                println!( "Volume: {}%", ( self.control.snapshot().volume * 100.0 ).round() );
            }
            Command::Sleep { arg: SleepArg::Minutes( 0 ) } | Command::Sleep { arg: SleepArg::Off } => {
                self.send( Control::SetSleepTimer( None ) );
            }
            Command::Sleep { arg: SleepArg::Minutes( minutes ) } => {
                self.send( Control::SetSleepTimer( Some( sleep_duration( minutes ) ) ) );
            }
            Command::Sleep { arg: SleepArg::Status } => {
                match self.control.snapshot().sleep_remaining {
                    Some( remaining ) => println!( "Sleeping in {}", format_time( remaining.as_secs_f64() ) ),
                    None => println!( "Sleep timer off. Presets: {:?} minutes", SLEEP_PRESETS_MINUTES ),
                }
            }
            Command::Shuffle => self.send( Control::ToggleShuffle ),
            Command::Repeat { mode: Some( mode ) } => self.send( Control::SetRepeat( mode.into() ) ),
            Command::Repeat { mode: None } => self.send( Control::CycleRepeat ),
            Command::Silence { enabled } => {
                let enabled = enabled.unwrap_or( !self.control.snapshot().skip_silence );
                self.settings.skip_silence = enabled;
                self.settings.save();
                self.send( Control::SetSkipSilence( enabled ) );
            }
            Command::Interrupt { phase } => self.send( Control::Event( interruption_event( phase ) ) ),

            Command::Status => println!( "{}", status_line( &self.control.snapshot() ) ),
            Command::Queue => self.print_queue(),
            Command::Help => println!( "{}", command::help_text() ),
            Command::Quit => self.should_quit = true,
        }
        Ok(())
    }


    /// Sends a control message and reports the outcome once it has been applied.
    fn send( &self, control: Control ) {
        if !self.control.send( control ) {
            println!( "Playback has stopped" );
            return;
        }
        thread::sleep( SETTLE );
        let snapshot = self.control.snapshot();
        match snapshot.last_error {
            Some( ref error ) => println!( "Error: {}", error ),
            None => println!( "{}", status_line( &snapshot ) ),
        }
    }


    fn source_track( &self, index: usize ) -> Result<TrackReference> {
        self.store.read()
            .current_source()
            .get( index )
            .cloned()
            .with_context( || format!( "No track {}", index + 1 ) )
    }


    fn print_source( &self ) {
        let store = self.store.read();
        let tracks = store.current_source();
        println!( "{:?}: {} track(s)", store.source(), tracks.len() );
        for ( i, track ) in tracks.iter().enumerate() {
            println!( "{}", track_line( i, track ) );
        }
    }


    fn print_queue( &self ) {
        let snapshot = self.control.snapshot();
        if snapshot.queue.is_empty() {
            println!( "Queue is empty" );
            return;
        }
        for ( i, track ) in snapshot.queue.iter().enumerate() {
            let marker = if i == snapshot.cursor && snapshot.current_track.is_some() { ">" } else { " " };
            println!( "{}{}", marker, track_line( i, track ) );
        }
    }


    fn shutdown( self ) {
        self.control.shutdown();
        if let Some( media_thread ) = self.media_thread {
            if media_thread.join().is_err() {
                tracing::error!( "Media controls thread panicked" );
            }
        }
    }
}


/// The rate preset after `current`, wrapping to the slowest.
fn next_rate_preset( current: f32 ) -> f32 {
    RATE_PRESETS
        .iter()
        .copied()
        .find( |preset| *preset > current + 1e-3 )
        .unwrap_or( RATE_PRESETS[ 0 ] )
}


fn sleep_duration( minutes: u64 ) -> Duration {
    minutes
        .checked_mul( 60 )
        .map_or( MAX_SLEEP_TIMER, Duration::from_secs )
        .min( MAX_SLEEP_TIMER )
}


/// Host interruption that the `interrupt` command stands in for.
fn interruption_event( phase: InterruptPhase ) -> PlayerEvent {
    match phase {
        InterruptPhase::Begin => PlayerEvent::InterruptionBegan,
        InterruptPhase::End { resume } => PlayerEvent::InterruptionEnded { should_resume: resume },
    }
}


fn track_line( index: usize, track: &TrackReference ) -> String {
    format!(
        " {:>3}. {}{} - {} [{}]",
        index + 1,
        if track.is_favorite { "* " } else { "" },
        track.title,
        track.artist,
        format_time( track.duration_secs ),
    )
}


fn status_line( snapshot: &SessionSnapshot ) -> String {
    let state = match snapshot.state {
        PlaybackState::Idle => "Stopped",
        PlaybackState::Loading => "Loading",
        PlaybackState::Playing => "Playing",
        PlaybackState::Paused => "Paused",
        PlaybackState::Interrupted => "Interrupted",
    };
    let track = match snapshot.current_track {
        Some( ref track ) => format!( "{} - {}", track.title, track.artist ),
        None => "nothing".to_string(),
    };
    let repeat = match snapshot.repeat {
        RepeatMode::None => "off",
        RepeatMode::One => "one",
        RepeatMode::All => "all",
    };

    let mut line = format!(
        "{}: {} [{} / {}] rate {:.2}x vol {:.0}% repeat {} shuffle {}",
        state,
        track,
        format_time( snapshot.position_secs ),
        format_time( snapshot.total_secs ),
        snapshot.rate,
        snapshot.volume * 100.0,
        repeat,
        if snapshot.shuffled { "on" } else { "off" },
    );
    if snapshot.skip_silence {
        line.push_str( " skip-silence" );
    }
    if snapshot.playing_favorites {
        line.push_str( " (favorites)" );
    }
    if let Some( remaining ) = snapshot.sleep_remaining {
        line.push_str( &format!( " sleep {}", format_time( remaining.as_secs_f64() ) ) );
    }
    line
}


fn init_logging( level: &str ) {
    let level = level.parse::<tracing::Level>().unwrap_or( tracing::Level::WARN );
    tracing_subscriber::fmt()
        .with_max_level( level )
        .with_writer( io::stderr )
        .init();
}


fn main() -> Result<()> {
    let args = Args::parse();
    let settings = Settings::load();
    init_logging( args.log_level().unwrap_or( &settings.log_level ) );

    let mut app = App::new( &args, settings )?;
    println!( "FlexPlay. Type /help for commands." );

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    while !app.should_quit {
        print!( "> " );
        io::stdout().flush()?;

        let Some( line ) = lines.next() else {
            break;
        };
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        app.execute_command( &line );
    }

    app.shutdown();
    Ok(())
}


#[cfg( test )]
mod tests {
    use super::*;
    use flexplay_core::TrackId;


    #[test]
    fn test_next_rate_preset() {
        assert_eq!( next_rate_preset( 1.0 ), 1.25 );
        assert_eq!( next_rate_preset( 1.1 ), 1.25 );
        assert_eq!( next_rate_preset( 2.0 ), 0.5 );
    }


    #[test]
    fn test_sleep_duration_saturates() {
        assert_eq!( sleep_duration( 30 ), Duration::from_secs( 1800 ) );
        assert_eq!( sleep_duration( u64::MAX ), MAX_SLEEP_TIMER );
        assert_eq!( sleep_duration( u64::MAX / 60 + 1 ), MAX_SLEEP_TIMER );
    }


    #[test]
    fn test_interrupt_maps_to_host_events() {
        assert!( matches!( interruption_event( InterruptPhase::Begin ), PlayerEvent::InterruptionBegan ) );
        assert!( matches!(
            interruption_event( InterruptPhase::End { resume: false } ),
            PlayerEvent::InterruptionEnded { should_resume: false }
        ));
    }


    #[test]
    fn test_track_line_marks_favorites() {
        let mut track = TrackReference::new( TrackId( 1 ), "/music/Song.mp3" );
        track.duration_secs = 65.0;
        assert_eq!( track_line( 0, &track ), "   1. Song - Unknown Artist [1:05]" );
        track.is_favorite = true;
        assert!( track_line( 0, &track ).contains( "* Song" ) );
    }


    #[test]
    fn test_status_line() {
        let snapshot = SessionSnapshot {
            state: PlaybackState::Paused,
            rate: 1.5,
            volume: 0.5,
            sleep_remaining: Some( Duration::from_secs( 90 ) ),
            ..SessionSnapshot::default()
        };
        let line = status_line( &snapshot );
        assert!( line.starts_with( "Paused: nothing" ) );
        assert!( line.contains( "rate 1.50x" ) );
        assert!( line.contains( "sleep 1:30" ) );
    }
}
