//! Serialized control loop
//!
//! One thread owns the coordinator and runs a current-thread tokio runtime.
//! User commands, remote commands, host events, the position and silence
//! timers and the sleep deadline all funnel through a single `select!`, so
//! no two of them ever touch the session at once.

use std::sync::{ Arc, RwLock };
use std::thread;
use std::time::{ Duration, Instant };

use tokio::sync::mpsc::{ self, UnboundedReceiver, UnboundedSender };
use tokio::time::MissedTickBehavior;

use crate::bridge::{ self, RemoteCommand };
use crate::catalog::Catalog;
use crate::coordinator::{ Coordinator, PlaybackError, PlaybackState, PlayerEvent };
use crate::queue::RepeatMode;
use crate::track::TrackReference;
use crate::transport::Transport;


/// Position poll period.
pub const POSITION_INTERVAL: Duration = Duration::from_millis( 100 );


/// Messages accepted by the control loop.
#[derive( Debug, Clone )]
pub enum Control {
    /// Rebuild the queue from the catalog's current source and play item `index`
    PlayFromSource { index: usize },
    TogglePlayPause,
    Next,
    Previous,
    Seek( f64 ),
    SkipForward,
    SkipBackward,
    SetRate( f32 ),
    SetVolume( f32 ),
    ToggleShuffle,
    CycleRepeat,
    SetRepeat( RepeatMode ),
    SetSkipSilence( bool ),
    /// `None` cancels
    SetSleepTimer( Option<Duration> ),
    Stop,
    /// Transport and host events, including audio-session interruptions
    /// reported by whatever owns the session (the prompt's `interrupt`
    /// command on hosts without one)
    Event( PlayerEvent ),
    Remote( RemoteCommand ),
    MetadataUpdated( TrackReference ),
    Shutdown,
}


/// Read-only view of the session and queue for the UI.
#[derive( Debug, Clone, Default )]
pub struct SessionSnapshot {
    pub state: PlaybackState,
    pub current_track: Option<TrackReference>,
    pub position_secs: f64,
    pub total_secs: f64,
    pub rate: f32,
    pub volume: f32,
    pub sleep_remaining: Option<Duration>,
    pub queue: Vec<TrackReference>,
    pub cursor: usize,
    pub repeat: RepeatMode,
    pub shuffled: bool,
    pub skip_silence: bool,
    pub playing_favorites: bool,
    /// Most recent failure, cleared by the next successful command
    pub last_error: Option<String>,
}


impl SessionSnapshot {
    fn capture<T: Transport, C: Catalog>( coordinator: &Coordinator<T, C>, last_error: &Option<String> ) -> Self {
        let session = coordinator.session();
        let queue = coordinator.queue();
        Self {
            state: session.state,
            current_track: session.current_track.clone(),
            position_secs: session.position_secs,
            total_secs: session.total_secs,
            rate: session.rate,
            volume: session.volume,
            sleep_remaining: session.sleep_deadline.map( |d| d.saturating_duration_since( Instant::now() ) ),
            queue: queue.items().to_vec(),
            cursor: queue.cursor(),
            repeat: queue.repeat(),
            shuffled: queue.shuffled(),
            skip_silence: coordinator.skip_silence(),
            playing_favorites: coordinator.is_playing_favorites(),
            last_error: last_error.clone(),
        }
    }
}


/// Handle to a running control thread.
pub struct ControlHandle {
    sender: UnboundedSender<Control>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    thread: Option<thread::JoinHandle<()>>,
}


impl ControlHandle {
    /// Queues a command. Returns false once the loop has exited.
    pub fn send( &self, control: Control ) -> bool {
        self.sender.send( control ).is_ok()
    }


    /// Sender for other producers, such as the media-controls thread.
    pub fn sender( &self ) -> UnboundedSender<Control> {
        self.sender.clone()
    }


    /// Latest published snapshot.
    pub fn snapshot( &self ) -> SessionSnapshot {
        match self.snapshot.read() {
            Ok( guard ) => guard.clone(),
            Err( poisoned ) => poisoned.into_inner().clone(),
        }
    }


    /// Stops the loop and waits for the thread.
    pub fn shutdown( mut self ) {
        self.join();
    }


    fn join( &mut self ) {
        let _ = self.sender.send( Control::Shutdown );
        if let Some( thread ) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!( "Control thread panicked" );
            }
        }
    }
}


impl Drop for ControlHandle {
    fn drop( &mut self ) {
        self.join();
    }
}


/// Spawns the control thread.
///
/// The coordinator is built on that thread by `factory`, so its transport
/// need not be Send.
pub fn spawn<T, C, F>( factory: F ) -> std::io::Result<ControlHandle>
where
    T: Transport + 'static,
    C: Catalog + 'static,
    F: FnOnce() -> Coordinator<T, C> + Send + 'static,
{
    let ( sender, receiver ) = mpsc::unbounded_channel();
    let snapshot = Arc::new( RwLock::new( SessionSnapshot::default() ) );
    let shared = Arc::clone( &snapshot );

    let thread = thread::Builder::new()
        .name( "flexplay-control".into() )
        .spawn( move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                Ok( runtime ) => runtime,
                Err( e ) => {
                    tracing::error!( "Failed to start control runtime: {}", e );
                    return;
                }
            };
            runtime.block_on( run( factory(), receiver, shared ) );
        })?;

    Ok( ControlHandle { sender, snapshot, thread: Some( thread ) } )
}


/// Runs the loop until `Shutdown` arrives or every sender is dropped.
pub async fn run<T: Transport, C: Catalog>(
    mut coordinator: Coordinator<T, C>,
    mut receiver: UnboundedReceiver<Control>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
) {
    let mut position = tokio::time::interval( POSITION_INTERVAL );
    position.set_missed_tick_behavior( MissedTickBehavior::Skip );

    // Same period the detector counts with
    let check_every = coordinator.silence_params().check_interval_secs;
    let mut silence = tokio::time::interval( Duration::from_secs_f64( check_every ) );
    silence.set_missed_tick_behavior( MissedTickBehavior::Skip );

    let mut last_error = None;
    tracing::info!( "Control loop started" );

    loop {
        let deadline = coordinator.session().sleep_deadline;
        let sleep_at = deadline.map_or_else( tokio::time::Instant::now, tokio::time::Instant::from_std );

        tokio::select! {
            command = receiver.recv() => match command {
                Some( Control::Shutdown ) | None => break,
                Some( command ) => {
                    last_error = apply( &mut coordinator, command ).err().map( |e| e.to_string() );
                }
            },
            _ = position.tick() => coordinator.on_position_tick(),
            _ = silence.tick() => coordinator.on_silence_tick(),
            _ = tokio::time::sleep_until( sleep_at ), if deadline.is_some() => {
                if let Some( deadline ) = deadline {
                    coordinator.on_sleep_deadline( deadline );
                }
            }
        }

        let next = SessionSnapshot::capture( &coordinator, &last_error );
        match snapshot.write() {
            Ok( mut guard ) => *guard = next,
            Err( poisoned ) => *poisoned.into_inner() = next,
        }
    }

    coordinator.stop();
    if let Err( e ) = coordinator.flush_pending() {
        tracing::warn!( "Exiting with unsaved changes: {}", e );
    }
    tracing::info!( "Control loop stopped" );
}


/// Applies one command to the coordinator.
pub fn apply<T: Transport, C: Catalog>( coordinator: &mut Coordinator<T, C>, control: Control ) -> Result<(), PlaybackError> {
    let result = match control {
        Control::PlayFromSource { index } => coordinator.play_from_source( index ),
        Control::TogglePlayPause => coordinator.toggle_play_pause(),
        Control::Next => coordinator.next(),
        Control::Previous => coordinator.previous(),
        Control::Seek( secs ) => coordinator.seek( secs ),
        Control::SkipForward => coordinator.skip_forward(),
        Control::SkipBackward => coordinator.skip_backward(),
        Control::SetRate( rate ) => coordinator.set_rate( rate ).map( |_| () ),
        Control::SetVolume( volume ) => {
            coordinator.set_volume( volume );
            Ok(())
        }
        Control::ToggleShuffle => {
            coordinator.toggle_shuffle();
            Ok(())
        }
        Control::CycleRepeat => {
            coordinator.cycle_repeat();
            Ok(())
        }
        Control::SetRepeat( repeat ) => {
            coordinator.set_repeat( repeat );
            Ok(())
        }
        Control::SetSkipSilence( enabled ) => {
            coordinator.set_skip_silence( enabled );
            Ok(())
        }
        Control::SetSleepTimer( Some( after ) ) => {
            coordinator.set_sleep_timer( after );
            Ok(())
        }
        Control::SetSleepTimer( None ) => {
            coordinator.cancel_sleep_timer();
            Ok(())
        }
        Control::Stop => {
            coordinator.stop();
            Ok(())
        }
        Control::Event( event ) => {
            coordinator.handle_event( event );
            Ok(())
        }
        Control::Remote( command ) => {
            let status = bridge::dispatch( coordinator, command );
            tracing::debug!( "Remote {:?} -> {:?}", command, status );
            Ok(())
        }
        Control::MetadataUpdated( track ) => {
            coordinator.on_metadata_updated( &track );
            Ok(())
        }
        Control::Shutdown => Ok(()),
    };

    if let Err( ref e ) = result {
        tracing::warn!( "{}", e );
    }
    result
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use crate::bridge::NullSink;
    use crate::coordinator::PlaybackOptions;
    use crate::resolver::{ FileResolver, PathBookmarks };
    use crate::testing::{ FakeTransport, MemoryCatalog };
    use crate::track::TrackId;


    fn coordinator( dir: &Path, count: u64 ) -> Coordinator<FakeTransport, MemoryCatalog> {
        let tracks = ( 0..count )
            .map( |i| {
                let path = dir.join( format!( "{}.flac", i ) );
                fs::write( &path, b"audio" ).unwrap();
                TrackReference::new( TrackId( i ), path )
            })
            .collect();

        Coordinator::new(
            FakeTransport::new( 120.0 ),
            MemoryCatalog::new( tracks ),
            FileResolver::new( Arc::new( PathBookmarks ), dir.join( "managed" ) ),
            Box::new( NullSink ),
            PlaybackOptions::default(),
        )
    }


    fn wait_for( handle: &ControlHandle, check: impl Fn( &SessionSnapshot ) -> bool ) -> SessionSnapshot {
        for _ in 0..200 {
            let snapshot = handle.snapshot();
            if check( &snapshot ) {
                return snapshot;
            }
            thread::sleep( Duration::from_millis( 10 ) );
        }
        panic!( "Timed out waiting for snapshot: {:?}", handle.snapshot() );
    }


    #[test]
    fn test_apply_reports_errors() {
        let dir = TempDir::new().unwrap();
        let mut c = coordinator( dir.path(), 2 );

        assert!( apply( &mut c, Control::PlayFromSource { index: 5 } ).is_err() );
        assert!( apply( &mut c, Control::PlayFromSource { index: 1 } ).is_ok() );
        assert!( matches!( apply( &mut c, Control::SetRate( -1.0 ) ), Err( PlaybackError::InvalidRate( _ ) ) ) );
        assert!( apply( &mut c, Control::CycleRepeat ).is_ok() );
        assert_eq!( c.queue().repeat(), RepeatMode::All );
    }


    #[test]
    fn test_remote_commands_reach_coordinator() {
        let dir = TempDir::new().unwrap();
        let mut c = coordinator( dir.path(), 2 );
        apply( &mut c, Control::PlayFromSource { index: 0 } ).unwrap();

        apply( &mut c, Control::Remote( RemoteCommand::Pause ) ).unwrap();
        assert_eq!( c.session().state, PlaybackState::Paused );
        apply( &mut c, Control::Remote( RemoteCommand::SetPosition( 30.0 ) ) ).unwrap();
        assert_eq!( c.session().position_secs, 30.0 );
        apply( &mut c, Control::Remote( RemoteCommand::Next ) ).unwrap();
        assert_eq!( c.session().current_track.as_ref().map( |t| t.id ), Some( TrackId( 1 ) ) );
    }


    #[test]
    fn test_loop_publishes_snapshots() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let handle = spawn( move || coordinator( &root, 3 ) ).unwrap();

        handle.send( Control::PlayFromSource { index: 2 } );
        let snapshot = wait_for( &handle, |s| s.state == PlaybackState::Playing );
        assert_eq!( snapshot.cursor, 2 );
        assert_eq!( snapshot.queue.len(), 3 );

        handle.send( Control::SetSleepTimer( Some( Duration::from_secs( 600 ) ) ) );
        let snapshot = wait_for( &handle, |s| s.sleep_remaining.is_some() );
        assert!( snapshot.sleep_remaining.unwrap() <= Duration::from_secs( 600 ) );

        handle.send( Control::SetSleepTimer( None ) );
        wait_for( &handle, |s| s.sleep_remaining.is_none() );
        handle.shutdown();
    }


    #[test]
    fn test_sleep_deadline_fires_in_loop() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let handle = spawn( move || coordinator( &root, 1 ) ).unwrap();

        handle.send( Control::PlayFromSource { index: 0 } );
        wait_for( &handle, |s| s.state == PlaybackState::Playing );
        handle.send( Control::SetSleepTimer( Some( Duration::from_millis( 50 ) ) ) );
        let snapshot = wait_for( &handle, |s| s.state == PlaybackState::Paused );
        assert!( snapshot.sleep_remaining.is_none() );
    }


    #[test]
    fn test_interruption_events_reach_loop() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let handle = spawn( move || coordinator( &root, 1 ) ).unwrap();

        handle.send( Control::PlayFromSource { index: 0 } );
        wait_for( &handle, |s| s.state == PlaybackState::Playing );
        handle.send( Control::Event( PlayerEvent::InterruptionBegan ) );
        wait_for( &handle, |s| s.state == PlaybackState::Interrupted );
        handle.send( Control::Event( PlayerEvent::InterruptionEnded { should_resume: true } ) );
        wait_for( &handle, |s| s.state == PlaybackState::Playing );
        handle.shutdown();
    }


    #[test]
    fn test_errors_surface_in_snapshot() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let handle = spawn( move || coordinator( &root, 1 ) ).unwrap();

        handle.send( Control::Seek( 10.0 ) );
        let snapshot = wait_for( &handle, |s| s.last_error.is_some() );
        assert_eq!( snapshot.state, PlaybackState::Idle );
    }
}
