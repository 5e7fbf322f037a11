//! External transport bridge
//!
//! Now-Playing snapshots flow out to the host's media surface; remote
//! commands flow back in and are mapped 1:1 onto coordinator operations.
//! Audio-session interruptions are not remote commands; they enter the
//! control loop as `Control::Event`.

use std::sync::Arc;
use std::sync::mpsc::Sender;

use crate::catalog::Catalog;
use crate::coordinator::{ Coordinator, PlaybackError, PlaybackState };
use crate::queue::Direction;
use crate::transport::Transport;


/// Coarse state shown by the host surface.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum NowPlayingState {
    Playing,
    Paused,
    Stopped,
}


/// Metadata and progress pushed to the host media surface.
#[derive( Debug, Clone, PartialEq )]
pub struct NowPlaying {
    pub title: String,
    pub artist: String,
    pub artwork: Option<Arc<[u8]>>,
    pub duration_secs: f64,
    pub elapsed_secs: f64,
    /// Effective rate; 0 while not playing
    pub rate: f32,
    pub state: NowPlayingState,
}


/// Receiver of Now-Playing updates. Holds no state of its own that the coordinator reads.
pub trait NowPlayingSink {
    fn publish( &mut self, now_playing: &NowPlaying );

    /// Removes the entry, e.g. after an explicit stop.
    fn clear( &mut self );
}


/// Discards every update.
#[derive( Debug, Default )]
pub struct NullSink;


impl NowPlayingSink for NullSink {
    fn publish( &mut self, _now_playing: &NowPlaying ) {}

    fn clear( &mut self ) {}
}


/// Update forwarded by `ChannelSink`.
#[derive( Debug, Clone, PartialEq )]
pub enum NowPlayingUpdate {
    Publish( NowPlaying ),
    Clear,
}


/// Forwards updates to another thread, typically the OS media-controls thread.
pub struct ChannelSink {
    sender: Sender<NowPlayingUpdate>,
    last: Option<NowPlaying>,
}


impl ChannelSink {
    pub fn new( sender: Sender<NowPlayingUpdate> ) -> Self {
        Self { sender, last: None }
    }


    fn send( &self, update: NowPlayingUpdate ) {
        if self.sender.send( update ).is_err() {
            tracing::debug!( "Now-playing receiver is gone" );
        }
    }
}


impl NowPlayingSink for ChannelSink {
    fn publish( &mut self, now_playing: &NowPlaying ) {
        // Position ticks republish unchanged snapshots
        if self.last.as_ref() == Some( now_playing ) {
            return;
        }
        self.last = Some( now_playing.clone() );
        self.send( NowPlayingUpdate::Publish( now_playing.clone() ) );
    }


    fn clear( &mut self ) {
        self.last = None;
        self.send( NowPlayingUpdate::Clear );
    }
}


/// Commands the host media surface can issue.
#[derive( Debug, Clone, Copy, PartialEq )]
pub enum RemoteCommand {
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    SeekForward,
    SeekBackward,
    /// Absolute position in seconds
    SetPosition( f64 ),
}


/// Result reported back to the host for a remote command.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum CommandStatus {
    Success,
    NoActionableItem,
    CommandFailed,
}


impl From<Result<(), PlaybackError>> for CommandStatus {
    fn from( result: Result<(), PlaybackError> ) -> Self {
        match result {
            Ok(()) => CommandStatus::Success,
            Err( PlaybackError::NoTrack | PlaybackError::QueueExhausted( _ ) ) => CommandStatus::NoActionableItem,
            Err( e ) => {
                tracing::warn!( "Remote command failed: {}", e );
                CommandStatus::CommandFailed
            }
        }
    }
}


/// Applies a remote command to the coordinator.
pub fn dispatch<T: Transport, C: Catalog>( coordinator: &mut Coordinator<T, C>, command: RemoteCommand ) -> CommandStatus {
    tracing::debug!( "Remote command: {:?}", command );

    let state = coordinator.session().state;
    match command {
        RemoteCommand::Play => match state {
            PlaybackState::Playing => CommandStatus::Success,
            PlaybackState::Paused | PlaybackState::Interrupted => coordinator.resume().into(),
            _ => coordinator.toggle_play_pause().into(),
        },
        RemoteCommand::Pause => match state {
            PlaybackState::Playing => coordinator.pause().into(),
            PlaybackState::Paused => CommandStatus::Success,
            _ => CommandStatus::NoActionableItem,
        },
        RemoteCommand::Toggle => coordinator.toggle_play_pause().into(),
        RemoteCommand::Next => coordinator.advance( Direction::Forward ).into(),
        RemoteCommand::Previous => coordinator.advance( Direction::Backward ).into(),
        RemoteCommand::SeekForward => coordinator.skip_forward().into(),
        RemoteCommand::SeekBackward => coordinator.skip_backward().into(),
        RemoteCommand::SetPosition( secs ) => coordinator.seek( secs ).into(),
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::mpsc;


    fn snapshot( elapsed: f64 ) -> NowPlaying {
        NowPlaying {
            title: "Song".into(),
            artist: "Artist".into(),
            artwork: None,
            duration_secs: 100.0,
            elapsed_secs: elapsed,
            rate: 1.0,
            state: NowPlayingState::Playing,
        }
    }


    #[test]
    fn test_channel_sink_skips_duplicates() {
        let ( tx, rx ) = mpsc::channel();
        let mut sink = ChannelSink::new( tx );
        sink.publish( &snapshot( 1.0 ) );
        sink.publish( &snapshot( 1.0 ) );
        sink.publish( &snapshot( 1.1 ) );
        sink.clear();

        let updates: Vec<_> = rx.try_iter().collect();
        assert_eq!( updates.len(), 3 );
        assert_eq!( updates[ 2 ], NowPlayingUpdate::Clear );
    }


    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let ( tx, rx ) = mpsc::channel();
        drop( rx );
        let mut sink = ChannelSink::new( tx );
        sink.publish( &snapshot( 0.0 ) );
        sink.clear();
    }


    #[test]
    fn test_status_from_result() {
        assert_eq!( CommandStatus::from( Ok(()) ), CommandStatus::Success );
        assert_eq!( CommandStatus::from( Err( PlaybackError::NoTrack ) ), CommandStatus::NoActionableItem );
        assert_eq!( CommandStatus::from( Err( PlaybackError::InvalidRate( 0.0 ) ) ), CommandStatus::CommandFailed );
    }
}
