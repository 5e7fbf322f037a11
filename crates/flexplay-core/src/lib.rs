//! FlexPlay Core - Playback coordination engine
//!
//! This crate provides the playback core of the player: file resolution,
//! the play queue, silence detection, the audio transport and the
//! coordinator that drives them, plus library import and command parsing.

pub mod bridge;
pub mod catalog;
pub mod command;
pub mod control;
pub mod coordinator;
pub mod decoder;
pub mod engine;
pub mod library;
pub mod output;
pub mod queue;
pub mod resolver;
pub mod silence;
pub mod track;
pub mod transport;

#[cfg( test )]
mod testing;

pub use bridge::{ ChannelSink, CommandStatus, NowPlaying, NowPlayingSink, NowPlayingUpdate, NullSink, RemoteCommand };
pub use catalog::{ Catalog, CatalogError };
pub use command::{ Command, CommandError };
pub use control::{ Control, ControlHandle, SessionSnapshot };
pub use coordinator::{ Coordinator, PlaybackError, PlaybackOptions, PlaybackState, PlayerEvent };
pub use decoder::AudioMetadata;
pub use engine::AudioEngine;
pub use queue::{ Direction, RepeatMode };
pub use resolver::{ BookmarkHost, FileResolver, PathBookmarks };
pub use silence::SilenceParams;
pub use track::{ TrackId, TrackReference };
