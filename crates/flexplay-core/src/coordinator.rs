//! Playback coordinator
//!
//! Owns the single open transport, the scoped file access that goes with it,
//! the queue and the silence detector, and drives them through one state
//! machine:
//!
//! ```text
//! Idle → Loading → Playing ⇄ Paused
//! Playing | Paused → Interrupted → Playing | Paused
//! any → Idle on stop or failed load
//! ```
//!
//! Every entry point takes `&mut self`, so callers serialize access; the
//! control loop in `control` is the intended owner.

use std::path::PathBuf;
use std::time::{ Duration, Instant };

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::bridge::{ NowPlaying, NowPlayingSink, NowPlayingState };
use crate::catalog::{ Catalog, WriteBack };
use crate::queue::{ Direction, PlaybackQueue, QueueExhausted, RepeatMode };
use crate::resolver::{ FileResolver, ReadableHandle, ResolveError };
use crate::silence::{ SilenceDetector, SilenceParams };
use crate::track::TrackReference;
use crate::transport::Transport;


/// Relative seek step for skip forward/backward.
pub const SKIP_STEP_SECS: f64 = 10.0;

/// Slowest supported playback rate.
pub const MIN_RATE: f32 = 0.5;

/// Fastest supported playback rate.
pub const MAX_RATE: f32 = 2.0;

/// Rates offered by the rate picker.
pub const RATE_PRESETS: [f32; 7] = [ 0.5, 0.75, 1.0, 1.25, 1.5, 1.75, 2.0 ];

/// Sleep timer presets in minutes.
pub const SLEEP_PRESETS_MINUTES: [u64; 6] = [ 15, 30, 45, 60, 90, 120 ];

/// Longest sleep timer; longer requests are shortened to this.
pub const MAX_SLEEP_TIMER: Duration = Duration::from_secs( 24 * 60 * 60 );


/// Errors surfaced by coordinator operations.
///
/// None of them are fatal: the session is always left in a usable state.
#[derive( Debug, Error )]
pub enum PlaybackError {
    #[error( "Couldn't play, file missing: {0}" )]
    FileMissing( PathBuf ),

    #[error( "Couldn't play, transport rejected the file: {0}" )]
    TransportOpenFailed( String ),

    #[error( "{0} catalog write(s) still pending" )]
    PersistenceWriteFailed( usize ),

    #[error( transparent )]
    QueueExhausted( #[from] QueueExhausted ),

    #[error( "No track loaded" )]
    NoTrack,

    #[error( "Invalid playback rate: {0}" )]
    InvalidRate( f32 ),
}


/// Coordinator state.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum PlaybackState {
    #[default]
    Idle,
    Loading,
    Playing,
    Paused,
    Interrupted,
}


/// Asynchronous notifications from the transport and the host.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum PlayerEvent {
    /// The transport reached end of file
    NaturalEnd,
    /// The silence detector declared the track over
    SilenceEnd,
    /// Another client claimed audio focus
    InterruptionBegan,
    InterruptionEnded { should_resume: bool },
}


/// Live session state, readable by the UI.
#[derive( Debug, Clone, PartialEq )]
pub struct PlaybackSession {
    pub state: PlaybackState,
    pub current_track: Option<TrackReference>,
    pub position_secs: f64,
    pub total_secs: f64,
    /// Survives track changes
    pub rate: f32,
    /// Survives track changes
    pub volume: f32,
    /// Survives track changes
    pub sleep_deadline: Option<Instant>,
}


/// Session-scoped preferences.
#[derive( Debug, Clone, Copy, PartialEq )]
pub struct PlaybackOptions {
    pub skip_silence: bool,
    pub silence: SilenceParams,
    pub rate: f32,
    pub volume: f32,
}


impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            skip_silence: false,
            silence: SilenceParams::default(),
            rate: 1.0,
            volume: 1.0,
        }
    }
}


/// The playback coordinator.
pub struct Coordinator<T: Transport, C: Catalog> {
    transport: T,
    catalog: C,
    resolver: FileResolver,
    queue: PlaybackQueue,
    detector: SilenceDetector,
    write_back: WriteBack,
    sink: Box<dyn NowPlayingSink>,
    session: PlaybackSession,
    /// Access grant for the open file; dropped only after the transport closes
    media: Option<ReadableHandle>,
    position_timer: bool,
    silence_timer: bool,
    skip_silence: bool,
    resume_after_interruption: bool,
    playing_favorites: bool,
}


impl<T: Transport, C: Catalog> Coordinator<T, C> {
    pub fn new(
        transport: T,
        catalog: C,
        resolver: FileResolver,
        sink: Box<dyn NowPlayingSink>,
        options: PlaybackOptions,
    ) -> Self {
        let rate = if options.rate.is_finite() && options.rate > 0.0 {
            options.rate.clamp( MIN_RATE, MAX_RATE )
        } else {
            1.0
        };

        Self {
            transport,
            catalog,
            resolver,
            queue: PlaybackQueue::new(),
            detector: SilenceDetector::new( options.silence ),
            write_back: WriteBack::new(),
            sink,
            session: PlaybackSession {
                state: PlaybackState::Idle,
                current_track: None,
                position_secs: 0.0,
                total_secs: 0.0,
                rate,
                volume: options.volume.clamp( 0.0, 1.0 ),
                sleep_deadline: None,
            },
            media: None,
            position_timer: false,
            silence_timer: false,
            skip_silence: options.skip_silence,
            resume_after_interruption: false,
            playing_favorites: false,
        }
    }


    pub fn session( &self ) -> &PlaybackSession {
        &self.session
    }


    pub fn queue( &self ) -> &PlaybackQueue {
        &self.queue
    }


    pub fn catalog( &self ) -> &C {
        &self.catalog
    }


    pub fn catalog_mut( &mut self ) -> &mut C {
        &mut self.catalog
    }


    pub fn transport( &self ) -> &T {
        &self.transport
    }


    pub fn transport_mut( &mut self ) -> &mut T {
        &mut self.transport
    }


    pub fn silence_params( &self ) -> &SilenceParams {
        self.detector.params()
    }


    /// True when the queue was filled by the random-favorite fallback.
    pub fn is_playing_favorites( &self ) -> bool {
        self.playing_favorites
    }


    pub fn skip_silence( &self ) -> bool {
        self.skip_silence
    }


    /// Turns silence skipping on or off, taking effect on the playing track.
    pub fn set_skip_silence( &mut self, enabled: bool ) {
        self.skip_silence = enabled;
        if self.session.state == PlaybackState::Playing {
            self.start_silence_timer();
        }
    }


    /// Number of catalog writes waiting for a retry.
    pub fn pending_writes( &self ) -> usize {
        self.write_back.pending()
    }


    /// Retries pending catalog writes.
    pub fn flush_pending( &mut self ) -> Result<(), PlaybackError> {
        match self.write_back.flush( &mut self.catalog ) {
            0 => Ok(()),
            pending => Err( PlaybackError::PersistenceWriteFailed( pending ) ),
        }
    }


    /// Replaces the queue with the catalog's current source and plays item `index`.
    pub fn play_from_source( &mut self, index: usize ) -> Result<(), PlaybackError> {
        let items = self.catalog.all_tracks_in_current_source();
        let track = items.get( index ).cloned().ok_or( PlaybackError::NoTrack )?;
        self.queue.set_playlist( items );
        self.playing_favorites = false;
        self.load( track )
    }


    /// Tears down whatever is open and starts `track` from zero.
    ///
    /// On failure the session is Idle, `current_track` holds the attempted
    /// track for display and nothing is open.
    pub fn load( &mut self, track: TrackReference ) -> Result<(), PlaybackError> {
        self.teardown();

        let mut track = track;
        self.session.state = PlaybackState::Loading;
        self.session.position_secs = 0.0;
        self.session.total_secs = track.duration_secs.max( 0.0 );
        self.session.current_track = Some( track.clone() );

        let resolved = match self.resolver.resolve( &mut track ) {
            Ok( resolved ) => resolved,
            Err( e ) => {
                tracing::warn!( "Couldn't play {}: {}", track.id, e );
                let path = match e {
                    ResolveError::FileMissing( path ) => path,
                    ResolveError::Bookmark( _ ) => track.primary_path.clone(),
                };
                self.fail_load( track );
                return Err( PlaybackError::FileMissing( path ) );
            }
        };

        if !resolved.repairs.is_empty() {
            tracing::debug!( "Resolver repairs for {}: {:?}", track.id, resolved.repairs );
            self.persist( &track );
        }

        let duration = match self.transport.open( resolved.handle.path() ) {
            Ok( duration ) => duration,
            Err( e ) => {
                tracing::warn!( "Transport rejected {:?}: {}", resolved.handle.path(), e );
                drop( resolved );
                self.fail_load( track );
                return Err( PlaybackError::TransportOpenFailed( e.to_string() ) );
            }
        };
        self.media = Some( resolved.handle );

        if duration > 0.0 && ( duration - track.duration_secs ).abs() > 1e-3 {
            tracing::debug!( "Measured duration of {}: {:.2}s (was {:.2}s)", track.id, duration, track.duration_secs );
            track.duration_secs = duration;
        }
        track.play_count += 1;
        self.persist( &track );

        self.transport.set_rate( self.session.rate );
        self.transport.set_volume( self.session.volume );
        self.transport.play();

        self.queue.set_current( track.id );
        self.queue.refresh( &track );

        tracing::info!( "Playing {} \"{}\" by {}", track.id, track.title, track.artist );
        self.session.total_secs = track.duration_secs;
        self.session.current_track = Some( track );
        self.session.state = PlaybackState::Playing;
        self.start_timers();
        self.publish();

        Ok(())
    }


    fn fail_load( &mut self, track: TrackReference ) {
        self.teardown();
        self.session.current_track = Some( track );
        self.session.state = PlaybackState::Idle;
        self.sink.clear();
    }


    /// Plays or pauses; with nothing loaded, plays a random favorite.
    pub fn toggle_play_pause( &mut self ) -> Result<(), PlaybackError> {
        match self.session.state {
            PlaybackState::Playing => self.pause(),
            PlaybackState::Paused | PlaybackState::Interrupted => self.resume(),
            PlaybackState::Loading => Ok(()),
            PlaybackState::Idle => match self.session.current_track.clone() {
                Some( track ) => self.load( track ),
                None => self.play_random_favorite(),
            },
        }
    }


    /// Loads a uniformly drawn favorite and makes the favorites the queue.
    ///
    /// No-op when there are no favorites.
    pub fn play_random_favorite( &mut self ) -> Result<(), PlaybackError> {
        let favorites = self.catalog.fetch_favorites();
        let Some( choice ) = favorites.choose( &mut rand::thread_rng() ).cloned() else {
            tracing::info!( "No favorites to play" );
            return Ok(());
        };

        self.queue.set_playlist( favorites );
        self.playing_favorites = true;
        self.load( choice )
    }


    /// Pauses a playing track.
    pub fn pause( &mut self ) -> Result<(), PlaybackError> {
        if self.session.state != PlaybackState::Playing {
            return Ok(());
        }
        self.transport.pause();
        self.session.position_secs = self.clamped_position();
        self.stop_timers();
        self.session.state = PlaybackState::Paused;
        self.publish();
        Ok(())
    }


    /// Resumes a paused or interrupted track.
    pub fn resume( &mut self ) -> Result<(), PlaybackError> {
        match self.session.state {
            PlaybackState::Paused | PlaybackState::Interrupted if self.media.is_some() => {
                self.transport.play();
                self.resume_after_interruption = false;
                self.session.state = PlaybackState::Playing;
                self.start_timers();
                self.publish();
                Ok(())
            }
            PlaybackState::Playing => Ok(()),
            _ => Err( PlaybackError::NoTrack ),
        }
    }


    /// Tears everything down and forgets the current track.
    pub fn stop( &mut self ) {
        self.teardown();
        self.session.current_track = None;
        self.session.position_secs = 0.0;
        self.session.total_secs = 0.0;
        self.session.state = PlaybackState::Idle;
        self.resume_after_interruption = false;
        self.playing_favorites = false;
        self.sink.clear();
        tracing::info!( "Stopped" );
    }


    /// Seeks to `secs`, clamped to the track bounds.
    pub fn seek( &mut self, secs: f64 ) -> Result<(), PlaybackError> {
        if self.media.is_none() {
            return Err( PlaybackError::NoTrack );
        }

        let target = if secs.is_nan() { 0.0 } else { secs.clamp( 0.0, self.session.total_secs.max( 0.0 ) ) };
        match self.transport.seek( target ) {
            Ok(()) => self.session.position_secs = target,
            Err( e ) => {
                tracing::warn!( "Seek to {:.1}s failed: {}", target, e );
                self.session.position_secs = self.clamped_position();
            }
        }

        // Restart the silence count from the new position
        if self.detector.is_armed() {
            self.detector.arm();
        }
        self.publish();
        Ok(())
    }


    pub fn skip_forward( &mut self ) -> Result<(), PlaybackError> {
        self.seek( self.session.position_secs + SKIP_STEP_SECS )
    }


    pub fn skip_backward( &mut self ) -> Result<(), PlaybackError> {
        self.seek( self.session.position_secs - SKIP_STEP_SECS )
    }


    /// Sets the session rate.
    ///
    /// @returns The applied rate, clamped to [`MIN_RATE`, `MAX_RATE`]
    pub fn set_rate( &mut self, rate: f32 ) -> Result<f32, PlaybackError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err( PlaybackError::InvalidRate( rate ) );
        }

        let rate = rate.clamp( MIN_RATE, MAX_RATE );
        self.session.rate = rate;
        self.transport.set_rate( rate );
        self.publish();
        Ok( rate )
    }


    /// Sets the session volume, clamped to [0, 1].
    pub fn set_volume( &mut self, volume: f32 ) -> f32 {
        if !volume.is_nan() {
            self.session.volume = volume.clamp( 0.0, 1.0 );
            self.transport.set_volume( self.session.volume );
        }
        self.session.volume
    }


    /// Moves the queue cursor and loads the new current item.
    ///
    /// Leaves the session untouched when the queue is exhausted.
    pub fn advance( &mut self, direction: Direction ) -> Result<(), PlaybackError> {
        let next = self.queue.advance( direction )?.clone();
        self.load( next )
    }


    pub fn next( &mut self ) -> Result<(), PlaybackError> {
        self.advance( Direction::Forward )
    }


    pub fn previous( &mut self ) -> Result<(), PlaybackError> {
        self.advance( Direction::Backward )
    }


    /// Toggles shuffle; turning it on reorders the queue and resets its cursor.
    pub fn toggle_shuffle( &mut self ) -> bool {
        let shuffled = !self.queue.shuffled();
        self.queue.set_shuffled( shuffled );
        shuffled
    }


    /// Steps repeat mode None → All → One → None.
    pub fn cycle_repeat( &mut self ) -> RepeatMode {
        let repeat = self.queue.repeat().cycle();
        self.queue.set_repeat( repeat );
        repeat
    }


    pub fn set_repeat( &mut self, repeat: RepeatMode ) {
        self.queue.set_repeat( repeat );
    }


    /// Arms the sleep timer, replacing any earlier deadline.
    ///
    /// `after` is capped at [`MAX_SLEEP_TIMER`].
    pub fn set_sleep_timer( &mut self, after: Duration ) -> Instant {
        let after = after.min( MAX_SLEEP_TIMER );
        let now = Instant::now();
        let deadline = now.checked_add( after ).unwrap_or( now );
        self.session.sleep_deadline = Some( deadline );
        tracing::info!( "Sleep timer set for {} min", after.as_secs() / 60 );
        deadline
    }


    pub fn cancel_sleep_timer( &mut self ) {
        if self.session.sleep_deadline.take().is_some() {
            tracing::info!( "Sleep timer cancelled" );
        }
    }


    /// Fires the sleep timer armed for `deadline`.
    ///
    /// Does nothing if that deadline was cancelled or replaced.
    pub fn on_sleep_deadline( &mut self, deadline: Instant ) {
        if self.session.sleep_deadline != Some( deadline ) {
            tracing::debug!( "Ignoring stale sleep deadline" );
            return;
        }

        self.session.sleep_deadline = None;
        tracing::info!( "Sleep timer reached" );
        match self.session.state {
            PlaybackState::Playing => {
                let _ = self.pause();
            }
            PlaybackState::Interrupted => self.resume_after_interruption = false,
            _ => {}
        }
    }


    /// Single entry point for transport and host notifications.
    pub fn handle_event( &mut self, event: PlayerEvent ) {
        tracing::debug!( "Event: {:?} in {:?}", event, self.session.state );
        match event {
            PlayerEvent::NaturalEnd | PlayerEvent::SilenceEnd => self.on_track_finished(),
            PlayerEvent::InterruptionBegan => self.on_interruption_began(),
            PlayerEvent::InterruptionEnded { should_resume } => self.on_interruption_ended( should_resume ),
        }
    }


    fn on_track_finished( &mut self ) {
        if self.media.is_none() {
            return;
        }

        self.stop_timers();
        self.session.position_secs = 0.0;
        self.session.state = PlaybackState::Idle;

        match self.queue.advance( Direction::Forward ) {
            Ok( next ) => {
                let next = next.clone();
                if let Err( e ) = self.load( next ) {
                    tracing::warn!( "Could not start next track: {}", e );
                }
            }
            Err( QueueExhausted ) => {
                tracing::info!( "Reached end of queue" );
                self.teardown();
                self.publish();
            }
        }
    }


    fn on_interruption_began( &mut self ) {
        let was_playing = match self.session.state {
            PlaybackState::Playing => true,
            PlaybackState::Paused => false,
            _ => return,
        };

        if was_playing {
            self.transport.pause();
            self.session.position_secs = self.clamped_position();
            self.stop_timers();
        }
        self.resume_after_interruption = was_playing;
        self.session.state = PlaybackState::Interrupted;
        tracing::info!( "Interrupted (was playing: {})", was_playing );
        self.publish();
    }


    fn on_interruption_ended( &mut self, should_resume: bool ) {
        if self.session.state != PlaybackState::Interrupted {
            return;
        }

        if should_resume && self.resume_after_interruption {
            let _ = self.resume();
        } else {
            self.resume_after_interruption = false;
            self.session.state = PlaybackState::Paused;
            self.publish();
        }
    }


    /// Position-timer tick: samples the transport and detects the natural end.
    pub fn on_position_tick( &mut self ) {
        if !self.position_timer || self.session.state != PlaybackState::Playing {
            return;
        }

        if self.transport.finished() {
            self.handle_event( PlayerEvent::NaturalEnd );
            return;
        }

        self.session.position_secs = self.clamped_position();
        self.publish();
    }


    /// Silence-timer tick: feeds the detector while it is armed.
    pub fn on_silence_tick( &mut self ) {
        if !self.silence_timer || self.session.state != PlaybackState::Playing || self.session.total_secs <= 0.0 {
            return;
        }

        let remaining = self.session.total_secs - self.transport.position();
        if self.detector.observe( remaining, self.transport.average_power() ) {
            self.handle_event( PlayerEvent::SilenceEnd );
        }
    }


    /// Applies display fields pushed by the catalog after metadata extraction.
    ///
    /// The open-time duration stays authoritative.
    pub fn on_metadata_updated( &mut self, update: &TrackReference ) {
        let Some( current ) = self.session.current_track.as_mut() else {
            return;
        };
        if current.id != update.id {
            return;
        }

        current.title = update.title.clone();
        current.artist = update.artist.clone();
        current.artwork = update.artwork.clone();
        if self.media.is_none() {
            current.duration_secs = update.duration_secs;
        }

        let current = current.clone();
        self.queue.refresh( &current );
        self.publish();
    }


    fn persist( &mut self, track: &TrackReference ) {
        let pending = self.write_back.persist( &mut self.catalog, track );
        if pending > 0 {
            tracing::debug!( "{} catalog write(s) pending", pending );
        }
    }


    fn clamped_position( &self ) -> f64 {
        let position = self.transport.position().max( 0.0 );
        if self.session.total_secs > 0.0 {
            position.min( self.session.total_secs )
        } else {
            position
        }
    }


    fn start_timers( &mut self ) {
        self.position_timer = true;
        self.start_silence_timer();
    }


    fn start_silence_timer( &mut self ) {
        if self.skip_silence {
            self.detector.arm();
            self.silence_timer = true;
        } else {
            self.detector.disarm();
            self.silence_timer = false;
        }
    }


    fn stop_timers( &mut self ) {
        self.position_timer = false;
        self.silence_timer = false;
        self.detector.disarm();
    }


    /// Stops timers, closes the transport and only then releases file access.
    fn teardown( &mut self ) {
        self.stop_timers();
        self.transport.close();
        self.media = None;
    }


    fn publish( &mut self ) {
        let Some( track ) = self.session.current_track.as_ref() else {
            self.sink.clear();
            return;
        };

        let state = match self.session.state {
            PlaybackState::Playing => NowPlayingState::Playing,
            PlaybackState::Paused | PlaybackState::Interrupted | PlaybackState::Loading => NowPlayingState::Paused,
            PlaybackState::Idle => NowPlayingState::Stopped,
        };

        let now_playing = NowPlaying {
            title: track.title.clone(),
            artist: track.artist.clone(),
            artwork: track.artwork.clone(),
            duration_secs: self.session.total_secs,
            elapsed_secs: self.session.position_secs,
            rate: if state == NowPlayingState::Playing { self.session.rate } else { 0.0 },
            state,
        };
        self.sink.publish( &now_playing );
    }
}


impl<T: Transport, C: Catalog> Drop for Coordinator<T, C> {
    fn drop( &mut self ) {
        self.teardown();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    use tempfile::TempDir;

    use crate::bridge::NowPlayingUpdate;
    use crate::resolver::{ BookmarkHost, PathBookmarks, ResolvedBookmark };
    use crate::testing::{ FakeTransport, MemoryCatalog, RecordingSink };
    use crate::track::{ Bookmark, TrackId };


    struct Fixture {
        dir: TempDir,
        sink: RecordingSink,
        coordinator: Coordinator<FakeTransport, MemoryCatalog>,
    }


    fn track_in( dir: &Path, id: u64, favorite: bool ) -> TrackReference {
        let path = dir.join( format!( "song{}.mp3", id ) );
        fs::write( &path, b"audio" ).unwrap();
        let mut track = TrackReference::new( TrackId( id ), path );
        track.is_favorite = favorite;
        track.duration_secs = 200.0;
        track
    }


    fn fixture_with( favorites: &[bool], options: PlaybackOptions ) -> Fixture {
        let dir = TempDir::new().unwrap();
        let managed = dir.path().join( "managed" );
        fs::create_dir_all( &managed ).unwrap();

        let tracks = favorites
            .iter()
            .enumerate()
            .map( |( i, fav )| track_in( dir.path(), i as u64, *fav ) )
            .collect();

        let sink = RecordingSink::default();
        let coordinator = Coordinator::new(
            FakeTransport::new( 200.0 ),
            MemoryCatalog::new( tracks ),
            FileResolver::new( Arc::new( PathBookmarks ), managed ),
            Box::new( sink.clone() ),
            options,
        );
        Fixture { dir, sink, coordinator }
    }


    fn fixture( count: usize ) -> Fixture {
        fixture_with( &vec![ false; count ], PlaybackOptions::default() )
    }


    fn current_id( c: &Coordinator<FakeTransport, MemoryCatalog> ) -> Option<TrackId> {
        c.session().current_track.as_ref().map( |t| t.id )
    }


    #[test]
    fn test_play_from_source_loads_and_plays() {
        let mut f = fixture( 3 );
        f.coordinator.play_from_source( 1 ).unwrap();

        let session = f.coordinator.session();
        assert_eq!( session.state, PlaybackState::Playing );
        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 1 ) ) );
        assert_eq!( f.coordinator.queue().cursor(), 1 );
        assert!( f.coordinator.transport().is_playing() );
        assert_eq!( f.coordinator.catalog().track( TrackId( 1 ) ).unwrap().play_count, 1 );
    }


    #[test]
    fn test_load_writes_back_measured_duration() {
        let mut f = fixture( 1 );
        f.coordinator.transport_mut().set_open_duration( 187.5 );
        f.coordinator.play_from_source( 0 ).unwrap();

        assert_eq!( f.coordinator.session().total_secs, 187.5 );
        assert_eq!( f.coordinator.catalog().track( TrackId( 0 ) ).unwrap().duration_secs, 187.5 );
    }


    #[test]
    fn test_missing_file_goes_idle_with_attempted_track() {
        let mut f = fixture( 2 );
        let mut missing = TrackReference::new( TrackId( 9 ), f.dir.path().join( "gone.mp3" ) );
        missing.title = "Gone".into();

        let result = f.coordinator.load( missing );
        assert!( matches!( result, Err( PlaybackError::FileMissing( _ ) ) ) );
        assert_eq!( f.coordinator.session().state, PlaybackState::Idle );
        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 9 ) ) );
        assert_eq!( f.coordinator.transport().open_count(), 0 );
    }


    #[test]
    fn test_transport_rejection_goes_idle() {
        let mut f = fixture( 1 );
        f.coordinator.transport_mut().fail_next_open();
        let result = f.coordinator.play_from_source( 0 );

        assert!( matches!( result, Err( PlaybackError::TransportOpenFailed( _ ) ) ) );
        assert_eq!( f.coordinator.session().state, PlaybackState::Idle );
        assert_eq!( f.coordinator.catalog().track( TrackId( 0 ) ).unwrap().play_count, 0 );
    }


    #[test]
    fn test_load_repairs_path_from_managed_dir() {
        let mut f = fixture( 0 );
        let managed = f.dir.path().join( "managed" ).join( "moved.mp3" );
        fs::write( &managed, b"audio" ).unwrap();
        let track = TrackReference::new( TrackId( 4 ), "/old/location/moved.mp3" );
        f.coordinator.catalog_mut().insert( track.clone() );

        f.coordinator.load( track ).unwrap();
        let stored = f.coordinator.catalog().track( TrackId( 4 ) ).unwrap();
        assert_eq!( stored.primary_path, managed );
        assert_eq!( f.coordinator.transport().opened_path(), Some( managed.as_path() ) );
    }


    /// Tokens are `old:<path>` or `new:<path>`; only `new:` ones are current.
    struct RotatingBookmarks;


    impl BookmarkHost for RotatingBookmarks {
        fn resolve( &self, bookmark: &Bookmark ) -> Result<ResolvedBookmark, ResolveError> {
            let raw = String::from_utf8( bookmark.0.clone() ).map_err( |e| ResolveError::Bookmark( e.to_string() ) )?;
            match raw.split_once( ':' ) {
                Some(( "old", path )) => Ok( ResolvedBookmark { path: PathBuf::from( path ), stale: true } ),
                Some(( "new", path )) => Ok( ResolvedBookmark { path: PathBuf::from( path ), stale: false } ),
                _ => Err( ResolveError::Bookmark( raw ) ),
            }
        }


        fn create( &self, path: &Path ) -> Result<Bookmark, ResolveError> {
            Ok( Bookmark( format!( "new:{}", path.display() ).into_bytes() ) )
        }


        fn begin_access( &self, _path: &Path ) -> bool {
            true
        }


        fn end_access( &self, _path: &Path ) {}
    }


    #[test]
    fn test_stale_bookmark_refresh_is_persisted_once() {
        let dir = TempDir::new().unwrap();
        let mut track = track_in( dir.path(), 0, false );
        track.bookmark = Some( Bookmark( format!( "old:{}", track.primary_path.display() ).into_bytes() ) );
        let fresh = Bookmark( format!( "new:{}", track.primary_path.display() ).into_bytes() );

        let mut coordinator = Coordinator::new(
            FakeTransport::new( 200.0 ),
            MemoryCatalog::new( vec![ track ] ),
            FileResolver::new( Arc::new( RotatingBookmarks ), dir.path().join( "managed" ) ),
            Box::new( RecordingSink::default() ),
            PlaybackOptions::default(),
        );

        coordinator.play_from_source( 0 ).unwrap();
        let stored = coordinator.catalog().track( TrackId( 0 ) ).unwrap();
        assert_eq!( stored.bookmark, Some( fresh.clone() ) );
        // Refresh write plus play-count write
        assert_eq!( coordinator.catalog().writes(), 2 );

        coordinator.play_from_source( 0 ).unwrap();
        let stored = coordinator.catalog().track( TrackId( 0 ) ).unwrap();
        assert_eq!( stored.bookmark, Some( fresh ) );
        assert_eq!( stored.play_count, 2 );
        assert_eq!( coordinator.catalog().writes(), 3 );
    }


    #[test]
    fn test_load_tears_down_previous_track() {
        let mut f = fixture( 2 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.play_from_source( 1 ).unwrap();

        assert_eq!( f.coordinator.transport().open_count(), 2 );
        assert_eq!( f.coordinator.transport().close_count(), 2 );
        assert_eq!( f.coordinator.transport().max_open(), 1 );
    }


    #[test]
    fn test_toggle_without_track_plays_random_favorite() {
        let mut f = fixture_with( &[ false, true, false, true ], PlaybackOptions::default() );
        f.coordinator.toggle_play_pause().unwrap();

        let session = f.coordinator.session();
        assert_eq!( session.state, PlaybackState::Playing );
        let track = session.current_track.as_ref().unwrap();
        assert!( track.id == TrackId( 1 ) || track.id == TrackId( 3 ) );
        assert!( f.coordinator.is_playing_favorites() );
        assert_eq!( f.coordinator.queue().len(), 2 );
    }


    #[test]
    fn test_toggle_without_track_or_favorites_is_noop() {
        let mut f = fixture( 3 );
        f.coordinator.toggle_play_pause().unwrap();

        assert_eq!( f.coordinator.session().state, PlaybackState::Idle );
        assert!( f.coordinator.session().current_track.is_none() );
        assert_eq!( f.coordinator.transport().open_count(), 0 );
    }


    #[test]
    fn test_toggle_pauses_and_resumes() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();

        f.coordinator.toggle_play_pause().unwrap();
        assert_eq!( f.coordinator.session().state, PlaybackState::Paused );
        assert!( !f.coordinator.transport().is_playing() );
        assert_eq!( f.sink.last_published().unwrap().rate, 0.0 );

        f.coordinator.toggle_play_pause().unwrap();
        assert_eq!( f.coordinator.session().state, PlaybackState::Playing );
        assert_eq!( f.sink.last_published().unwrap().rate, 1.0 );
    }


    #[test]
    fn test_paused_ticks_do_not_move_position() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.transport_mut().set_position( 12.0 );
        f.coordinator.on_position_tick();
        f.coordinator.pause().unwrap();

        f.coordinator.transport_mut().set_position( 40.0 );
        f.coordinator.on_position_tick();
        assert_eq!( f.coordinator.session().position_secs, 12.0 );
    }


    #[test]
    fn test_seek_clamps_to_bounds() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();

        f.coordinator.seek( -5.0 ).unwrap();
        assert_eq!( f.coordinator.session().position_secs, 0.0 );

        f.coordinator.seek( 500.0 ).unwrap();
        assert_eq!( f.coordinator.session().position_secs, 200.0 );
        assert_eq!( f.coordinator.transport().position(), 200.0 );
    }


    #[test]
    fn test_seek_without_track_fails() {
        let mut f = fixture( 1 );
        assert!( matches!( f.coordinator.seek( 3.0 ), Err( PlaybackError::NoTrack ) ) );
    }


    #[test]
    fn test_skip_keeps_play_state() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.seek( 50.0 ).unwrap();
        f.coordinator.pause().unwrap();

        f.coordinator.skip_forward().unwrap();
        assert_eq!( f.coordinator.session().position_secs, 60.0 );
        f.coordinator.skip_backward().unwrap();
        f.coordinator.skip_backward().unwrap();
        assert_eq!( f.coordinator.session().position_secs, 40.0 );
        assert_eq!( f.coordinator.session().state, PlaybackState::Paused );
    }


    #[test]
    fn test_rate_persists_across_loads() {
        let mut f = fixture( 2 );
        f.coordinator.play_from_source( 0 ).unwrap();
        assert_eq!( f.coordinator.set_rate( 1.5 ).unwrap(), 1.5 );

        f.coordinator.next().unwrap();
        assert_eq!( f.coordinator.session().rate, 1.5 );
        assert_eq!( f.coordinator.transport().rate(), 1.5 );
    }


    #[test]
    fn test_rate_validation() {
        let mut f = fixture( 1 );
        assert!( matches!( f.coordinator.set_rate( 0.0 ), Err( PlaybackError::InvalidRate( _ ) ) ) );
        assert!( matches!( f.coordinator.set_rate( f32::NAN ), Err( PlaybackError::InvalidRate( _ ) ) ) );
        assert_eq!( f.coordinator.set_rate( 4.0 ).unwrap(), MAX_RATE );
        assert_eq!( f.coordinator.set_rate( 0.1 ).unwrap(), MIN_RATE );
    }


    #[test]
    fn test_volume_persists_across_pause_resume() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.set_volume( 0.4 );
        f.coordinator.pause().unwrap();
        f.coordinator.resume().unwrap();

        assert_eq!( f.coordinator.session().volume, 0.4 );
        assert_eq!( f.coordinator.transport().volume(), 0.4 );
        assert_eq!( f.coordinator.set_volume( 3.0 ), 1.0 );
    }


    #[test]
    fn test_interruption_round_trip_resumes() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();

        f.coordinator.handle_event( PlayerEvent::InterruptionBegan );
        assert_eq!( f.coordinator.session().state, PlaybackState::Interrupted );
        assert!( !f.coordinator.transport().is_playing() );

        f.coordinator.handle_event( PlayerEvent::InterruptionEnded { should_resume: true } );
        assert_eq!( f.coordinator.session().state, PlaybackState::Playing );
        assert!( f.coordinator.transport().is_playing() );
    }


    #[test]
    fn test_interruption_without_resume_pauses() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.handle_event( PlayerEvent::InterruptionBegan );
        f.coordinator.handle_event( PlayerEvent::InterruptionEnded { should_resume: false } );
        assert_eq!( f.coordinator.session().state, PlaybackState::Paused );
    }


    #[test]
    fn test_interruption_while_paused_stays_paused() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.pause().unwrap();
        f.coordinator.handle_event( PlayerEvent::InterruptionBegan );
        f.coordinator.handle_event( PlayerEvent::InterruptionEnded { should_resume: true } );
        assert_eq!( f.coordinator.session().state, PlaybackState::Paused );
        assert!( !f.coordinator.transport().is_playing() );
    }


    #[test]
    fn test_natural_end_advances() {
        let mut f = fixture( 3 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.transport_mut().set_finished( true );
        f.coordinator.on_position_tick();

        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 1 ) ) );
        assert_eq!( f.coordinator.session().state, PlaybackState::Playing );
        assert_eq!( f.coordinator.session().position_secs, 0.0 );
    }


    #[test]
    fn test_end_of_queue_goes_idle() {
        let mut f = fixture( 2 );
        f.coordinator.play_from_source( 1 ).unwrap();
        f.coordinator.handle_event( PlayerEvent::NaturalEnd );

        assert_eq!( f.coordinator.session().state, PlaybackState::Idle );
        assert_eq!( f.coordinator.transport().open_count(), 1 );
        assert!( f.coordinator.transport().opened_path().is_none() );
        assert_eq!( f.sink.last_published().unwrap().state, NowPlayingState::Stopped );
    }


    #[test]
    fn test_repeat_all_wraps_on_end() {
        let mut f = fixture( 2 );
        f.coordinator.set_repeat( RepeatMode::All );
        f.coordinator.play_from_source( 1 ).unwrap();
        f.coordinator.handle_event( PlayerEvent::NaturalEnd );
        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 0 ) ) );
    }


    #[test]
    fn test_repeat_one_replays_on_both_end_kinds() {
        let mut f = fixture( 3 );
        f.coordinator.set_repeat( RepeatMode::One );
        f.coordinator.play_from_source( 1 ).unwrap();

        f.coordinator.handle_event( PlayerEvent::NaturalEnd );
        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 1 ) ) );
        f.coordinator.handle_event( PlayerEvent::SilenceEnd );
        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 1 ) ) );
        assert_eq!( f.coordinator.catalog().track( TrackId( 1 ) ).unwrap().play_count, 3 );
    }


    #[test]
    fn test_previous_at_start_is_noop() {
        let mut f = fixture( 2 );
        f.coordinator.play_from_source( 0 ).unwrap();
        let result = f.coordinator.previous();

        assert!( matches!( result, Err( PlaybackError::QueueExhausted( _ ) ) ) );
        assert_eq!( f.coordinator.session().state, PlaybackState::Playing );
        assert_eq!( f.coordinator.transport().open_count(), 1 );
    }


    #[test]
    fn test_silence_in_tail_ends_track() {
        let options = PlaybackOptions { skip_silence: true, ..PlaybackOptions::default() };
        let mut f = fixture_with( &[ false, false ], options );
        f.coordinator.play_from_source( 0 ).unwrap();

        f.coordinator.transport_mut().set_power( -90.0 );
        f.coordinator.transport_mut().set_position( 185.0 );
        for _ in 0..60 {
            f.coordinator.on_silence_tick();
        }
        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 1 ) ) );
    }


    #[test]
    fn test_silence_outside_tail_is_ignored() {
        let options = PlaybackOptions { skip_silence: true, ..PlaybackOptions::default() };
        let mut f = fixture_with( &[ false, false ], options );
        f.coordinator.play_from_source( 0 ).unwrap();

        f.coordinator.transport_mut().set_power( -90.0 );
        f.coordinator.transport_mut().set_position( 175.0 );
        for _ in 0..200 {
            f.coordinator.on_silence_tick();
        }
        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 0 ) ) );
    }


    #[test]
    fn test_silence_ignored_when_disabled() {
        let mut f = fixture( 2 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.transport_mut().set_power( -90.0 );
        f.coordinator.transport_mut().set_position( 190.0 );
        for _ in 0..100 {
            f.coordinator.on_silence_tick();
        }
        assert_eq!( current_id( &f.coordinator ), Some( TrackId( 0 ) ) );
    }


    #[test]
    fn test_sleep_deadline_pauses() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        let deadline = f.coordinator.set_sleep_timer( Duration::from_secs( 15 * 60 ) );

        f.coordinator.on_sleep_deadline( deadline );
        assert_eq!( f.coordinator.session().state, PlaybackState::Paused );
        assert!( f.coordinator.session().sleep_deadline.is_none() );
    }


    #[test]
    fn test_cancelled_sleep_deadline_is_noop() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        let deadline = f.coordinator.set_sleep_timer( Duration::from_secs( 60 ) );
        f.coordinator.cancel_sleep_timer();

        f.coordinator.on_sleep_deadline( deadline );
        assert_eq!( f.coordinator.session().state, PlaybackState::Playing );
    }


    #[test]
    fn test_replaced_sleep_deadline_is_noop() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        let first = f.coordinator.set_sleep_timer( Duration::from_secs( 60 ) );
        let second = f.coordinator.set_sleep_timer( Duration::from_secs( 120 ) );

        f.coordinator.on_sleep_deadline( first );
        assert_eq!( f.coordinator.session().state, PlaybackState::Playing );
        assert_eq!( f.coordinator.session().sleep_deadline, Some( second ) );
    }


    #[test]
    fn test_huge_sleep_timer_is_capped() {
        let mut f = fixture( 1 );
        let before = Instant::now();
        let deadline = f.coordinator.set_sleep_timer( Duration::from_secs( u64::MAX ) );

        assert!( deadline >= before + MAX_SLEEP_TIMER );
        assert!( deadline <= Instant::now() + MAX_SLEEP_TIMER );
        assert_eq!( f.coordinator.session().sleep_deadline, Some( deadline ) );
    }


    #[test]
    fn test_sleep_timer_survives_track_change() {
        let mut f = fixture( 2 );
        f.coordinator.play_from_source( 0 ).unwrap();
        let deadline = f.coordinator.set_sleep_timer( Duration::from_secs( 60 ) );
        f.coordinator.next().unwrap();
        assert_eq!( f.coordinator.session().sleep_deadline, Some( deadline ) );
    }


    #[test]
    fn test_persistence_failure_is_retried() {
        let mut f = fixture( 2 );
        f.coordinator.catalog_mut().fail_writes( true );
        f.coordinator.play_from_source( 0 ).unwrap();
        assert_eq!( f.coordinator.session().state, PlaybackState::Playing );
        assert_eq!( f.coordinator.pending_writes(), 1 );
        assert!( matches!( f.coordinator.flush_pending(), Err( PlaybackError::PersistenceWriteFailed( 1 ) ) ) );

        f.coordinator.catalog_mut().fail_writes( false );
        f.coordinator.next().unwrap();
        assert_eq!( f.coordinator.pending_writes(), 0 );
        assert_eq!( f.coordinator.catalog().track( TrackId( 0 ) ).unwrap().play_count, 1 );
    }


    #[test]
    fn test_metadata_update_keeps_measured_duration() {
        let mut f = fixture( 1 );
        f.coordinator.transport_mut().set_open_duration( 201.0 );
        f.coordinator.play_from_source( 0 ).unwrap();

        let mut update = f.coordinator.catalog().track( TrackId( 0 ) ).unwrap();
        update.title = "Real Title".into();
        update.artist = "Real Artist".into();
        update.duration_secs = 180.0;
        f.coordinator.on_metadata_updated( &update );

        let current = f.coordinator.session().current_track.clone().unwrap();
        assert_eq!( current.title, "Real Title" );
        assert_eq!( current.duration_secs, 201.0 );
        assert_eq!( f.sink.last_published().unwrap().artist, "Real Artist" );
    }


    #[test]
    fn test_stop_clears_everything() {
        let mut f = fixture( 1 );
        f.coordinator.play_from_source( 0 ).unwrap();
        f.coordinator.stop();

        assert_eq!( f.coordinator.session().state, PlaybackState::Idle );
        assert!( f.coordinator.session().current_track.is_none() );
        assert!( f.coordinator.transport().opened_path().is_none() );
        assert_eq!( f.sink.updates().last(), Some( &NowPlayingUpdate::Clear ) );
    }
}
