//! Test doubles shared by the unit tests.

use std::path::{ Path, PathBuf };
use std::sync::{ Arc, Mutex };

use crate::bridge::{ NowPlaying, NowPlayingSink, NowPlayingUpdate };
use crate::catalog::{ Catalog, CatalogError };
use crate::track::{ TrackId, TrackReference };
use crate::transport::{ Transport, TransportError };


/// In-memory catalog whose current source is every track, in insertion order.
#[derive( Debug, Default )]
pub struct MemoryCatalog {
    tracks: Vec<TrackReference>,
    fail_writes: bool,
    writes: usize,
}


impl MemoryCatalog {
    pub fn new( tracks: Vec<TrackReference> ) -> Self {
        Self { tracks, fail_writes: false, writes: 0 }
    }


    pub fn insert( &mut self, track: TrackReference ) {
        self.tracks.push( track );
    }


    pub fn fail_writes( &mut self, fail: bool ) {
        self.fail_writes = fail;
    }


    pub fn track( &self, id: TrackId ) -> Option<TrackReference> {
        self.tracks.iter().find( |t| t.id == id ).cloned()
    }


    /// Successful writes so far.
    pub fn writes( &self ) -> usize {
        self.writes
    }
}


impl Catalog for MemoryCatalog {
    fn fetch_favorites( &self ) -> Vec<TrackReference> {
        self.tracks.iter().filter( |t| t.is_favorite ).cloned().collect()
    }


    fn persist( &mut self, track: &TrackReference ) -> Result<(), CatalogError> {
        if self.fail_writes {
            return Err( CatalogError::Write( "disk full".into() ) );
        }
        let slot = self.tracks
            .iter_mut()
            .find( |t| t.id == track.id )
            .ok_or( CatalogError::UnknownTrack( track.id ) )?;
        *slot = track.clone();
        self.writes += 1;
        Ok(())
    }


    fn all_tracks_in_current_source( &self ) -> Vec<TrackReference> {
        self.tracks.clone()
    }
}


/// Scripted transport that records what the coordinator asked of it.
#[derive( Debug )]
pub struct FakeTransport {
    open_duration: f64,
    fail_next_open: bool,
    opened: Option<PathBuf>,
    playing: bool,
    position: f64,
    rate: f32,
    volume: f32,
    power_db: f32,
    finished: bool,
    open_count: usize,
    close_count: usize,
    open_now: usize,
    max_open: usize,
}


impl FakeTransport {
    /// Creates a transport that reports `open_duration` for every file.
    pub fn new( open_duration: f64 ) -> Self {
        Self {
            open_duration,
            fail_next_open: false,
            opened: None,
            playing: false,
            position: 0.0,
            rate: 1.0,
            volume: 1.0,
            power_db: -12.0,
            finished: false,
            open_count: 0,
            close_count: 0,
            open_now: 0,
            max_open: 0,
        }
    }


    pub fn set_open_duration( &mut self, secs: f64 ) {
        self.open_duration = secs;
    }


    pub fn fail_next_open( &mut self ) {
        self.fail_next_open = true;
    }


    pub fn set_position( &mut self, secs: f64 ) {
        self.position = secs;
    }


    pub fn set_power( &mut self, db: f32 ) {
        self.power_db = db;
    }


    pub fn set_finished( &mut self, finished: bool ) {
        self.finished = finished;
    }


    pub fn opened_path( &self ) -> Option<&Path> {
        self.opened.as_deref()
    }


    pub fn is_playing( &self ) -> bool {
        self.playing
    }


    pub fn rate( &self ) -> f32 {
        self.rate
    }


    pub fn volume( &self ) -> f32 {
        self.volume
    }


    pub fn open_count( &self ) -> usize {
        self.open_count
    }


    pub fn close_count( &self ) -> usize {
        self.close_count
    }


    /// Most handles ever open at once.
    pub fn max_open( &self ) -> usize {
        self.max_open
    }
}


impl Transport for FakeTransport {
    fn open( &mut self, path: &Path ) -> Result<f64, TransportError> {
        if std::mem::take( &mut self.fail_next_open ) {
            return Err( TransportError::Open( "unsupported format".into() ) );
        }
        self.opened = Some( path.to_path_buf() );
        self.playing = false;
        self.position = 0.0;
        self.finished = false;
        self.open_count += 1;
        self.open_now += 1;
        self.max_open = self.max_open.max( self.open_now );
        Ok( self.open_duration )
    }


    fn play( &mut self ) {
        self.playing = self.opened.is_some();
    }


    fn pause( &mut self ) {
        self.playing = false;
    }


    fn close( &mut self ) {
        self.close_count += 1;
        if self.opened.take().is_some() {
            self.open_now -= 1;
        }
        self.playing = false;
    }


    fn seek( &mut self, position_secs: f64 ) -> Result<(), TransportError> {
        if self.opened.is_none() {
            return Err( TransportError::NotOpen );
        }
        self.position = position_secs;
        Ok(())
    }


    fn position( &self ) -> f64 {
        self.position
    }


    fn set_rate( &mut self, rate: f32 ) {
        self.rate = rate;
    }


    fn set_volume( &mut self, volume: f32 ) {
        self.volume = volume;
    }


    fn average_power( &self ) -> f32 {
        self.power_db
    }


    fn finished( &self ) -> bool {
        self.finished
    }
}


/// Sink that keeps every update; clones share the same log.
#[derive( Debug, Clone, Default )]
pub struct RecordingSink {
    updates: Arc<Mutex<Vec<NowPlayingUpdate>>>,
}


impl RecordingSink {
    pub fn updates( &self ) -> Vec<NowPlayingUpdate> {
        self.updates.lock().unwrap().clone()
    }


    pub fn last_published( &self ) -> Option<NowPlaying> {
        self.updates().into_iter().rev().find_map( |u| match u {
            NowPlayingUpdate::Publish( now_playing ) => Some( now_playing ),
            NowPlayingUpdate::Clear => None,
        })
    }
}


impl NowPlayingSink for RecordingSink {
    fn publish( &mut self, now_playing: &NowPlaying ) {
        self.updates.lock().unwrap().push( NowPlayingUpdate::Publish( now_playing.clone() ) );
    }


    fn clear( &mut self ) {
        self.updates.lock().unwrap().push( NowPlayingUpdate::Clear );
    }
}
