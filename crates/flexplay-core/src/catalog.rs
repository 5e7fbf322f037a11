//! Catalog collaborator contract
//!
//! The catalog store owns song, album and playlist records. The playback core
//! only needs to read favorites and the current source list, and to write back
//! repaired paths, refreshed bookmarks, measured durations and play counts.

use thiserror::Error;

use crate::track::TrackReference;


/// Errors reported by a catalog implementation.
#[derive( Debug, Error )]
pub enum CatalogError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Unknown track: {0}" )]
    UnknownTrack( crate::track::TrackId ),

    #[error( "Catalog write failed: {0}" )]
    Write( String ),
}


/// Read/write access to the persisted catalog.
pub trait Catalog {
    /// Returns every track flagged as favorite.
    fn fetch_favorites( &self ) -> Vec<TrackReference>;

    /// Writes back the playback-relevant fields of `track`.
    fn persist( &mut self, track: &TrackReference ) -> Result<(), CatalogError>;

    /// Returns the tracks of the currently selected source (library, favorites or a playlist).
    fn all_tracks_in_current_source( &self ) -> Vec<TrackReference>;
}


/// Write-back queue in front of a catalog.
///
/// Failed writes are kept (latest copy per track) and retried on the next
/// mutation instead of blocking playback.
#[derive( Debug, Default )]
pub struct WriteBack {
    pending: Vec<TrackReference>,
}


impl WriteBack {
    pub fn new() -> Self {
        Self::default()
    }


    /// Queues `track` and flushes everything pending.
    ///
    /// @returns The number of writes still pending after the flush
    pub fn persist<C: Catalog + ?Sized>( &mut self, catalog: &mut C, track: &TrackReference ) -> usize {
        match self.pending.iter_mut().find( |t| t.id == track.id ) {
            Some( slot ) => *slot = track.clone(),
            None => self.pending.push( track.clone() ),
        }
        self.flush( catalog )
    }


    /// Retries every pending write.
    pub fn flush<C: Catalog + ?Sized>( &mut self, catalog: &mut C ) -> usize {
        self.pending.retain( |track| match catalog.persist( track ) {
            Ok(()) => false,
            Err( e ) => {
                tracing::warn!( "Persisting {} failed, will retry: {}", track.id, e );
                true
            }
        });
        self.pending.len()
    }


    pub fn pending( &self ) -> usize {
        self.pending.len()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::testing::MemoryCatalog;
    use crate::track::TrackId;


    #[test]
    fn test_failed_write_is_retried_on_next_mutation() {
        let first = TrackReference::new( TrackId( 1 ), "/m/a.mp3" );
        let second = TrackReference::new( TrackId( 2 ), "/m/b.mp3" );
        let mut catalog = MemoryCatalog::new( vec![ first.clone(), second.clone() ] );
        let mut write_back = WriteBack::new();

        catalog.fail_writes( true );
        let mut changed = first.clone();
        changed.play_count = 3;
        assert_eq!( write_back.persist( &mut catalog, &changed ), 1 );
        assert_eq!( catalog.track( TrackId( 1 ) ).unwrap().play_count, 0 );

        catalog.fail_writes( false );
        let mut other = second.clone();
        other.play_count = 1;
        assert_eq!( write_back.persist( &mut catalog, &other ), 0 );
        assert_eq!( catalog.track( TrackId( 1 ) ).unwrap().play_count, 3 );
        assert_eq!( catalog.track( TrackId( 2 ) ).unwrap().play_count, 1 );
    }


    #[test]
    fn test_pending_keeps_latest_copy_per_track() {
        let track = TrackReference::new( TrackId( 1 ), "/m/a.mp3" );
        let mut catalog = MemoryCatalog::new( vec![ track.clone() ] );
        let mut write_back = WriteBack::new();
        catalog.fail_writes( true );

        let mut v1 = track.clone();
        v1.play_count = 1;
        let mut v2 = track.clone();
        v2.play_count = 2;
        write_back.persist( &mut catalog, &v1 );
        write_back.persist( &mut catalog, &v2 );
        assert_eq!( write_back.pending(), 1 );

        catalog.fail_writes( false );
        write_back.flush( &mut catalog );
        assert_eq!( catalog.track( TrackId( 1 ) ).unwrap().play_count, 2 );
    }
}
