//! Track records shared between the catalog and the playback core
//!
//! The catalog creates and deletes tracks; the core only borrows them and
//! writes back the handful of playback-relevant fields it discovers.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{ Deserialize, Serialize };


/// Stable, catalog-assigned track identity.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize )]
pub struct TrackId( pub u64 );


impl fmt::Display for TrackId {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        write!( f, "#{}", self.0 )
    }
}


/// Opaque durable reference to a file location.
///
/// Only the host's resource-access facility knows how to interpret the bytes.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
pub struct Bookmark( pub Vec<u8> );


impl Bookmark {
    pub fn as_bytes( &self ) -> &[u8] {
        &self.0
    }
}


/// A track as seen by the playback core.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct TrackReference {
    pub id: TrackId,
    /// Last known filesystem path
    pub primary_path: PathBuf,
    /// Durable reference that survives relocation; may be stale
    #[serde( default )]
    pub bookmark: Option<Bookmark>,
    /// Last known duration, authoritative once the transport has opened the file
    #[serde( default )]
    pub duration_secs: f64,
    /// Cover image; kept out of the serialized record
    #[serde( skip )]
    pub artwork: Option<Arc<[u8]>>,
    pub title: String,
    pub artist: String,
    #[serde( default )]
    pub is_favorite: bool,
    #[serde( default )]
    pub play_count: u64,
}


impl TrackReference {
    /// Creates a track with placeholder display fields.
    pub fn new( id: TrackId, primary_path: impl Into<PathBuf> ) -> Self {
        let primary_path = primary_path.into();
        let title = primary_path
            .file_stem()
            .map( |s| s.to_string_lossy().into_owned() )
            .unwrap_or_else( || UNTITLED.to_string() );

        Self {
            id,
            primary_path,
            bookmark: None,
            duration_secs: 0.0,
            artwork: None,
            title,
            artist: UNKNOWN_ARTIST.to_string(),
            is_favorite: false,
            play_count: 0,
        }
    }


    /// Returns the base name of the primary path.
    pub fn file_name( &self ) -> Option<&std::ffi::OsStr> {
        self.primary_path.file_name()
    }
}


/// Placeholder title for tracks without one.
pub const UNTITLED: &str = "Untitled";

/// Placeholder artist for tracks without one.
pub const UNKNOWN_ARTIST: &str = "Unknown Artist";


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_new_uses_file_stem_as_title() {
        let track = TrackReference::new( TrackId( 7 ), "/music/Blue Monday.flac" );
        assert_eq!( track.title, "Blue Monday" );
        assert_eq!( track.artist, UNKNOWN_ARTIST );
        assert_eq!( track.play_count, 0 );
        assert!( track.bookmark.is_none() );
    }


    #[test]
    fn test_track_id_display() {
        assert_eq!( TrackId( 42 ).to_string(), "#42" );
    }
}
