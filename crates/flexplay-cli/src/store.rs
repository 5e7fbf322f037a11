//! JSON-backed catalog store
//!
//! Holds every imported track, the user's playlists and the selected
//! source. The catalog is one JSON file rewritten on every change; cover
//! images live next to it in `artwork/<id>` so the rewrite stays small.

use std::fs;
use std::path::{ Path, PathBuf };
use std::sync::{ Arc, RwLock, RwLockReadGuard, RwLockWriteGuard };

use serde::{ Deserialize, Serialize };
use thiserror::Error;

use flexplay_core::catalog::{ Catalog, CatalogError };
use flexplay_core::library::{ ImportedFile, Importer, LibraryError };
use flexplay_core::track::{ TrackId, TrackReference, UNKNOWN_ARTIST, UNTITLED };


/// Errors from catalog store operations.
#[derive( Debug, Error )]
pub enum StoreError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Malformed catalog: {0}" )]
    Json( #[from] serde_json::Error ),

    #[error( "{0}" )]
    Library( #[from] LibraryError ),

    #[error( "No playlist named '{0}'" )]
    UnknownPlaylist( String ),

    #[error( "Playlist '{0}' already exists" )]
    DuplicatePlaylist( String ),

    #[error( "Unknown track: {0}" )]
    UnknownTrack( TrackId ),
}


/// Which tracks the queue is built from.
#[derive( Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize )]
pub enum Source {
    #[default]
    Library,
    Favorites,
    Playlist( String ),
}


/// A named, ordered list of tracks.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
pub struct Playlist {
    pub name: String,
    pub tracks: Vec<TrackId>,
}


#[derive( Debug, Default, Serialize, Deserialize )]
#[serde( default )]
struct CatalogFile {
    next_id: u64,
    tracks: Vec<TrackReference>,
    playlists: Vec<Playlist>,
    source: Source,
}


/// The catalog, bound to the file it persists to.
#[derive( Debug )]
pub struct LibraryStore {
    path: PathBuf,
    managed_dir: PathBuf,
    data: CatalogFile,
}


impl LibraryStore {
    /// Default catalog file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::data_local_dir().map( |p| p.join( "flexplay" ).join( "library.json" ) )
    }


    /// Opens the catalog at `path`, starting empty if the file does not exist.
    ///
    /// @param path - Catalog JSON file
    /// @param managed_dir - Managed-import directory used for path repair
    pub fn open( path: &Path, managed_dir: &Path ) -> Result<Self, StoreError> {
        let data = match fs::read_to_string( path ) {
            Ok( contents ) => serde_json::from_str( &contents )?,
            Err( e ) if e.kind() == std::io::ErrorKind::NotFound => CatalogFile::default(),
            Err( e ) => return Err( e.into() ),
        };

        tracing::info!( "Loaded {} tracks and {} playlists from {:?}", data.tracks.len(), data.playlists.len(), path );
        let mut store = Self { path: path.to_path_buf(), managed_dir: managed_dir.to_path_buf(), data };
        store.load_artwork();
        Ok( store )
    }


    fn artwork_path( &self, id: TrackId ) -> PathBuf {
        let dir = self.path.parent().unwrap_or( Path::new( "." ) );
        dir.join( "artwork" ).join( id.0.to_string() )
    }


    fn load_artwork( &mut self ) {
        for i in 0..self.data.tracks.len() {
            let path = self.artwork_path( self.data.tracks[ i ].id );
            match fs::read( &path ) {
                Ok( bytes ) => self.data.tracks[ i ].artwork = Some( Arc::from( bytes ) ),
                Err( e ) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err( e ) => tracing::warn!( "Could not read artwork {:?}: {}", path, e ),
            }
        }
    }


    /// Artwork is optional, so a failed write only costs the cover.
    fn store_artwork( &self, id: TrackId, artwork: &[u8] ) {
        let path = self.artwork_path( id );
        let written = path
            .parent()
            .map_or( Ok(()), fs::create_dir_all )
            .and_then( |_| fs::write( &path, artwork ) );
        if let Err( e ) = written {
            tracing::warn!( "Could not store artwork for {}: {}", id, e );
        }
    }


    /// Writes the catalog through a temporary file.
    pub fn save( &self ) -> Result<(), StoreError> {
        if let Some( parent ) = self.path.parent() {
            fs::create_dir_all( parent )?;
        }
        let json = serde_json::to_string_pretty( &self.data )?;
        let staging = self.path.with_extension( "json.tmp" );
        fs::write( &staging, json )?;
        fs::rename( &staging, &self.path )?;
        Ok(())
    }


    /// Fixes placeholder fields and relocated files.
    ///
    /// Empty titles and artists get placeholders, negative durations become
    /// zero and missing files are re-pointed at a same-named file in the
    /// managed directory.
    ///
    /// @returns The number of records changed
    pub fn validate( &mut self ) -> usize {
        let mut changed = 0;
        for track in &mut self.data.tracks {
            let before = track.clone();

            if track.title.trim().is_empty() {
                track.title = UNTITLED.to_string();
            }
            if track.artist.trim().is_empty() {
                track.artist = UNKNOWN_ARTIST.to_string();
            }
            if !( track.duration_secs >= 0.0 ) {
                track.duration_secs = 0.0;
            }
            if !track.primary_path.exists() {
                if let Some( name ) = track.file_name() {
                    let candidate = self.managed_dir.join( name );
                    if candidate.exists() {
                        tracing::info!( "Repaired path of {}: {:?}", track.id, candidate );
                        track.primary_path = candidate;
                    }
                }
            }

            if *track != before {
                changed += 1;
            }
        }
        changed
    }


    /// Adds files the importer has already copied into the library.
    ///
    /// @returns Ids of the new records
    pub fn add_imported( &mut self, files: Vec<ImportedFile> ) -> Result<Vec<TrackId>, StoreError> {
        let mut added = Vec::new();
        for file in files {
            let id = TrackId( self.data.next_id );
            self.data.next_id += 1;

            if let Some( ref artwork ) = file.artwork {
                self.store_artwork( id, artwork );
            }
            let mut track = TrackReference::new( id, file.path );
            track.bookmark = file.bookmark;
            track.title = file.title;
            track.artist = file.artist;
            track.duration_secs = file.duration_secs;
            track.artwork = file.artwork;
            self.data.tracks.push( track );
            added.push( id );
        }

        if !added.is_empty() {
            self.save()?;
        }
        Ok( added )
    }


    pub fn tracks( &self ) -> &[TrackReference] {
        &self.data.tracks
    }


    pub fn track( &self, id: TrackId ) -> Option<&TrackReference> {
        self.data.tracks.iter().find( |t| t.id == id )
    }


    pub fn favorites( &self ) -> Vec<TrackReference> {
        self.data.tracks.iter().filter( |t| t.is_favorite ).cloned().collect()
    }


    pub fn source( &self ) -> &Source {
        &self.data.source
    }


    /// Selects the source the next queue is built from.
    pub fn set_source( &mut self, source: Source ) -> Result<(), StoreError> {
        if let Source::Playlist( ref name ) = source {
            self.playlist( name ).ok_or_else( || StoreError::UnknownPlaylist( name.clone() ) )?;
        }
        self.data.source = source;
        self.save()
    }


    /// Tracks of the selected source, in order.
    ///
    /// Playlist entries whose track has been removed are skipped.
    pub fn current_source( &self ) -> Vec<TrackReference> {
        match &self.data.source {
            Source::Library => self.data.tracks.clone(),
            Source::Favorites => self.favorites(),
            Source::Playlist( name ) => self
                .playlist( name )
                .map( |p| p.tracks.iter().filter_map( |id| self.track( *id ).cloned() ).collect() )
                .unwrap_or_default(),
        }
    }


    /// Flips the favorite flag.
    ///
    /// @returns The updated track
    pub fn toggle_favorite( &mut self, id: TrackId ) -> Result<TrackReference, StoreError> {
        let track = self.data.tracks
            .iter_mut()
            .find( |t| t.id == id )
            .ok_or( StoreError::UnknownTrack( id ) )?;
        track.is_favorite = !track.is_favorite;
        let track = track.clone();
        self.save()?;
        Ok( track )
    }


    pub fn playlists( &self ) -> &[Playlist] {
        &self.data.playlists
    }


    pub fn playlist( &self, name: &str ) -> Option<&Playlist> {
        self.data.playlists.iter().find( |p| p.name.eq_ignore_ascii_case( name ) )
    }


    pub fn create_playlist( &mut self, name: &str ) -> Result<(), StoreError> {
        if self.playlist( name ).is_some() {
            return Err( StoreError::DuplicatePlaylist( name.to_string() ) );
        }
        self.data.playlists.push( Playlist { name: name.to_string(), tracks: Vec::new() } );
        self.save()
    }


    pub fn add_to_playlist( &mut self, name: &str, id: TrackId ) -> Result<(), StoreError> {
        if self.track( id ).is_none() {
            return Err( StoreError::UnknownTrack( id ) );
        }
        let playlist = self.data.playlists
            .iter_mut()
            .find( |p| p.name.eq_ignore_ascii_case( name ) )
            .ok_or_else( || StoreError::UnknownPlaylist( name.to_string() ) )?;
        playlist.tracks.push( id );
        self.save()
    }


    /// Writes back the fields playback is allowed to change.
    ///
    /// Display fields and the favorite flag belong to the store and are kept.
    pub fn write_playback_fields( &mut self, update: &TrackReference ) -> Result<(), StoreError> {
        let track = self.data.tracks
            .iter_mut()
            .find( |t| t.id == update.id )
            .ok_or( StoreError::UnknownTrack( update.id ) )?;
        let unchanged = track.primary_path == update.primary_path
            && track.bookmark == update.bookmark
            && track.duration_secs == update.duration_secs
            && track.play_count == update.play_count;
        if unchanged {
            return Ok(());
        }
        track.primary_path = update.primary_path.clone();
        track.bookmark = update.bookmark.clone();
        track.duration_secs = update.duration_secs;
        track.play_count = update.play_count;
        self.save()
    }
}


/// Store shared between the prompt and the control thread.
#[derive( Debug, Clone )]
pub struct SharedStore( Arc<RwLock<LibraryStore>> );


impl SharedStore {
    pub fn new( store: LibraryStore ) -> Self {
        Self( Arc::new( RwLock::new( store ) ) )
    }


    pub fn read( &self ) -> RwLockReadGuard<'_, LibraryStore> {
        self.0.read().unwrap_or_else( |poisoned| poisoned.into_inner() )
    }


    pub fn write( &self ) -> RwLockWriteGuard<'_, LibraryStore> {
        self.0.write().unwrap_or_else( |poisoned| poisoned.into_inner() )
    }


    /// Imports a file or directory and adds the results to the library.
    ///
    /// Copying and tag reading run without the lock, so playback can keep
    /// persisting while a large folder is imported.
    ///
    /// @returns Ids of the new records
    pub fn import( &self, importer: &Importer, source: &Path ) -> Result<Vec<TrackId>, StoreError> {
        let files = importer.import( source )?;
        self.write().add_imported( files )
    }
}


impl Catalog for SharedStore {
    fn fetch_favorites( &self ) -> Vec<TrackReference> {
        self.read().favorites()
    }


    fn persist( &mut self, track: &TrackReference ) -> Result<(), CatalogError> {
        self.write().write_playback_fields( track ).map_err( |e| match e {
            StoreError::UnknownTrack( id ) => CatalogError::UnknownTrack( id ),
            StoreError::Io( e ) => CatalogError::Io( e ),
            other => CatalogError::Write( other.to_string() ),
        })
    }


    fn all_tracks_in_current_source( &self ) -> Vec<TrackReference> {
        self.read().current_source()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use flexplay_core::resolver::PathBookmarks;


    struct Fixture {
        dir: TempDir,
        store: LibraryStore,
        importer: Importer,
    }


    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let managed = dir.path().join( "managed" );
            let store = LibraryStore::open( &dir.path().join( "library.json" ), &managed ).unwrap();
            let importer = Importer::new( managed, Arc::new( PathBookmarks ) );
            Self { dir, store, importer }
        }


        fn import( &mut self, name: &str ) -> TrackId {
            let source = self.dir.path().join( name );
            fs::write( &source, b"audio" ).unwrap();
            let files = self.importer.import( &source ).unwrap();
            self.store.add_imported( files ).unwrap()[ 0 ]
        }


        fn reopen( &self ) -> LibraryStore {
            LibraryStore::open( &self.dir.path().join( "library.json" ), &self.dir.path().join( "managed" ) ).unwrap()
        }
    }


    #[test]
    fn test_import_assigns_ids_and_persists() {
        let mut fx = Fixture::new();
        let a = fx.import( "a.mp3" );
        let b = fx.import( "b.mp3" );
        assert_ne!( a, b );

        let reopened = fx.reopen();
        assert_eq!( reopened.tracks().len(), 2 );
        assert_eq!( reopened.track( b ).unwrap().title, "b" );
    }


    #[test]
    fn test_sources() {
        let mut fx = Fixture::new();
        let a = fx.import( "a.mp3" );
        let b = fx.import( "b.mp3" );
        fx.store.toggle_favorite( b ).unwrap();

        assert_eq!( fx.store.current_source().len(), 2 );

        fx.store.set_source( Source::Favorites ).unwrap();
        let ids: Vec<_> = fx.store.current_source().iter().map( |t| t.id ).collect();
        assert_eq!( ids, vec![ b ] );

        fx.store.create_playlist( "Mix" ).unwrap();
        fx.store.add_to_playlist( "mix", b ).unwrap();
        fx.store.add_to_playlist( "Mix", a ).unwrap();
        fx.store.set_source( Source::Playlist( "Mix".into() ) ).unwrap();
        let ids: Vec<_> = fx.store.current_source().iter().map( |t| t.id ).collect();
        assert_eq!( ids, vec![ b, a ] );
        assert_eq!( fx.reopen().source(), &Source::Playlist( "Mix".into() ) );
    }


    #[test]
    fn test_playlist_errors() {
        let mut fx = Fixture::new();
        fx.store.create_playlist( "Mix" ).unwrap();
        assert!( matches!( fx.store.create_playlist( "MIX" ), Err( StoreError::DuplicatePlaylist( _ ) ) ) );
        assert!( matches!( fx.store.set_source( Source::Playlist( "Nope".into() ) ), Err( StoreError::UnknownPlaylist( _ ) ) ) );
        assert!( matches!( fx.store.add_to_playlist( "Mix", TrackId( 99 ) ), Err( StoreError::UnknownTrack( _ ) ) ) );
    }


    #[test]
    fn test_validate_fills_placeholders_and_repairs_paths() {
        let mut fx = Fixture::new();
        let id = fx.import( "a.mp3" );
        {
            let track = fx.store.data.tracks.iter_mut().find( |t| t.id == id ).unwrap();
            track.title = "  ".into();
            track.artist = String::new();
            track.duration_secs = -4.0;
            track.primary_path = fx.dir.path().join( "gone" ).join( "a.mp3" );
        }

        assert_eq!( fx.store.validate(), 1 );
        let track = fx.store.track( id ).unwrap();
        assert_eq!( track.title, UNTITLED );
        assert_eq!( track.artist, UNKNOWN_ARTIST );
        assert_eq!( track.duration_secs, 0.0 );
        assert_eq!( track.primary_path, fx.dir.path().join( "managed" ).join( "a.mp3" ) );
        assert_eq!( fx.store.validate(), 0 );
    }


    #[test]
    fn test_persist_keeps_store_owned_fields() {
        let mut fx = Fixture::new();
        let id = fx.import( "a.mp3" );
        fx.store.toggle_favorite( id ).unwrap();

        let mut stale = fx.store.track( id ).unwrap().clone();
        stale.is_favorite = false;
        stale.title = "Stale".into();
        stale.play_count = 3;
        stale.duration_secs = 201.5;

        let mut shared = SharedStore::new( fx.store );
        shared.persist( &stale ).unwrap();

        let store = shared.read();
        let track = store.track( id ).unwrap();
        assert!( track.is_favorite );
        assert_eq!( track.title, "a" );
        assert_eq!( track.play_count, 3 );
        assert_eq!( track.duration_secs, 201.5 );
    }


    #[test]
    fn test_persist_unknown_track() {
        let fx = Fixture::new();
        let mut shared = SharedStore::new( fx.store );
        let ghost = TrackReference::new( TrackId( 7 ), "ghost.mp3" );
        assert!( matches!( shared.persist( &ghost ), Err( CatalogError::UnknownTrack( TrackId( 7 ) ) ) ) );
    }


    #[test]
    fn test_shared_import_does_not_hold_lock_while_copying() {
        let fx = Fixture::new();
        let source = fx.dir.path().join( "album" );
        fs::create_dir_all( &source ).unwrap();
        fs::write( source.join( "one.mp3" ), b"audio" ).unwrap();
        fs::write( source.join( "two.mp3" ), b"audio" ).unwrap();

        let shared = SharedStore::new( fx.store );
        let ids = shared.import( &fx.importer, &source ).unwrap();
        assert_eq!( ids.len(), 2 );

        // Released once the import returns
        let other = shared.clone();
        assert!( other.0.try_write().is_ok() );
        assert_eq!( other.read().tracks().len(), 2 );
    }


    #[test]
    fn test_import_error_leaves_catalog_untouched() {
        let fx = Fixture::new();
        let shared = SharedStore::new( fx.store );
        assert!( shared.import( &fx.importer, &fx.dir.path().join( "missing.mp3" ) ).is_err() );
        assert!( shared.read().tracks().is_empty() );
        assert!( !fx.dir.path().join( "library.json" ).exists() );
    }


    #[test]
    fn test_artwork_lives_beside_the_catalog() {
        let mut fx = Fixture::new();
        let source = fx.dir.path().join( "cover.mp3" );
        fs::write( &source, b"audio" ).unwrap();
        let mut files = fx.importer.import( &source ).unwrap();
        files[ 0 ].artwork = Some( Arc::from( &b"\x89PNG cover"[ .. ] ) );
        let id = fx.store.add_imported( files ).unwrap()[ 0 ];

        let json = fs::read_to_string( fx.dir.path().join( "library.json" ) ).unwrap();
        assert!( !json.contains( "artwork" ) );
        assert_eq!( fs::read( fx.dir.path().join( "artwork" ).join( id.0.to_string() ) ).unwrap(), b"\x89PNG cover" );

        let reopened = fx.reopen();
        assert_eq!( reopened.track( id ).unwrap().artwork.as_deref(), Some( &b"\x89PNG cover"[ .. ] ) );
    }


    #[test]
    fn test_unchanged_persist_skips_rewrite() {
        let mut fx = Fixture::new();
        let id = fx.import( "a.mp3" );
        let catalog = fx.dir.path().join( "library.json" );
        fs::remove_file( &catalog ).unwrap();

        let same = fx.store.track( id ).unwrap().clone();
        fx.store.write_playback_fields( &same ).unwrap();
        assert!( !catalog.exists() );

        let mut played = same;
        played.play_count += 1;
        fx.store.write_playback_fields( &played ).unwrap();
        assert!( catalog.exists() );
    }


    #[test]
    fn test_malformed_catalog_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join( "library.json" );
        fs::write( &path, "{ nope" ).unwrap();
        assert!( matches!( LibraryStore::open( &path, dir.path() ), Err( StoreError::Json( _ ) ) ) );
    }
}
