//! Track file resolution
//!
//! Turns a `TrackReference` into a readable file handle. The durable bookmark
//! is tried first, then the stored path, then the managed import directory.
//! Any scoped access grant opened on the way is released exactly once, when
//! the returned handle is dropped or as soon as the step that opened it fails.

use std::fs::File;
use std::path::{ Path, PathBuf };
use std::sync::Arc;

use thiserror::Error;

use crate::track::{ Bookmark, TrackReference };


/// Errors that can occur while resolving a track.
#[derive( Debug, Error )]
pub enum ResolveError {
    #[error( "File missing: {0}" )]
    FileMissing( PathBuf ),

    #[error( "Bookmark could not be resolved: {0}" )]
    Bookmark( String ),
}


/// A bookmark resolved back into a location.
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct ResolvedBookmark {
    pub path: PathBuf,
    /// The bookmark still resolved, but should be re-created from `path`
    pub stale: bool,
}


/// The host platform's secure resource access facility.
pub trait BookmarkHost: Send + Sync {
    /// Resolves a bookmark into a location.
    fn resolve( &self, bookmark: &Bookmark ) -> Result<ResolvedBookmark, ResolveError>;

    /// Creates a fresh bookmark for a location.
    fn create( &self, path: &Path ) -> Result<Bookmark, ResolveError>;

    /// Begins a scoped access session. Returns false if access was refused.
    fn begin_access( &self, path: &Path ) -> bool;

    /// Ends a scoped access session started with `begin_access`.
    fn end_access( &self, path: &Path );
}


/// Bookmarks for plain filesystems: the token is the canonical path.
///
/// A bookmark is stale when its path still resolves but is no longer
/// canonical (a symlinked directory moved, for instance).
#[derive( Debug, Clone, Copy, Default )]
pub struct PathBookmarks;


impl BookmarkHost for PathBookmarks {
    fn resolve( &self, bookmark: &Bookmark ) -> Result<ResolvedBookmark, ResolveError> {
        let raw = std::str::from_utf8( bookmark.as_bytes() )
            .map_err( |e| ResolveError::Bookmark( e.to_string() ) )?;
        let path = PathBuf::from( raw );

        let canonical = path
            .canonicalize()
            .map_err( |e| ResolveError::Bookmark( format!( "{}: {}", raw, e ) ) )?;

        Ok( ResolvedBookmark {
            stale: canonical != path,
            path: canonical,
        })
    }


    fn create( &self, path: &Path ) -> Result<Bookmark, ResolveError> {
        let canonical = path
            .canonicalize()
            .map_err( |e| ResolveError::Bookmark( format!( "{}: {}", path.display(), e ) ) )?;
        let raw = canonical
            .to_str()
            .ok_or_else( || ResolveError::Bookmark( "path is not valid UTF-8".into() ) )?;
        Ok( Bookmark( raw.as_bytes().to_vec() ) )
    }


    fn begin_access( &self, path: &Path ) -> bool {
        is_readable( path )
    }


    fn end_access( &self, _path: &Path ) {}
}


/// A scoped access grant, released on drop.
pub struct ScopedAccess {
    host: Arc<dyn BookmarkHost>,
    path: PathBuf,
}


impl ScopedAccess {
    /// Begins access on `path`, or returns None if the host refused.
    fn begin( host: &Arc<dyn BookmarkHost>, path: &Path ) -> Option<Self> {
        if host.begin_access( path ) {
            Some( Self { host: Arc::clone( host ), path: path.to_path_buf() } )
        } else {
            None
        }
    }
}


impl Drop for ScopedAccess {
    fn drop( &mut self ) {
        tracing::debug!( "Releasing scoped access: {:?}", self.path );
        self.host.end_access( &self.path );
    }
}


impl std::fmt::Debug for ScopedAccess {
    fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
        f.debug_struct( "ScopedAccess" ).field( "path", &self.path ).finish()
    }
}


/// A readable location, holding its access grant (if any) for as long as it lives.
#[derive( Debug )]
pub struct ReadableHandle {
    path: PathBuf,
    access: Option<ScopedAccess>,
}


impl ReadableHandle {
    pub fn path( &self ) -> &Path {
        &self.path
    }


    /// Returns true if the handle holds a scoped access grant.
    pub fn is_scoped( &self ) -> bool {
        self.access.is_some()
    }
}


/// A change the resolver made to the track that should be persisted.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum Repair {
    BookmarkRefreshed,
    PathRepaired( PathBuf ),
}


/// Successful resolution.
#[derive( Debug )]
pub struct Resolved {
    pub handle: ReadableHandle,
    pub repairs: Vec<Repair>,
}


/// Resolves tracks to readable files.
pub struct FileResolver {
    host: Arc<dyn BookmarkHost>,
    managed_dir: PathBuf,
}


impl FileResolver {
    /// Creates a resolver.
    ///
    /// @param host - Bookmark facility of the host platform
    /// @param managed_dir - Directory imports are copied into
    pub fn new( host: Arc<dyn BookmarkHost>, managed_dir: PathBuf ) -> Self {
        Self { host, managed_dir }
    }


    /// Resolves `track` into a readable handle.
    ///
    /// Refreshes a stale bookmark and repairs `primary_path` in place; the
    /// returned repairs tell the caller what to persist.
    pub fn resolve( &self, track: &mut TrackReference ) -> Result<Resolved, ResolveError> {
        let mut repairs = Vec::new();

        if let Some( bookmark ) = track.bookmark.clone() {
            match self.host.resolve( &bookmark ) {
                Ok( resolved ) => {
                    if resolved.stale && is_readable( &resolved.path ) {
                        match self.host.create( &resolved.path ) {
                            Ok( fresh ) => {
                                tracing::info!( "Refreshed stale bookmark for {}", track.id );
                                track.bookmark = Some( fresh );
                                repairs.push( Repair::BookmarkRefreshed );
                            }
                            Err( e ) => tracing::warn!( "Could not refresh bookmark for {}: {}", track.id, e ),
                        }
                    }

                    match ScopedAccess::begin( &self.host, &resolved.path ) {
                        Some( access ) if is_readable( &resolved.path ) => {
                            return Ok( Resolved {
                                handle: ReadableHandle { path: resolved.path, access: Some( access ) },
                                repairs,
                            });
                        }
                        Some( _ ) => {
                            tracing::debug!( "Bookmark location not readable: {:?}", resolved.path );
                        }
                        None => {
                            tracing::debug!( "Scoped access refused: {:?}", resolved.path );
                        }
                    }
                }
                Err( e ) => tracing::debug!( "Bookmark for {} did not resolve: {}", track.id, e ),
            }
        }

        if is_readable( &track.primary_path ) {
            return Ok( Resolved {
                handle: ReadableHandle { path: track.primary_path.clone(), access: None },
                repairs,
            });
        }

        if let Some( candidate ) = self.managed_candidate( &track.primary_path ) {
            if is_readable( &candidate ) {
                tracing::info!( "Repaired path of {}: {:?}", track.id, candidate );
                track.primary_path = candidate.clone();
                repairs.push( Repair::PathRepaired( candidate.clone() ) );
                return Ok( Resolved {
                    handle: ReadableHandle { path: candidate, access: None },
                    repairs,
                });
            }
        }

        tracing::warn!( "File missing for {}: {:?}", track.id, track.primary_path );
        Err( ResolveError::FileMissing( track.primary_path.clone() ) )
    }


    /// Returns the managed-directory location for a path's base name.
    pub fn managed_candidate( &self, path: &Path ) -> Option<PathBuf> {
        let name = path.file_name()?;
        let candidate = self.managed_dir.join( name );
        if candidate == path {
            None
        } else {
            Some( candidate )
        }
    }
}


/// Returns true if `path` is a regular file that can be opened for reading.
pub fn is_readable( path: &Path ) -> bool {
    path.is_file() && File::open( path ).is_ok()
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{ AtomicUsize, Ordering };

    use crate::track::TrackId;


    /// Host that resolves every bookmark to a fixed path.
    #[derive( Default )]
    struct FakeHost {
        target: PathBuf,
        stale: bool,
        refuse_access: bool,
        begun: AtomicUsize,
        ended: AtomicUsize,
        created: AtomicUsize,
    }


    impl BookmarkHost for FakeHost {
        fn resolve( &self, bookmark: &Bookmark ) -> Result<ResolvedBookmark, ResolveError> {
            if bookmark.as_bytes() == b"broken" {
                return Err( ResolveError::Bookmark( "broken".into() ) );
            }
            // Re-created bookmarks are never stale
            let stale = self.stale && bookmark.as_bytes() != b"fresh";
            Ok( ResolvedBookmark { path: self.target.clone(), stale } )
        }


        fn create( &self, _path: &Path ) -> Result<Bookmark, ResolveError> {
            self.created.fetch_add( 1, Ordering::SeqCst );
            Ok( Bookmark( b"fresh".to_vec() ) )
        }


        fn begin_access( &self, _path: &Path ) -> bool {
            if self.refuse_access {
                return false;
            }
            self.begun.fetch_add( 1, Ordering::SeqCst );
            true
        }


        fn end_access( &self, _path: &Path ) {
            self.ended.fetch_add( 1, Ordering::SeqCst );
        }
    }


    fn touch( path: &Path ) {
        fs::write( path, b"data" ).unwrap();
    }


    #[test]
    fn test_without_bookmark_uses_primary_path() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join( "song.mp3" );
        touch( &song );

        let resolver = FileResolver::new( Arc::new( PathBookmarks ), dir.path().join( "managed" ) );
        let mut track = TrackReference::new( TrackId( 1 ), &song );
        let resolved = resolver.resolve( &mut track ).unwrap();

        assert_eq!( resolved.handle.path(), song.as_path() );
        assert!( !resolved.handle.is_scoped() );
        assert!( resolved.repairs.is_empty() );
    }


    #[test]
    fn test_without_bookmark_falls_back_to_managed_dir() {
        let dir = tempfile::tempdir().unwrap();
        let managed = dir.path().join( "managed" );
        fs::create_dir_all( &managed ).unwrap();
        touch( &managed.join( "song.mp3" ) );

        let resolver = FileResolver::new( Arc::new( PathBookmarks ), managed.clone() );
        let mut track = TrackReference::new( TrackId( 1 ), dir.path().join( "gone" ).join( "song.mp3" ) );
        let resolved = resolver.resolve( &mut track ).unwrap();

        assert_eq!( track.primary_path, managed.join( "song.mp3" ) );
        assert_eq!( resolved.repairs, vec![ Repair::PathRepaired( managed.join( "song.mp3" ) ) ] );
    }


    #[test]
    fn test_missing_everywhere_is_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = FileResolver::new( Arc::new( PathBookmarks ), dir.path().to_path_buf() );
        let mut track = TrackReference::new( TrackId( 1 ), "/nowhere/song.mp3" );

        let result = resolver.resolve( &mut track );
        assert!( matches!( result, Err( ResolveError::FileMissing( _ ) ) ) );
        assert_eq!( track.primary_path, PathBuf::from( "/nowhere/song.mp3" ) );
    }


    #[test]
    fn test_stale_bookmark_is_refreshed_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join( "moved.mp3" );
        touch( &target );

        let host = Arc::new( FakeHost { target: target.clone(), stale: true, ..Default::default() } );
        let resolver = FileResolver::new( host.clone(), dir.path().to_path_buf() );
        let mut track = TrackReference::new( TrackId( 1 ), "/old/location.mp3" );
        track.bookmark = Some( Bookmark( b"old".to_vec() ) );

        let first = resolver.resolve( &mut track ).unwrap();
        assert_eq!( first.repairs, vec![ Repair::BookmarkRefreshed ] );
        assert_eq!( track.bookmark, Some( Bookmark( b"fresh".to_vec() ) ) );
        assert_eq!( first.handle.path(), target.as_path() );
        assert!( first.handle.is_scoped() );
        drop( first );

        let second = resolver.resolve( &mut track ).unwrap();
        assert!( second.repairs.is_empty() );
        assert_eq!( host.created.load( Ordering::SeqCst ), 1 );
    }


    #[test]
    fn test_scoped_access_released_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join( "a.mp3" );
        touch( &target );

        let host = Arc::new( FakeHost { target, ..Default::default() } );
        let resolver = FileResolver::new( host.clone(), dir.path().to_path_buf() );
        let mut track = TrackReference::new( TrackId( 1 ), "/x/a.mp3" );
        track.bookmark = Some( Bookmark( b"ok".to_vec() ) );

        let resolved = resolver.resolve( &mut track ).unwrap();
        assert_eq!( host.begun.load( Ordering::SeqCst ), 1 );
        assert_eq!( host.ended.load( Ordering::SeqCst ), 0 );
        drop( resolved );
        assert_eq!( host.ended.load( Ordering::SeqCst ), 1 );
    }


    #[test]
    fn test_unreadable_bookmark_location_releases_access_and_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join( "primary.mp3" );
        touch( &primary );

        let host = Arc::new( FakeHost { target: dir.path().join( "vanished.mp3" ), ..Default::default() } );
        let resolver = FileResolver::new( host.clone(), dir.path().join( "managed" ) );
        let mut track = TrackReference::new( TrackId( 1 ), &primary );
        track.bookmark = Some( Bookmark( b"ok".to_vec() ) );

        let resolved = resolver.resolve( &mut track ).unwrap();
        assert_eq!( resolved.handle.path(), primary.as_path() );
        assert!( !resolved.handle.is_scoped() );
        assert_eq!( host.begun.load( Ordering::SeqCst ), 1 );
        assert_eq!( host.ended.load( Ordering::SeqCst ), 1 );
    }


    #[test]
    fn test_refused_access_falls_back_to_primary_path() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join( "primary.mp3" );
        touch( &primary );

        let host = Arc::new( FakeHost { target: primary.clone(), refuse_access: true, ..Default::default() } );
        let resolver = FileResolver::new( host.clone(), dir.path().join( "managed" ) );
        let mut track = TrackReference::new( TrackId( 1 ), &primary );
        track.bookmark = Some( Bookmark( b"ok".to_vec() ) );

        let resolved = resolver.resolve( &mut track ).unwrap();
        assert!( !resolved.handle.is_scoped() );
        assert_eq!( host.ended.load( Ordering::SeqCst ), 0 );
    }


    #[test]
    fn test_broken_bookmark_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join( "primary.mp3" );
        touch( &primary );

        let host = Arc::new( FakeHost::default() );
        let resolver = FileResolver::new( host, dir.path().join( "managed" ) );
        let mut track = TrackReference::new( TrackId( 1 ), &primary );
        track.bookmark = Some( Bookmark( b"broken".to_vec() ) );

        let resolved = resolver.resolve( &mut track ).unwrap();
        assert_eq!( resolved.handle.path(), primary.as_path() );
    }


    #[test]
    fn test_path_bookmarks_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let song = dir.path().join( "song.flac" );
        touch( &song );

        let bookmark = PathBookmarks.create( &song ).unwrap();
        let resolved = PathBookmarks.resolve( &bookmark ).unwrap();
        assert!( !resolved.stale );
        assert_eq!( resolved.path, song.canonicalize().unwrap() );
    }


    #[cfg( unix )]
    #[test]
    fn test_path_bookmarks_stale_through_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join( "real" );
        fs::create_dir_all( &real ).unwrap();
        touch( &real.join( "song.mp3" ) );
        let link = dir.path().join( "link" );
        std::os::unix::fs::symlink( &real, &link ).unwrap();

        let bookmark = Bookmark( link.join( "song.mp3" ).to_str().unwrap().as_bytes().to_vec() );
        let resolved = PathBookmarks.resolve( &bookmark ).unwrap();
        assert!( resolved.stale );
        assert_eq!( resolved.path, real.join( "song.mp3" ).canonicalize().unwrap() );
    }
}
