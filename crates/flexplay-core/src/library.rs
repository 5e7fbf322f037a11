//! Library scanning and import
//!
//! Discovers audio files by extension and copies imports into the managed
//! directory, which is also where the resolver looks for relocated files.

use std::fs;
use std::path::{ Path, PathBuf };
use std::sync::Arc;

use thiserror::Error;

use crate::decoder::Decoder;
use crate::resolver::BookmarkHost;
use crate::track::{ Bookmark, UNKNOWN_ARTIST, UNTITLED };


/// Supported audio file extensions.
const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "wav", "m4a", "aac", "opus", "aiff", "alac",
];


/// Errors that can occur during library operations.
#[derive( Debug, Error )]
pub enum LibraryError {
    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Path not found: {0}" )]
    NotFound( PathBuf ),

    #[error( "Not an audio file: {0}" )]
    Unsupported( PathBuf ),
}


/// Default managed-import directory for this platform.
pub fn managed_import_dir() -> Option<PathBuf> {
    if cfg!( target_os = "windows" ) {
        dirs::audio_dir().map( |p| p.join( "FlexPlay" ) )
    } else {
        dirs::data_local_dir().map( |p| p.join( "flexplay" ).join( "music" ) )
    }
}


/// Checks if a file has a supported audio extension.
pub fn is_audio_file( path: &Path ) -> bool {
    path.extension()
        .and_then( |e| e.to_str() )
        .map( |e| SUPPORTED_EXTENSIONS.contains( &e.to_lowercase().as_str() ) )
        .unwrap_or( false )
}


/// Recursively lists audio files under `dir`, sorted by path.
///
/// Unreadable subdirectories are skipped.
pub fn scan( dir: &Path ) -> Result<Vec<PathBuf>, LibraryError> {
    let mut found = Vec::new();
    scan_recursive( dir, &mut found, true )?;
    found.sort();
    tracing::info!( "Found {} audio files in {:?}", found.len(), dir );
    Ok( found )
}


fn scan_recursive( dir: &Path, found: &mut Vec<PathBuf>, root: bool ) -> Result<(), LibraryError> {
    let entries = match fs::read_dir( dir ) {
        Ok( e ) => e,
        Err( e ) if e.kind() == std::io::ErrorKind::NotFound && root => {
            return Err( LibraryError::NotFound( dir.to_path_buf() ) );
        }
        Err( e ) if !root => {
            tracing::warn!( "Skipping {:?}: {}", dir, e );
            return Ok(());
        }
        Err( e ) => return Err( LibraryError::Io( e ) ),
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_recursive( &path, found, false )?;
        } else if is_audio_file( &path ) {
            found.push( path );
        }
    }

    Ok(())
}


/// A file copied into the managed directory, ready to become a catalog record.
#[derive( Debug, Clone )]
pub struct ImportedFile {
    pub path: PathBuf,
    pub bookmark: Option<Bookmark>,
    pub title: String,
    pub artist: String,
    pub duration_secs: f64,
    pub artwork: Option<Arc<[u8]>>,
}


/// Copies audio files into the managed directory.
pub struct Importer {
    managed_dir: PathBuf,
    host: Arc<dyn BookmarkHost>,
}


impl Importer {
    pub fn new( managed_dir: PathBuf, host: Arc<dyn BookmarkHost> ) -> Self {
        Self { managed_dir, host }
    }


    /// Imports a file, or every audio file under a directory.
    ///
    /// Files that fail individually are logged and skipped.
    pub fn import( &self, source: &Path ) -> Result<Vec<ImportedFile>, LibraryError> {
        if source.is_dir() {
            let mut imported = Vec::new();
            for file in scan( source )? {
                match self.import_file( &file ) {
                    Ok( item ) => imported.push( item ),
                    Err( e ) => tracing::warn!( "Skipping {:?}: {}", file, e ),
                }
            }
            Ok( imported )
        } else if source.exists() {
            Ok( vec![ self.import_file( source )? ] )
        } else {
            Err( LibraryError::NotFound( source.to_path_buf() ) )
        }
    }


    /// Copies one file (unless it already lives in the managed directory) and reads its tags.
    pub fn import_file( &self, source: &Path ) -> Result<ImportedFile, LibraryError> {
        if !is_audio_file( source ) {
            return Err( LibraryError::Unsupported( source.to_path_buf() ) );
        }

        fs::create_dir_all( &self.managed_dir )?;
        let path = if source.parent() == Some( self.managed_dir.as_path() ) {
            source.to_path_buf()
        } else {
            let destination = self.free_destination( source )?;
            fs::copy( source, &destination )?;
            destination
        };

        let stem = path
            .file_stem()
            .map( |s| s.to_string_lossy().into_owned() )
            .unwrap_or_else( || UNTITLED.to_string() );

        let mut item = ImportedFile {
            bookmark: self.host.create( &path ).ok(),
            title: stem,
            artist: UNKNOWN_ARTIST.to_string(),
            duration_secs: 0.0,
            artwork: None,
            path,
        };

        match Decoder::open( &item.path ) {
            Ok( mut decoder ) => {
                let meta = decoder.metadata();
                item.duration_secs = decoder.duration().unwrap_or( 0.0 );
                if let Some( title ) = meta.title {
                    item.title = title;
                }
                if let Some( artist ) = meta.artist {
                    item.artist = artist;
                }
                item.artwork = meta.artwork;
            }
            Err( e ) => tracing::warn!( "Could not read tags of {:?}: {}", item.path, e ),
        }

        tracing::info!( "Imported {:?}", item.path );
        Ok( item )
    }


    /// First `name`, `name (1)`, `name (2)`… that does not exist yet.
    fn free_destination( &self, source: &Path ) -> Result<PathBuf, LibraryError> {
        let name = source.file_name().ok_or_else( || LibraryError::Unsupported( source.to_path_buf() ) )?;
        let candidate = self.managed_dir.join( name );
        if !candidate.exists() {
            return Ok( candidate );
        }

        let stem = source.file_stem().map( |s| s.to_string_lossy().into_owned() ).unwrap_or_default();
        let ext = source.extension().map( |e| e.to_string_lossy().into_owned() ).unwrap_or_default();
        let mut n = 1;
        loop {
            let candidate = self.managed_dir.join( format!( "{} ({}).{}", stem, n, ext ) );
            if !candidate.exists() {
                return Ok( candidate );
            }
            n += 1;
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::resolver::PathBookmarks;


    fn importer( root: &TempDir ) -> Importer {
        Importer::new( root.path().join( "managed" ), Arc::new( PathBookmarks ) )
    }


    #[test]
    fn test_is_audio_file() {
        assert!( is_audio_file( Path::new( "a/b/song.MP3" ) ) );
        assert!( is_audio_file( Path::new( "song.flac" ) ) );
        assert!( !is_audio_file( Path::new( "cover.jpg" ) ) );
        assert!( !is_audio_file( Path::new( "README" ) ) );
    }


    #[test]
    fn test_scan_recurses_and_filters() {
        let root = TempDir::new().unwrap();
        let nested = root.path().join( "album" ).join( "disc1" );
        fs::create_dir_all( &nested ).unwrap();
        fs::write( root.path().join( "a.mp3" ), b"x" ).unwrap();
        fs::write( nested.join( "b.flac" ), b"x" ).unwrap();
        fs::write( nested.join( "cover.png" ), b"x" ).unwrap();

        let found = scan( root.path() ).unwrap();
        assert_eq!( found.len(), 2 );
        assert!( found.iter().any( |p| p.ends_with( "b.flac" ) ) );
    }


    #[test]
    fn test_scan_missing_root() {
        let root = TempDir::new().unwrap();
        assert!( matches!( scan( &root.path().join( "nope" ) ), Err( LibraryError::NotFound( _ ) ) ) );
    }


    #[test]
    fn test_import_copies_with_placeholders() {
        let root = TempDir::new().unwrap();
        let source = root.path().join( "Night Drive.mp3" );
        fs::write( &source, b"not really audio" ).unwrap();

        let item = importer( &root ).import_file( &source ).unwrap();
        assert_eq!( item.path, root.path().join( "managed" ).join( "Night Drive.mp3" ) );
        assert!( item.path.exists() );
        assert!( source.exists() );
        assert_eq!( item.title, "Night Drive" );
        assert_eq!( item.artist, UNKNOWN_ARTIST );
        assert_eq!( item.duration_secs, 0.0 );
        assert!( item.bookmark.is_some() );
    }


    #[test]
    fn test_import_picks_free_name() {
        let root = TempDir::new().unwrap();
        let source = root.path().join( "song.mp3" );
        fs::write( &source, b"x" ).unwrap();
        let importer = importer( &root );

        let first = importer.import_file( &source ).unwrap();
        let second = importer.import_file( &source ).unwrap();
        assert_ne!( first.path, second.path );
        assert!( second.path.ends_with( "song (1).mp3" ) );
    }


    #[test]
    fn test_import_directory_skips_other_files() {
        let root = TempDir::new().unwrap();
        let album = root.path().join( "album" );
        fs::create_dir_all( &album ).unwrap();
        fs::write( album.join( "1.ogg" ), b"x" ).unwrap();
        fs::write( album.join( "2.ogg" ), b"x" ).unwrap();
        fs::write( album.join( "notes.txt" ), b"x" ).unwrap();

        let imported = importer( &root ).import( &album ).unwrap();
        assert_eq!( imported.len(), 2 );
    }


    #[test]
    fn test_import_rejects_non_audio() {
        let root = TempDir::new().unwrap();
        let source = root.path().join( "notes.txt" );
        fs::write( &source, b"x" ).unwrap();
        assert!( matches!( importer( &root ).import_file( &source ), Err( LibraryError::Unsupported( _ ) ) ) );
    }
}
