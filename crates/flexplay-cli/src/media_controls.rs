//! System media transport controls integration
//!
//! Runs the OS media surface on its own thread:
//! - Windows: System Media Transport Controls (SMTC) through souvlaki
//! - Elsewhere: no surface; updates are drained and dropped
//!
//! Now-Playing updates arrive from the control thread over a channel and
//! button presses go back as `Control` messages.

use std::sync::mpsc::Receiver;
use std::thread;

use tokio::sync::mpsc::UnboundedSender;

use flexplay_core::bridge::{ NowPlaying, NowPlayingUpdate, RemoteCommand };
use flexplay_core::control::Control;


/// A press on the OS media surface.
#[derive( Debug, Clone, Copy, PartialEq )]
pub enum MediaControlCommand {
    Remote( RemoteCommand ),
    Stop,
}


impl From<MediaControlCommand> for Control {
    fn from( command: MediaControlCommand ) -> Self {
        match command {
            MediaControlCommand::Remote( remote ) => Control::Remote( remote ),
            MediaControlCommand::Stop => Control::Stop,
        }
    }
}


/// Whether two snapshots need a metadata push, as opposed to a progress update.
fn metadata_changed( last: Option<&NowPlaying>, next: &NowPlaying ) -> bool {
    match last {
        None => true,
        Some( last ) => {
            last.title != next.title
                || last.artist != next.artist
                || last.duration_secs != next.duration_secs
                || last.artwork.as_ref().map( |a| a.len() ) != next.artwork.as_ref().map( |a| a.len() )
        }
    }
}


#[cfg( target_os = "windows" )]
mod platform {
    use std::ffi::c_void;
    use std::time::Duration;

    use souvlaki::{ MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig, SeekDirection };
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{ GetLastError, HWND, LPARAM, LRESULT, WPARAM };
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, RegisterClassW,
        CS_HREDRAW, CS_VREDRAW, CW_USEDEFAULT, WNDCLASSW, WS_OVERLAPPEDWINDOW,
    };

    use flexplay_core::bridge::{ NowPlaying, NowPlayingState, RemoteCommand };

    use super::MediaControlCommand;

    const ERROR_CLASS_ALREADY_EXISTS: u32 = 1410;


    unsafe extern "system" fn wnd_proc( hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM ) -> LRESULT {
        DefWindowProcW( hwnd, msg, wparam, lparam )
    }


    /// Wrapper around souvlaki MediaControls.
    pub struct MediaControlsHandler {
        controls: MediaControls,
        #[allow( dead_code )]
        hwnd: HWND,
    }


    impl MediaControlsHandler {
        /// Creates the SMTC binding, or None if it is unavailable.
        pub fn new( on_command: impl Fn( MediaControlCommand ) + Send + 'static ) -> Option<Self> {
            let hwnd = Self::create_hidden_window()?;

            let config = PlatformConfig {
                dbus_name: "flexplay",
                display_name: "FlexPlay",
                hwnd: Some( hwnd.0 as *mut c_void ),
            };

            let mut controls = match MediaControls::new( config ) {
                Ok( c ) => c,
                Err( e ) => {
                    tracing::warn!( "Failed to create media controls: {:?}", e );
                    return None;
                }
            };

            let attached = controls.attach( move |event: MediaControlEvent| {
                let command = match event {
                    MediaControlEvent::Play => MediaControlCommand::Remote( RemoteCommand::Play ),
                    MediaControlEvent::Pause => MediaControlCommand::Remote( RemoteCommand::Pause ),
                    MediaControlEvent::Toggle => MediaControlCommand::Remote( RemoteCommand::Toggle ),
                    MediaControlEvent::Next => MediaControlCommand::Remote( RemoteCommand::Next ),
                    MediaControlEvent::Previous => MediaControlCommand::Remote( RemoteCommand::Previous ),
                    MediaControlEvent::Stop => MediaControlCommand::Stop,
                    MediaControlEvent::Seek( SeekDirection::Forward )
                    | MediaControlEvent::SeekBy( SeekDirection::Forward, _ ) => MediaControlCommand::Remote( RemoteCommand::SeekForward ),
                    MediaControlEvent::Seek( SeekDirection::Backward )
                    | MediaControlEvent::SeekBy( SeekDirection::Backward, _ ) => MediaControlCommand::Remote( RemoteCommand::SeekBackward ),
                    MediaControlEvent::SetPosition( MediaPosition( position ) ) => {
                        MediaControlCommand::Remote( RemoteCommand::SetPosition( position.as_secs_f64() ) )
                    }
                    other => {
                        tracing::debug!( "Ignoring media event {:?}", other );
                        return;
                    }
                };
                on_command( command );
            });
            if let Err( e ) = attached {
                tracing::warn!( "Failed to attach media control handler: {:?}", e );
                return None;
            }

            tracing::info!( "SMTC initialized with hidden window" );
            Some( Self { controls, hwnd } )
        }


        fn create_hidden_window() -> Option<HWND> {
            unsafe {
                use windows::Win32::UI::Shell::SetCurrentProcessExplicitAppUserModelID;
                use windows::core::HSTRING;

                let app_id = HSTRING::from( "FlexPlay.MusicPlayer" );
                let _ = SetCurrentProcessExplicitAppUserModelID( &app_id );

                let class_name: Vec<u16> = "FlexPlaySMTC\0".encode_utf16().collect();
                let wc = WNDCLASSW {
                    style: CS_HREDRAW | CS_VREDRAW,
                    lpfnWndProc: Some( wnd_proc ),
                    hInstance: windows::Win32::Foundation::HINSTANCE::default(),
                    lpszClassName: PCWSTR( class_name.as_ptr() ),
                    ..Default::default()
                };

                if RegisterClassW( &wc ) == 0 {
                    let error = GetLastError();
                    if error.0 != ERROR_CLASS_ALREADY_EXISTS {
                        tracing::warn!( "Failed to register SMTC window class: {:?}", error );
                        return None;
                    }
                }

                let window_name: Vec<u16> = "FlexPlay\0".encode_utf16().collect();
                let hwnd = match CreateWindowExW(
                    windows::Win32::UI::WindowsAndMessaging::WINDOW_EX_STYLE::default(),
                    PCWSTR( class_name.as_ptr() ),
                    PCWSTR( window_name.as_ptr() ),
                    WS_OVERLAPPEDWINDOW,
                    CW_USEDEFAULT,
                    CW_USEDEFAULT,
                    CW_USEDEFAULT,
                    CW_USEDEFAULT,
                    HWND::default(),
                    None,
                    None,
                    None,
                ) {
                    Ok( hwnd ) => hwnd,
                    Err( e ) => {
                        tracing::warn!( "Failed to create SMTC hidden window: {:?}", e );
                        return None;
                    }
                };

                if hwnd.0.is_null() {
                    tracing::warn!( "SMTC hidden window handle is null" );
                    return None;
                }
                Some( hwnd )
            }
        }


        /// Pushes title, artist, duration and cover.
        pub fn set_metadata( &mut self, now_playing: &NowPlaying ) {
            let cover_url = now_playing.artwork.as_deref().and_then( write_cover );
            let metadata = MediaMetadata {
                title: Some( &now_playing.title ),
                artist: Some( &now_playing.artist ),
                album: None,
                cover_url: cover_url.as_deref(),
                duration: Some( Duration::from_secs_f64( now_playing.duration_secs.max( 0.0 ) ) ),
            };
            if let Err( e ) = self.controls.set_metadata( metadata ) {
                tracing::warn!( "SMTC metadata error: {:?}", e );
            }
        }


        /// Pushes play state and elapsed time.
        pub fn set_playback( &mut self, now_playing: &NowPlaying ) {
            let progress = Some( MediaPosition( Duration::from_secs_f64( now_playing.elapsed_secs.max( 0.0 ) ) ) );
            let playback = match now_playing.state {
                NowPlayingState::Playing => MediaPlayback::Playing { progress },
                NowPlayingState::Paused => MediaPlayback::Paused { progress },
                NowPlayingState::Stopped => MediaPlayback::Stopped,
            };
            if let Err( e ) = self.controls.set_playback( playback ) {
                tracing::debug!( "Failed to set playback state: {:?}", e );
            }
        }


        pub fn clear( &mut self ) {
            if let Err( e ) = self.controls.set_playback( MediaPlayback::Stopped ) {
                tracing::debug!( "Failed to clear playback state: {:?}", e );
            }
        }
    }


    /// Writes artwork to the temp dir and returns a file URL for SMTC.
    fn write_cover( artwork: &[u8] ) -> Option<String> {
        let ext = if artwork.starts_with( b"\x89PNG" ) { "png" } else { "jpg" };
        let dir = std::env::temp_dir().join( "flexplay" );
        let path = dir.join( format!( "cover.{}", ext ) );
        if let Err( e ) = std::fs::create_dir_all( &dir ).and_then( |_| std::fs::write( &path, artwork ) ) {
            tracing::debug!( "Could not write cover art: {}", e );
            return None;
        }
        Some( format!( "file:///{}", path.display().to_string().replace( '\\', "/" ) ) )
    }
}


#[cfg( not( target_os = "windows" ) )]
mod platform {
    use flexplay_core::bridge::NowPlaying;

    use super::MediaControlCommand;


    /// Stub for platforms without media control support.
    pub struct MediaControlsHandler;


    impl MediaControlsHandler {
        /// Returns None on unsupported platforms.
        pub fn new( _on_command: impl Fn( MediaControlCommand ) + Send + 'static ) -> Option<Self> {
            None
        }


        pub fn set_metadata( &mut self, _now_playing: &NowPlaying ) {}


        pub fn set_playback( &mut self, _now_playing: &NowPlaying ) {}


        pub fn clear( &mut self ) {}
    }
}


pub use platform::MediaControlsHandler;


/// Starts the media-controls thread.
///
/// The thread exits when the update sender is dropped, which happens when
/// the control loop shuts down.
pub fn spawn(
    commands: UnboundedSender<Control>,
    updates: Receiver<NowPlayingUpdate>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name( "flexplay-media-controls".into() )
        .spawn( move || {
            let handler = MediaControlsHandler::new( move |command| {
                tracing::debug!( "Media control {:?}", command );
                let _ = commands.send( command.into() );
            });
            let Some( mut handler ) = handler else {
                tracing::debug!( "No media controls on this platform" );
                for _ in updates {}
                return;
            };

            let mut last: Option<NowPlaying> = None;
            while let Ok( first ) = updates.recv() {
                // Only the newest queued update matters
                let update = updates.try_iter().last().unwrap_or( first );
                match update {
                    NowPlayingUpdate::Publish( now_playing ) => {
                        if metadata_changed( last.as_ref(), &now_playing ) {
                            handler.set_metadata( &now_playing );
                        }
                        handler.set_playback( &now_playing );
                        last = Some( now_playing );
                    }
                    NowPlayingUpdate::Clear => {
                        handler.clear();
                        last = None;
                    }
                }
            }
        })
}


#[cfg( test )]
mod tests {
    use super::*;
    use flexplay_core::bridge::NowPlayingState;


    fn now_playing( title: &str, elapsed: f64 ) -> NowPlaying {
        NowPlaying {
            title: title.into(),
            artist: "Artist".into(),
            artwork: None,
            duration_secs: 180.0,
            elapsed_secs: elapsed,
            rate: 1.0,
            state: NowPlayingState::Playing,
        }
    }


    #[test]
    fn test_metadata_changed_ignores_progress() {
        let first = now_playing( "One", 1.0 );
        assert!( metadata_changed( None, &first ) );
        assert!( !metadata_changed( Some( &first ), &now_playing( "One", 2.0 ) ) );
        assert!( metadata_changed( Some( &first ), &now_playing( "Two", 2.0 ) ) );
    }


    #[test]
    fn test_command_maps_to_control() {
        assert!( matches!( Control::from( MediaControlCommand::Stop ), Control::Stop ) );
        assert!( matches!(
            Control::from( MediaControlCommand::Remote( RemoteCommand::Next ) ),
            Control::Remote( RemoteCommand::Next )
        ));
    }


    #[test]
    fn test_thread_exits_when_updates_close() {
        let ( commands, _rx ) = tokio::sync::mpsc::unbounded_channel();
        let ( tx, updates ) = std::sync::mpsc::channel();
        let handle = spawn( commands, updates ).unwrap();
        tx.send( NowPlayingUpdate::Publish( now_playing( "One", 0.0 ) ) ).unwrap();
        drop( tx );
        handle.join().unwrap();
    }
}
