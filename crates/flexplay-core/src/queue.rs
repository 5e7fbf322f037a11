//! Playback queue
//!
//! Ordered track list with a cursor, repeat mode and shuffle flag. Shuffling
//! permutes the items themselves; there is no separate shadow order.

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::track::{ TrackId, TrackReference };


/// No further track in the requested direction under the current repeat mode.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Error )]
#[error( "Queue exhausted" )]
pub struct QueueExhausted;


/// Repeat mode for the queue.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum RepeatMode {
    #[default]
    None,
    All,
    One,
}


impl RepeatMode {
    /// Returns the next mode in the None → All → One cycle.
    pub fn cycle( self ) -> Self {
        match self {
            RepeatMode::None => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::None,
        }
    }
}


/// Direction of a cursor move.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Direction {
    Forward,
    Backward,
}


/// Playback queue.
#[derive( Debug, Default, Clone )]
pub struct PlaybackQueue {
    items: Vec<TrackReference>,
    cursor: usize,
    repeat: RepeatMode,
    shuffled: bool,
}


impl PlaybackQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }


    /// Replaces the items and resets the cursor.
    pub fn set_playlist( &mut self, items: Vec<TrackReference> ) {
        self.items = items;
        self.cursor = 0;
    }


    /// Points the cursor at `id` if it is in the queue.
    ///
    /// @returns true if the track was found
    pub fn set_current( &mut self, id: TrackId ) -> bool {
        match self.items.iter().position( |t| t.id == id ) {
            Some( index ) => {
                self.cursor = index;
                true
            }
            None => false,
        }
    }


    /// Gets the item under the cursor.
    pub fn current( &self ) -> Option<&TrackReference> {
        self.items.get( self.cursor )
    }


    /// Moves the cursor and returns the new current item.
    ///
    /// Forward stays put under `RepeatMode::One` and wraps past the end under
    /// `RepeatMode::All`, reshuffling first if shuffle is on. Backward never wraps.
    pub fn advance( &mut self, direction: Direction ) -> Result<&TrackReference, QueueExhausted> {
        if self.items.is_empty() {
            return Err( QueueExhausted );
        }

        match direction {
            // Repeat-one pins the cursor so the caller replays the same item
            Direction::Forward if self.repeat == RepeatMode::One => {}
            Direction::Forward => {
                if self.cursor + 1 < self.items.len() {
                    self.cursor += 1;
                } else if self.repeat == RepeatMode::All {
                    if self.shuffled {
                        self.items.shuffle( &mut rand::thread_rng() );
                    }
                    self.cursor = 0;
                } else {
                    return Err( QueueExhausted );
                }
            }
            Direction::Backward => {
                if self.cursor == 0 {
                    return Err( QueueExhausted );
                }
                self.cursor -= 1;
            }
        }

        self.items.get( self.cursor ).ok_or( QueueExhausted )
    }


    /// Sets shuffle mode. Turning it on permutes the items and resets the cursor.
    pub fn set_shuffled( &mut self, shuffled: bool ) {
        self.shuffled = shuffled;
        if shuffled {
            self.items.shuffle( &mut rand::thread_rng() );
            self.cursor = 0;
        }
    }


    /// Gets shuffle mode.
    pub fn shuffled( &self ) -> bool {
        self.shuffled
    }


    /// Sets repeat mode.
    pub fn set_repeat( &mut self, repeat: RepeatMode ) {
        self.repeat = repeat;
    }


    /// Gets repeat mode.
    pub fn repeat( &self ) -> RepeatMode {
        self.repeat
    }


    /// Replaces the stored copy of a track with a fresher one.
    pub fn refresh( &mut self, track: &TrackReference ) {
        if let Some( slot ) = self.items.iter_mut().find( |t| t.id == track.id ) {
            *slot = track.clone();
        }
    }


    /// Gets all items in queue order.
    pub fn items( &self ) -> &[TrackReference] {
        &self.items
    }


    pub fn cursor( &self ) -> usize {
        self.cursor
    }


    pub fn len( &self ) -> usize {
        self.items.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.items.is_empty()
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn tracks( n: u64 ) -> Vec<TrackReference> {
        ( 0..n ).map( |i| TrackReference::new( TrackId( i ), format!( "/m/{}.mp3", i ) ) ).collect()
    }


    fn queue( n: u64, repeat: RepeatMode ) -> PlaybackQueue {
        let mut q = PlaybackQueue::new();
        q.set_playlist( tracks( n ) );
        q.set_repeat( repeat );
        q
    }


    #[test]
    fn test_advance_forward_moves_cursor() {
        let mut q = queue( 3, RepeatMode::None );
        assert_eq!( q.advance( Direction::Forward ).unwrap().id, TrackId( 1 ) );
        assert_eq!( q.cursor(), 1 );
    }


    #[test]
    fn test_repeat_all_wraps_to_first() {
        let mut q = queue( 3, RepeatMode::All );
        q.set_current( TrackId( 2 ) );
        assert_eq!( q.advance( Direction::Forward ).unwrap().id, TrackId( 0 ) );
        assert_eq!( q.cursor(), 0 );
    }


    #[test]
    fn test_repeat_none_exhausts_and_keeps_cursor() {
        let mut q = queue( 3, RepeatMode::None );
        q.set_current( TrackId( 2 ) );
        assert_eq!( q.advance( Direction::Forward ), Err( QueueExhausted ) );
        assert_eq!( q.cursor(), 2 );
    }


    #[test]
    fn test_repeat_one_returns_same_item() {
        let mut q = queue( 3, RepeatMode::One );
        q.set_current( TrackId( 1 ) );
        assert_eq!( q.advance( Direction::Forward ).unwrap().id, TrackId( 1 ) );
        assert_eq!( q.cursor(), 1 );

        q.set_current( TrackId( 2 ) );
        assert_eq!( q.advance( Direction::Forward ).unwrap().id, TrackId( 2 ) );
        assert_eq!( q.cursor(), 2 );

        // Backward still moves
        assert_eq!( q.advance( Direction::Backward ).unwrap().id, TrackId( 1 ) );
    }


    #[test]
    fn test_backward_never_wraps() {
        let mut q = queue( 3, RepeatMode::All );
        assert_eq!( q.advance( Direction::Backward ), Err( QueueExhausted ) );
        assert_eq!( q.cursor(), 0 );

        q.set_current( TrackId( 2 ) );
        assert_eq!( q.advance( Direction::Backward ).unwrap().id, TrackId( 1 ) );
    }


    #[test]
    fn test_empty_queue_always_exhausted() {
        for repeat in [ RepeatMode::None, RepeatMode::All, RepeatMode::One ] {
            let mut q = queue( 0, repeat );
            assert_eq!( q.advance( Direction::Forward ), Err( QueueExhausted ) );
            assert_eq!( q.advance( Direction::Backward ), Err( QueueExhausted ) );
        }
    }


    #[test]
    fn test_shuffle_permutes_and_resets_cursor() {
        let mut q = queue( 20, RepeatMode::None );
        q.set_current( TrackId( 5 ) );
        q.set_shuffled( true );

        assert_eq!( q.cursor(), 0 );
        assert!( q.shuffled() );
        let mut ids: Vec<_> = q.items().iter().map( |t| t.id ).collect();
        ids.sort();
        assert_eq!( ids, ( 0..20 ).map( TrackId ).collect::<Vec<_>>() );
    }


    #[test]
    fn test_unshuffle_keeps_order() {
        let mut q = queue( 10, RepeatMode::None );
        q.set_shuffled( true );
        let shuffled: Vec<_> = q.items().iter().map( |t| t.id ).collect();
        q.set_shuffled( false );
        let after: Vec<_> = q.items().iter().map( |t| t.id ).collect();
        assert_eq!( shuffled, after );
    }


    #[test]
    fn test_set_current_unknown_track() {
        let mut q = queue( 3, RepeatMode::None );
        q.set_current( TrackId( 1 ) );
        assert!( !q.set_current( TrackId( 99 ) ) );
        assert_eq!( q.cursor(), 1 );
    }


    #[test]
    fn test_set_playlist_resets_cursor() {
        let mut q = queue( 3, RepeatMode::None );
        q.set_current( TrackId( 2 ) );
        q.set_playlist( tracks( 5 ) );
        assert_eq!( q.cursor(), 0 );
        assert_eq!( q.len(), 5 );
    }


    #[test]
    fn test_refresh_replaces_stored_copy() {
        let mut q = queue( 3, RepeatMode::None );
        let mut updated = q.items()[ 1 ].clone();
        updated.play_count = 9;
        q.refresh( &updated );
        assert_eq!( q.items()[ 1 ].play_count, 9 );
    }


    #[test]
    fn test_repeat_cycle() {
        assert_eq!( RepeatMode::None.cycle(), RepeatMode::All );
        assert_eq!( RepeatMode::All.cycle(), RepeatMode::One );
        assert_eq!( RepeatMode::One.cycle(), RepeatMode::None );
    }
}
