//! Track ordering for the current container.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use widget_types::{Direction, EndOfQueueMode};

use crate::track::Track;

/// Where [`Queue::advance`] wants playback to go next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    /// Play the track at this play-order position.
    Play(usize),
    /// Restart the current track.
    Restart,
    /// Nothing left to play.
    Stop,
    /// Local queue exhausted; ask for a neighbouring container.
    Traverse(Direction),
    /// Empty queue.
    Idle,
}

/// Tracks of one container plus a play order and a cursor into it.
#[derive(Debug)]
pub struct Queue {
    tracks: Vec<Track>,
    /// Play order: indexes into `tracks`, identity unless shuffled.
    order: Vec<usize>,
    cursor: Option<usize>,
    shuffle: bool,
    rng: StdRng,
}

impl Queue {
    pub fn new(shuffle: bool) -> Self {
        Self::with_rng(shuffle, StdRng::from_os_rng())
    }

    pub fn with_rng(shuffle: bool, rng: StdRng) -> Self {
        Self {
            tracks: Vec::new(),
            order: Vec::new(),
            cursor: None,
            shuffle,
            rng,
        }
    }

    /// Replace the track set and regenerate the play order.
    pub fn replace(&mut self, tracks: Vec<Track>) {
        self.tracks = tracks;
        self.cursor = None;
        self.regenerate();
    }

    /// Toggle shuffling. The current track keeps playing and stays current.
    pub fn set_shuffle(&mut self, shuffle: bool) {
        if self.shuffle == shuffle {
            return;
        }
        self.shuffle = shuffle;
        let current = self.current_track_index();
        self.regenerate();
        if let Some(track_index) = current {
            self.cursor = self.order.iter().position(|&i| i == track_index);
        }
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle
    }

    fn regenerate(&mut self) {
        self.order = (0..self.tracks.len()).collect();
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Play-order position of the current track.
    pub fn active_index(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<&Track> {
        self.at(self.cursor?)
    }

    /// Track at a play-order position.
    pub fn at(&self, position: usize) -> Option<&Track> {
        self.tracks.get(*self.order.get(position)?)
    }

    fn current_track_index(&self) -> Option<usize> {
        self.order.get(self.cursor?).copied()
    }

    /// Make the track at listing index `track_index` current. Returns false when out of range.
    pub fn select(&mut self, track_index: usize) -> bool {
        match self.order.iter().position(|&i| i == track_index) {
            Some(position) => {
                self.cursor = Some(position);
                true
            }
            None => false,
        }
    }

    /// Make the play-order position current.
    pub fn commit(&mut self, position: usize) {
        if position < self.order.len() {
            self.cursor = Some(position);
        }
    }

    /// Compute where to go from the current track.
    pub fn advance(&self, direction: Direction, mode: EndOfQueueMode, repeat_one: bool) -> Advance {
        if self.order.is_empty() {
            return Advance::Idle;
        }
        if repeat_one && self.cursor.is_some() {
            return Advance::Restart;
        }
        let last = self.order.len() - 1;
        let next = match (self.cursor, direction) {
            (None, Direction::Forward) => Some(0),
            (None, Direction::Backward) => Some(last),
            (Some(pos), Direction::Forward) if pos < last => Some(pos + 1),
            (Some(pos), Direction::Backward) if pos > 0 => Some(pos - 1),
            _ => None,
        };
        if let Some(position) = next {
            return Advance::Play(position);
        }
        match mode {
            EndOfQueueMode::Stop => Advance::Stop,
            EndOfQueueMode::Wrap => match direction {
                Direction::Forward => Advance::Play(0),
                Direction::Backward => Advance::Play(last),
            },
            EndOfQueueMode::Continue => Advance::Traverse(direction),
        }
    }

    /// Play-order position that a natural forward advance would start next, for preloading.
    pub fn peek_next(&self, mode: EndOfQueueMode) -> Option<usize> {
        match self.advance(Direction::Forward, mode, false) {
            Advance::Play(position) if Some(position) != self.cursor => Some(position),
            _ => None,
        }
    }
}
