//! Queue and history sequencing.
//!
//! While a track is current and present in the queue it sits at index 0, so
//! "the next track" is always the entry after it. After stepping back the
//! current track is not queued and "next" is the queue head. History is most recent
//! first and never holds the current track.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::protocol::{QueueSnapshot, RepeatMode};
use crate::track::Track;

/// What to do after the current track ended.
#[derive(Debug, Clone, PartialEq)]
pub enum EndAction {
    /// Start this track from the beginning.
    Play(Track),
    /// Nothing left to play.
    Stop,
}

fn dedupe(tracks: Vec<Track>) -> Vec<Track> {
    let mut seen = std::collections::HashSet::new();
    tracks
        .into_iter()
        .filter(|track| seen.insert(track.id.clone()))
        .collect()
}

pub struct PlayQueue {
    current: Option<Track>,
    queue: Vec<Track>,
    history: Vec<Track>,
    repeat_mode: RepeatMode,
    shuffle: bool,
    // Use StdRng instead of ThreadRng so the queue can move between threads
    rng: StdRng,
}

impl Default for PlayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayQueue {
    pub fn new() -> Self {
        let mut seed = [0u8; 32];
        if let Err(err) = getrandom::fill(&mut seed) {
            log::warn!("PlayQueue: no OS randomness ({}), shuffle is predictable", err);
        }
        Self {
            current: None,
            queue: Vec::new(),
            history: Vec::new(),
            repeat_mode: RepeatMode::Off,
            shuffle: false,
            rng: StdRng::from_seed(seed),
        }
    }

    /// Rebuilds persisted state, repairing any broken invariants.
    pub fn restore(
        current: Option<Track>,
        queue: Vec<Track>,
        history: Vec<Track>,
        repeat_mode: RepeatMode,
        shuffle: bool,
    ) -> Self {
        let mut restored = Self::new();
        restored.queue = dedupe(queue);
        restored.history = dedupe(history);
        restored.repeat_mode = repeat_mode;
        restored.shuffle = shuffle;
        if let Some(current) = current {
            restored.history.retain(|track| track.id != current.id);
            if let Some(index) = restored.index_of(&current.id) {
                let entry = restored.queue.remove(index);
                restored.queue.insert(0, entry);
            }
            restored.current = Some(current);
        }
        restored
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn queue(&self) -> &[Track] {
        &self.queue
    }

    pub fn history(&self) -> &[Track] {
        &self.history
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            current: self.current.clone(),
            queue: self.queue.clone(),
            history: self.history.clone(),
            repeat_mode: self.repeat_mode,
            shuffle: self.shuffle,
        }
    }

    fn index_of(&self, track_id: &str) -> Option<usize> {
        self.queue.iter().position(|track| track.id == track_id)
    }

    fn current_position(&self) -> Option<usize> {
        self.current
            .as_ref()
            .and_then(|current| self.index_of(&current.id))
    }

    /// Index of the first entry after the current track.
    fn upcoming_start(&self) -> usize {
        self.current_position().map(|position| position + 1).unwrap_or(0)
    }

    fn push_history(&mut self, track: Track) {
        self.queue.retain(|entry| entry.id != track.id);
        self.history.retain(|entry| entry.id != track.id);
        self.history.insert(0, track);
    }

    fn make_current(&mut self, track: Track) {
        self.history.retain(|entry| entry.id != track.id);
        self.current = Some(track);
    }

    fn shuffle_upcoming(&mut self) {
        let start = self.upcoming_start();
        if start < self.queue.len() {
            self.queue[start..].shuffle(&mut self.rng);
        }
    }

    /// Makes `track` current. A context replaces the queue, rotated so the
    /// track comes first; without one the track is pulled to the head.
    pub fn play_track(&mut self, track: Track, context: Option<Vec<Track>>) -> Track {
        let previous = self.current.take();
        match context {
            Some(context) => {
                let context = dedupe(context);
                self.queue = match context.iter().position(|entry| entry.id == track.id) {
                    Some(index) => {
                        let mut rotated = context[index..].to_vec();
                        rotated.extend_from_slice(&context[..index]);
                        rotated
                    }
                    None => std::iter::once(track.clone()).chain(context).collect(),
                };
            }
            None => {
                self.queue.retain(|entry| entry.id != track.id);
                self.queue.insert(0, track.clone());
            }
        }
        if let Some(previous) = previous.filter(|previous| previous.id != track.id) {
            self.push_history(previous);
        }
        self.make_current(track.clone());
        if self.shuffle {
            self.shuffle_upcoming();
        }
        track
    }

    /// Advances to the entry after the current one. `None` when nothing follows.
    pub fn skip(&mut self) -> Option<Track> {
        let next = self.queue.get(self.upcoming_start())?.clone();
        if let Some(previous) = self.current.take() {
            self.push_history(previous);
        }
        self.make_current(next.clone());
        Some(next)
    }

    /// Steps back to the most recent history entry. The replaced track goes
    /// back to the queue head; the popped one becomes current without being
    /// queued. `None` when history is empty.
    pub fn previous(&mut self) -> Option<Track> {
        if self.history.is_empty() {
            return None;
        }
        let popped = self.history.remove(0);
        if let Some(current) = self.current.take() {
            self.queue.retain(|entry| entry.id != current.id);
            self.queue.insert(0, current);
        }
        self.queue.retain(|entry| entry.id != popped.id);
        self.make_current(popped.clone());
        Some(popped)
    }

    pub fn add_to_queue(&mut self, tracks: Vec<Track>) -> usize {
        let before = self.queue.len();
        for track in dedupe(tracks) {
            if self.index_of(&track.id).is_none() {
                self.queue.push(track);
            }
        }
        if self.shuffle {
            self.shuffle_upcoming();
        }
        self.queue.len() - before
    }

    /// Removes the entry at `index`. Out of range is a no-op.
    pub fn remove_from_queue(&mut self, index: usize) -> Option<Track> {
        (index < self.queue.len()).then(|| self.queue.remove(index))
    }

    /// Plays a track picked from the queue or history view.
    pub fn on_queue_item_click(&mut self, track: Track, index: usize) -> Track {
        if self.queue.get(index).is_some_and(|entry| entry.id == track.id) {
            self.queue.remove(index);
        }
        self.queue.retain(|entry| entry.id != track.id);
        self.history.retain(|entry| entry.id != track.id);
        self.play_track(track, None)
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    pub fn set_repeat_mode(&mut self, repeat_mode: RepeatMode) {
        self.repeat_mode = repeat_mode;
    }

    /// Enabling shuffles the entries after the current track.
    pub fn set_shuffle(&mut self, shuffle: bool) {
        self.shuffle = shuffle;
        if shuffle {
            self.shuffle_upcoming();
        }
    }

    /// Decides what follows the current track. Repeat-all wraps to the
    /// oldest history entry; with repeat off the recommendations extend the queue.
    pub fn on_track_ended(&mut self, recommended: &[Track]) -> EndAction {
        if self.repeat_mode == RepeatMode::One {
            if let Some(current) = self.current.clone() {
                return EndAction::Play(current);
            }
        }
        if let Some(next) = self.skip() {
            return EndAction::Play(next);
        }

        match self.repeat_mode {
            RepeatMode::All => {
                let mut cycle: Vec<Track> = self.history.drain(..).rev().collect();
                cycle.extend(self.current.take());
                cycle.append(&mut self.queue);
                self.queue = dedupe(cycle);
                if self.shuffle {
                    self.queue.shuffle(&mut self.rng);
                }
                match self.queue.first().cloned() {
                    Some(first) => {
                        self.make_current(first.clone());
                        EndAction::Play(first)
                    }
                    None => EndAction::Stop,
                }
            }
            _ => {
                let current_id = self.current.as_ref().map(|track| track.id.clone());
                let fresh: Vec<Track> = recommended
                    .iter()
                    .filter(|track| Some(&track.id) != current_id.as_ref())
                    .cloned()
                    .collect();
                if self.add_to_queue(fresh) == 0 {
                    return EndAction::Stop;
                }
                self.skip().map(EndAction::Play).unwrap_or(EndAction::Stop)
            }
        }
    }
}
