use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    audio::decoder::MediaOpener,
    track::{Track, TrackDescriptor, TrackOptions},
};

/// A queued item. Descriptors are turned into live tracks only when the
/// scheduler needs them.
pub enum QueueEntry {
    Pending(TrackDescriptor),
    Ready(Arc<Track>),
}

impl QueueEntry {
    pub fn descriptor(&self) -> &TrackDescriptor {
        match self {
            Self::Pending(d) => d,
            Self::Ready(t) => t.descriptor(),
        }
    }

    pub fn track(&self) -> Option<&Arc<Track>> {
        match self {
            Self::Pending(_) => None,
            Self::Ready(t) => Some(t),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// `Pending -> Ready`. A no-op for entries that are already ready.
    pub fn resolve(&mut self, opener: &Arc<dyn MediaOpener>, options: TrackOptions) -> Arc<Track> {
        if let Self::Pending(descriptor) = self {
            let track = Arc::new(Track::new(descriptor.clone(), opener.clone(), options));
            *self = Self::Ready(track);
        }
        match self {
            Self::Ready(t) => t.clone(),
            Self::Pending(_) => unreachable!("entry resolved above"),
        }
    }

    /// Free decode resources held by a ready entry.
    pub fn release(&self) {
        if let Self::Ready(track) = self {
            track.cleanup();
        }
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending(d) => f.debug_tuple("Pending").field(&d.id).finish(),
            Self::Ready(t) => f.debug_tuple("Ready").field(&t.id()).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub title: String,
    pub locator: String,
    pub ready: bool,
}

/// Ordered entries of one connection. Index 0 is the current track and is
/// only ever removed by the scheduler.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    entries: VecDeque<QueueEntry>,
}

pub type SharedQueue = Arc<Mutex<PlaybackQueue>>;

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedQueue {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&QueueEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut QueueEntry> {
        self.entries.get_mut(index)
    }

    pub fn current(&self) -> Option<&Arc<Track>> {
        self.entries.front().and_then(QueueEntry::track)
    }

    /// Append and return the new entry's index.
    pub fn push(&mut self, descriptor: TrackDescriptor) -> usize {
        self.entries.push_back(QueueEntry::Pending(descriptor));
        self.entries.len() - 1
    }

    /// Insert behind the current track. `index` is clamped to
    /// `[1, len]` while something is playing.
    pub fn insert(&mut self, index: usize, descriptor: TrackDescriptor) -> usize {
        let lower = usize::from(!self.entries.is_empty());
        let index = index.clamp(lower, self.entries.len());
        self.entries.insert(index, QueueEntry::Pending(descriptor));
        index
    }

    /// Remove a non-current entry, releasing its decoder.
    pub fn remove(&mut self, index: usize) -> Option<TrackDescriptor> {
        if index == 0 {
            return None;
        }
        let entry = self.entries.remove(index)?;
        entry.release();
        Some(entry.descriptor().clone())
    }

    /// Drop every entry behind the current one.
    pub fn truncate_upcoming(&mut self) -> usize {
        let dropped = self.entries.len().saturating_sub(1);
        for entry in self.entries.drain(1.min(self.entries.len())..) {
            entry.release();
        }
        dropped
    }

    /// Pop the head if it still is `track`. Scheduler only.
    pub(crate) fn pop_current(&mut self, track: &Arc<Track>) -> bool {
        match self.entries.front() {
            Some(QueueEntry::Ready(head)) if Arc::ptr_eq(head, track) => {
                self.entries.pop_front();
                true
            }
            _ => false,
        }
    }

    /// Remove everything, releasing every decoder. Returns the old head.
    pub fn clear(&mut self) -> Option<QueueEntry> {
        let head = self.entries.pop_front();
        for entry in self.entries.drain(..) {
            entry.release();
        }
        if let Some(head) = &head {
            head.release();
        }
        head
    }

    pub fn snapshot(&self) -> Vec<QueueItem> {
        self.entries
            .iter()
            .map(|e| {
                let d = e.descriptor();
                QueueItem {
                    id: d.id.clone(),
                    title: d.title.clone(),
                    locator: d.locator.clone(),
                    ready: e.is_ready(),
                }
            })
            .collect()
    }
}
