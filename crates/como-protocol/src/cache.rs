//! Observer-side view of the sources a server currently announces.

use std::collections::BTreeMap;

use como_types::Source;

use crate::client::ClientEvent;

/// What applying an event did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheChange {
    Inserted,
    Updated,
    /// Same snapshot was already cached, e.g. a list answer for a known source.
    Unchanged,
    Removed,
    /// The session ended and every cached source was dropped.
    Cleared,
    Ignored,
}

/// Latest snapshot per source name.
///
/// Only the newest value of a source is kept; there is no history.
#[derive(Debug, Default, Clone)]
pub struct SourceCache {
    sources: BTreeMap<String, Source>,
}

impl SourceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one client event into the cache.
    pub fn apply(&mut self, event: &ClientEvent) -> CacheChange {
        match event {
            ClientEvent::SourceUpdated(source) => {
                match self.sources.insert(source.name().to_string(), source.clone()) {
                    None => CacheChange::Inserted,
                    Some(previous) if previous == *source => CacheChange::Unchanged,
                    Some(_) => CacheChange::Updated,
                }
            }
            ClientEvent::SourceRemoved(source) => match self.sources.remove(source.name()) {
                Some(_) => CacheChange::Removed,
                None => CacheChange::Ignored,
            },
            ClientEvent::Disconnected { .. } => {
                self.sources.clear();
                CacheChange::Cleared
            }
            ClientEvent::ListRequested | ClientEvent::MessageDropped(_) => CacheChange::Ignored,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Source> {
        self.sources.get(name)
    }

    /// Cached sources ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn clear(&mut self) {
        self.sources.clear();
    }
}
