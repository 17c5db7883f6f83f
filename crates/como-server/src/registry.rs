//! Registry of live sources and the sessions observing them.
//!
//! Every mutation encodes its frame once and hands it to each attached
//! session while the write lock is held, so all observers see changes in the
//! order they were made. Delivery never blocks: a session whose outbound
//! buffer is full or closed is detached on the spot, and its detach token is
//! cancelled so the session releases its connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use como_protocol::{Frame, Message};
use como_types::{Source, SourceError, SourceType, SourceValue};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::session::SessionId;
use crate::source::LiveSource;

/// Outbound frame queue of one attached session
pub type SessionSender = mpsc::Sender<Frame>;

/// Proof of one particular registration of a name.
///
/// Re-registering a name bumps its generation, so a stale token can no longer
/// touch the source that replaced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceToken {
    name: String,
    generation: u64,
}

impl SourceToken {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
struct Entry {
    source: Source,
    generation: u64,
}

#[derive(Debug)]
struct Subscriber {
    sender: SessionSender,
    detached: CancellationToken,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.detached.cancel();
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    sources: BTreeMap<String, Entry>,
    sessions: HashMap<SessionId, Subscriber>,
    next_generation: u64,
}

impl RegistryState {
    fn owns(&self, token: &SourceToken) -> bool {
        self.sources
            .get(&token.name)
            .is_some_and(|entry| entry.generation == token.generation)
    }

    fn broadcast(&mut self, message: &Message) {
        if self.sessions.is_empty() {
            return;
        }

        let frame = message.to_frame();
        trace!(
            "Broadcasting {} to {} sessions",
            frame.kind,
            self.sessions.len()
        );
        // Dropping a subscriber cancels its detach token.
        self.sessions.retain(|session_id, subscriber| {
            match subscriber.sender.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!("[{}] Outbound buffer full, closing session", session_id);
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("[{}] Session gone, detaching", session_id);
                    false
                }
            }
        });
    }
}

/// Shared handle to a set of live sources.
///
/// Clones refer to the same registry.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl SourceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave the maps half-updated, so
    // poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a source and make it live in this registry.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::TypeMismatch` if `initial` does not match
    /// `source_type`.
    pub fn create_source(
        &self,
        source_type: SourceType,
        name: impl Into<String>,
        type_name: impl Into<String>,
        initial: impl Into<SourceValue>,
        description: impl Into<String>,
    ) -> Result<LiveSource, SourceError> {
        let source = Source::new(source_type, name, type_name, initial, description)?;
        let mut live = LiveSource::new(source, Some(self.clone()));
        live.init_source();
        Ok(live)
    }

    /// Add a source, replacing any source with the same name, and announce it.
    ///
    /// Replacement sends no removal for the previous source.
    pub fn register(&self, source: Source) -> SourceToken {
        let mut state = self.write();
        let generation = state.next_generation;
        state.next_generation += 1;

        let name = source.name().to_string();
        debug!("Registering source '{}' (generation {})", name, generation);
        let message = Message::Source(source.clone());
        if state
            .sources
            .insert(name.clone(), Entry { source, generation })
            .is_some()
        {
            debug!("Source '{}' replaced an earlier registration", name);
        }
        state.broadcast(&message);

        SourceToken { name, generation }
    }

    /// Remove a source by name and announce the removal.
    pub fn deregister(&self, name: &str) -> Option<Source> {
        let mut state = self.write();
        let entry = state.sources.remove(name)?;
        debug!("Deregistering source '{}'", name);
        state.broadcast(&Message::DeinitSource(entry.source.clone()));
        Some(entry.source)
    }

    /// Remove the source only if `token` is still its current registration.
    pub fn deregister_token(&self, token: &SourceToken) -> Option<Source> {
        let mut state = self.write();
        if !state.owns(token) {
            return None;
        }
        let entry = state.sources.remove(&token.name)?;
        debug!("Deregistering source '{}'", token.name);
        state.broadcast(&Message::DeinitSource(entry.source.clone()));
        Some(entry.source)
    }

    /// Remove the source without telling anyone.
    pub fn forget(&self, token: &SourceToken) -> bool {
        let mut state = self.write();
        if !state.owns(token) {
            return false;
        }
        debug!("Forgetting source '{}'", token.name);
        state.sources.remove(&token.name).is_some()
    }

    /// Change the value of a registered source and announce it.
    ///
    /// Returns `false` for unknown names and for values of the wrong type.
    /// The stored timestamp never moves backwards.
    pub fn update_value(
        &self,
        name: &str,
        value: impl Into<SourceValue>,
        timestamp: DateTime<Utc>,
    ) -> bool {
        let mut state = self.write();
        let Some(entry) = state.sources.get_mut(name) else {
            return false;
        };

        let previous = entry.source.timestamp();
        if !entry.source.set_value(value) {
            return false;
        }
        entry.source.set_timestamp(timestamp.max(previous));

        let message = Message::Source(entry.source.clone());
        state.broadcast(&message);
        true
    }

    /// Store and announce a new snapshot for the registration behind `token`.
    pub(crate) fn publish(&self, token: &SourceToken, source: &Source) -> bool {
        let mut state = self.write();
        match state.sources.get_mut(&token.name) {
            Some(entry) if entry.generation == token.generation => {
                entry.source = source.clone();
            }
            _ => return false,
        }
        state.broadcast(&Message::Source(source.clone()));
        true
    }

    /// Every live source exactly once, ordered by name.
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<Source> {
        self.read()
            .sources
            .values()
            .map(|entry| entry.source.clone())
            .collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Source> {
        self.read()
            .sources
            .get(name)
            .map(|entry| entry.source.clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read().sources.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().sources.is_empty()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.read().sessions.len()
    }

    /// Start delivering registry changes to a session.
    ///
    /// `detached` is cancelled once the registry stops delivering to the
    /// session, whether through `detach` or because its buffer overflowed.
    pub fn attach(
        &self,
        session_id: SessionId,
        sender: SessionSender,
        detached: CancellationToken,
    ) {
        debug!("[{}] Attached to registry", session_id);
        self.write()
            .sessions
            .insert(session_id, Subscriber { sender, detached });
    }

    /// Stop delivering to a session and cancel its detach token.
    ///
    /// Returns `false` if it was not attached.
    pub fn detach(&self, session_id: &SessionId) -> bool {
        let removed = self.write().sessions.remove(session_id).is_some();
        if removed {
            debug!("[{}] Detached from registry", session_id);
        }
        removed
    }

    /// Queue a `Source` frame per live source for one session.
    ///
    /// The batch is queued under the read lock, so no update can be
    /// interleaved with it. Returns the number of frames queued; a session
    /// that cannot take the whole batch is detached.
    pub fn send_snapshot_to(&self, session_id: &SessionId) -> usize {
        let (sent, complete) = {
            let state = self.read();
            let Some(subscriber) = state.sessions.get(session_id) else {
                return 0;
            };

            let mut sent = 0;
            for entry in state.sources.values() {
                if subscriber
                    .sender
                    .try_send(Message::Source(entry.source.clone()).to_frame())
                    .is_err()
                {
                    break;
                }
                sent += 1;
            }
            (sent, sent == state.sources.len())
        };

        if !complete {
            warn!(
                "[{}] Could not queue source list after {} frames, closing session",
                session_id, sent
            );
            self.detach(session_id);
        }
        sent
    }
}
