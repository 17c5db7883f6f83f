//! Instrumented-side handle to one source.

use chrono::{DateTime, Utc};
use como_types::{Source, SourceValue};
use tracing::debug;

use crate::registry::{SourceRegistry, SourceToken};

/// A source owned by instrumented code.
///
/// While live, every successful value change is announced through the
/// registry immediately. Dropping a live source removes it and announces the
/// removal.
#[derive(Debug)]
pub struct LiveSource {
    source: Source,
    registry: Option<SourceRegistry>,
    token: Option<SourceToken>,
}

impl LiveSource {
    /// Wrap a source. It stays unregistered until [`LiveSource::init_source`].
    #[must_use]
    pub fn new(source: Source, registry: Option<SourceRegistry>) -> Self {
        Self {
            source,
            registry,
            token: None,
        }
    }

    /// Register the source and announce it.
    ///
    /// Returns `false` when there is no registry to register with. Calling
    /// this on a live source announces it again.
    pub fn init_source(&mut self) -> bool {
        let Some(registry) = &self.registry else {
            debug!("Source '{}' has no registry, not initializing", self.name());
            return false;
        };
        self.token = Some(registry.register(self.source.clone()));
        true
    }

    /// Remove the source from its registry and announce the removal.
    ///
    /// Returns `false` if the source was not live.
    pub fn deinit_source(&mut self) -> bool {
        match (&self.registry, self.token.take()) {
            (Some(registry), Some(token)) => registry.deregister_token(&token).is_some(),
            _ => false,
        }
    }

    /// Move the source to another registry, or detach it with `None`.
    ///
    /// The previous registry drops the source without announcing it. A live
    /// source is registered with the new registry right away.
    pub fn set_registry(&mut self, registry: Option<SourceRegistry>) {
        let was_live = self.token.is_some();
        if let (Some(previous), Some(token)) = (&self.registry, self.token.take()) {
            previous.forget(&token);
        }
        self.registry = registry;
        if was_live {
            self.init_source();
        }
    }

    #[must_use]
    pub fn registry(&self) -> Option<&SourceRegistry> {
        self.registry.as_ref()
    }

    /// Whether this handle's registration is still current.
    ///
    /// A source whose name was re-registered by someone else stops being live.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.token.is_some()
    }

    pub fn set_value(&mut self, value: impl Into<SourceValue>) -> bool {
        if !self.source.set_value(value) {
            return false;
        }
        self.publish();
        true
    }

    pub fn set_string(&mut self, value: impl Into<String>) -> bool {
        self.set_value(SourceValue::String(value.into()))
    }

    pub fn set_int(&mut self, value: i64) -> bool {
        self.set_value(SourceValue::Int(value))
    }

    pub fn set_double(&mut self, value: f64) -> bool {
        self.set_value(SourceValue::Double(value))
    }

    fn publish(&mut self) {
        let (Some(registry), Some(token)) = (&self.registry, &self.token) else {
            return;
        };
        if registry.publish(token, &self.source) {
            return;
        }
        debug!(
            "Source '{}' was replaced in its registry, no longer live",
            self.source.name()
        );
        self.token = None;
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.source.name()
    }

    #[must_use]
    pub fn value(&self) -> &SourceValue {
        self.source.value()
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.source.timestamp()
    }

    /// Current state of the source as it would go on the wire.
    #[must_use]
    pub fn snapshot(&self) -> Source {
        self.source.clone()
    }
}

impl Drop for LiveSource {
    fn drop(&mut self) {
        if self.is_live() {
            self.deinit_source();
        }
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)] // Exact float comparisons are intentional in tests
mod tests {
    use super::*;
    use crate::session::SessionId;
    use como_protocol::{Frame, Message, MessageKind};
    use como_types::SourceType;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn observe(registry: &SourceRegistry) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(64);
        registry.attach(SessionId::new(), tx, CancellationToken::new());
        rx
    }

    fn kinds(rx: &mut mpsc::Receiver<Frame>) -> Vec<MessageKind> {
        let mut kinds = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            kinds.push(frame.kind);
        }
        kinds
    }

    fn temperature(registry: &SourceRegistry) -> LiveSource {
        registry
            .create_source(SourceType::Double, "temperature", "Thermometer", 21.5, "")
            .unwrap()
    }

    #[test]
    fn test_create_source_is_live() {
        let registry = SourceRegistry::new();
        let mut rx = observe(&registry);
        let source = temperature(&registry);

        assert!(source.is_live());
        assert_eq!(registry.get("temperature").unwrap(), source.snapshot());
        assert_eq!(kinds(&mut rx), vec![MessageKind::Source]);
    }

    #[test]
    fn test_set_value_publishes() {
        let registry = SourceRegistry::new();
        let mut source = temperature(&registry);
        let mut rx = observe(&registry);
        let before = source.timestamp();

        assert!(source.set_double(23.0));
        assert!(!source.set_int(3));
        assert!(!source.set_string("hot"));

        let frame = rx.try_recv().unwrap();
        let Message::Source(announced) = Message::from_frame(frame).unwrap() else {
            panic!("Expected a source message");
        };
        assert_eq!(announced.value().as_double(), Some(23.0));
        assert!(announced.timestamp() >= before);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.get("temperature").unwrap().value().as_double(), Some(23.0));
    }

    #[test]
    fn test_unregistered_source_is_silent() {
        let mut source = LiveSource::new(
            Source::new(SourceType::Int, "count", "Counter", 0, "").unwrap(),
            None,
        );
        assert!(!source.init_source());
        assert!(source.set_int(5));
        assert!(!source.is_live());
        assert_eq!(source.value().as_int(), Some(5));
    }

    #[test]
    fn test_deinit_announces_removal() {
        let registry = SourceRegistry::new();
        let mut source = temperature(&registry);
        let mut rx = observe(&registry);

        assert!(source.deinit_source());
        assert!(!source.deinit_source());
        assert!(!source.is_live());
        assert!(registry.is_empty());
        assert_eq!(kinds(&mut rx), vec![MessageKind::DeinitSource]);

        // Values still change locally, nothing is sent.
        assert!(source.set_double(1.0));
        assert!(kinds(&mut rx).is_empty());
    }

    #[test]
    fn test_drop_deinitializes() {
        let registry = SourceRegistry::new();
        let source = temperature(&registry);
        let mut rx = observe(&registry);

        drop(source);
        assert!(registry.is_empty());
        assert_eq!(kinds(&mut rx), vec![MessageKind::DeinitSource]);
    }

    #[test]
    fn test_set_registry_moves_live_source() {
        let old = SourceRegistry::new();
        let new = SourceRegistry::new();
        let mut source = temperature(&old);
        let mut old_rx = observe(&old);
        let mut new_rx = observe(&new);

        source.set_registry(Some(new.clone()));

        assert!(source.is_live());
        assert!(old.is_empty());
        assert!(new.contains("temperature"));
        assert!(kinds(&mut old_rx).is_empty(), "Old registry removes silently");
        assert_eq!(kinds(&mut new_rx), vec![MessageKind::Source]);
    }

    #[test]
    fn test_set_registry_keeps_unregistered_source_unregistered() {
        let old = SourceRegistry::new();
        let new = SourceRegistry::new();
        let mut source = LiveSource::new(
            Source::new(SourceType::Int, "count", "Counter", 0, "").unwrap(),
            Some(old),
        );

        source.set_registry(Some(new.clone()));
        assert!(!source.is_live());
        assert!(new.is_empty());
    }

    #[test]
    fn test_replaced_source_stops_being_live() {
        let registry = SourceRegistry::new();
        let mut first = temperature(&registry);
        let second = temperature(&registry);

        assert!(first.set_double(30.0));
        assert!(!first.is_live());
        assert_eq!(
            registry.get("temperature").unwrap().value().as_double(),
            Some(21.5)
        );

        // Dropping the stale handle must not remove its successor.
        drop(first);
        assert!(registry.contains("temperature"));
        drop(second);
        assert!(registry.is_empty());
    }
}
