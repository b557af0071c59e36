//! Name-based channel lookup.

use std::sync::Arc;

use dashmap::DashMap;

use super::MessageChannel;

/// Resolves a channel by name.
pub trait ChannelResolver: Send + Sync {
    /// Returns the channel registered under `name`, if any.
    fn resolve(&self, name: &str) -> Option<Arc<dyn MessageChannel>>;
}

/// Thread-safe registry of named channels.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<dyn MessageChannel>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `channel` under its own name, returning any channel it replaced.
    pub fn register(&self, channel: Arc<dyn MessageChannel>) -> Option<Arc<dyn MessageChannel>> {
        self.channels.insert(channel.name().to_string(), channel)
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.remove(name).map(|(_, channel)| channel)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Registered names, in no particular order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.channels.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl ChannelResolver for ChannelRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn MessageChannel>> {
        self.channels.get(name).map(|entry| Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{NullChannel, QueueChannel};

    #[test]
    fn register_and_resolve() {
        let registry = ChannelRegistry::new();
        assert!(registry.is_empty());

        registry.register(Arc::new(QueueChannel::new("errorChannel", 4)));
        registry.register(Arc::new(NullChannel::new("discard")));
        assert_eq!(registry.len(), 2);

        let resolved = registry.resolve("errorChannel").unwrap();
        assert_eq!(resolved.name(), "errorChannel");
        assert!(registry.resolve("missing").is_none());

        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["discard", "errorChannel"]);
    }

    #[test]
    fn register_replaces_same_name() {
        let registry = ChannelRegistry::new();
        assert!(registry.register(Arc::new(NullChannel::new("a"))).is_none());
        assert!(registry.register(Arc::new(NullChannel::new("a"))).is_some());
        assert_eq!(registry.len(), 1);

        assert!(registry.remove("a").is_some());
        assert!(registry.resolve("a").is_none());
    }
}
