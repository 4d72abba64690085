// this_file: src/connection.rs

//! Client connections and their subscription state.

use crate::changes::Change;
use crate::error::Result;
use crate::pattern::Pattern;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Server → client callbacks, implemented by the transport layer.
#[async_trait]
pub trait ClientProxy: Send + Sync {
    /// A peer committed `change`; `is_live` marks in-progress previews.
    async fn external_change(&self, change: &Change, is_live: bool) -> Result<()>;

    /// Data selected by `pattern` went stale; the client should re-fetch.
    async fn reload_data(&self, pattern: &Pattern) -> Result<()>;

    /// User-facing notification.
    async fn message_from_server(&self, title: &str, message: &str) -> Result<()>;
}

/// Handle for one connected client.
#[derive(Clone)]
pub struct Connection {
    /// Stable identity assigned by the transport.
    pub client_uuid: String,
    /// Asynchronous callback channel to the client.
    pub proxy: Arc<dyn ClientProxy>,
}

impl Connection {
    pub fn new(client_uuid: impl Into<String>, proxy: Arc<dyn ClientProxy>) -> Self {
        Connection {
            client_uuid: client_uuid.into(),
            proxy,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_uuid", &self.client_uuid)
            .finish_non_exhaustive()
    }
}

/// The two subscription tiers of one client.
///
/// The live tier receives previews and committed changes; the committed
/// tier receives committed changes only. Both start out empty.
#[derive(Clone, Debug, Default)]
pub struct Subscriptions {
    pub live: Pattern,
    pub committed: Pattern,
}

impl Subscriptions {
    /// The pattern of one tier.
    pub fn tier(&self, live: bool) -> &Pattern {
        if live {
            &self.live
        } else {
            &self.committed
        }
    }

    /// Mutable pattern of one tier.
    pub fn tier_mut(&mut self, live: bool) -> &mut Pattern {
        if live {
            &mut self.live
        } else {
            &mut self.committed
        }
    }

    /// Union of both tiers.
    pub fn combined(&self) -> Pattern {
        self.live.union(&self.committed)
    }
}

/// Live connections plus per-client subscription state.
///
/// Subscription state is keyed by client UUID and survives reconnects
/// within one handler lifetime.
#[derive(Default)]
pub(crate) struct SessionTable {
    connections: Vec<Connection>,
    subscriptions: HashMap<String, Subscriptions>,
}

impl SessionTable {
    pub(crate) fn add(&mut self, connection: Connection) {
        self.connections.push(connection);
    }

    /// Remove one connection; returns true when the table became empty.
    pub(crate) fn remove(&mut self, client_uuid: &str) -> bool {
        if let Some(position) = self
            .connections
            .iter()
            .position(|connection| connection.client_uuid == client_uuid)
        {
            self.connections.remove(position);
            return self.connections.is_empty();
        }
        false
    }

    pub(crate) fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub(crate) fn subscriptions(&self, client_uuid: &str) -> Option<&Subscriptions> {
        self.subscriptions.get(client_uuid)
    }

    pub(crate) fn subscriptions_mut(&mut self, client_uuid: &str) -> &mut Subscriptions {
        self.subscriptions.entry(client_uuid.to_string()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProxy;

    #[async_trait]
    impl ClientProxy for NullProxy {
        async fn external_change(&self, _change: &Change, _is_live: bool) -> Result<()> {
            Ok(())
        }
        async fn reload_data(&self, _pattern: &Pattern) -> Result<()> {
            Ok(())
        }
        async fn message_from_server(&self, _title: &str, _message: &str) -> Result<()> {
            Ok(())
        }
    }

    fn connection(uuid: &str) -> Connection {
        Connection::new(uuid, Arc::new(NullProxy))
    }

    #[test]
    fn remove_reports_emptying_once() {
        let mut table = SessionTable::default();
        table.add(connection("a"));
        table.add(connection("b"));
        assert!(!table.remove("a"));
        assert!(table.remove("b"));
        assert!(!table.remove("b"));
    }

    #[test]
    fn subscriptions_default_to_empty_tiers() {
        let mut table = SessionTable::default();
        let subs = table.subscriptions_mut("a");
        assert!(subs.live.is_empty());
        assert!(subs.committed.is_empty());

        let pattern = Pattern::from_path(&["glyphs".into(), "A".into()]);
        *subs.tier_mut(true) = subs.tier(true).union(&pattern);
        assert!(!table.subscriptions("a").unwrap().live.is_empty());
        assert!(table.subscriptions("a").unwrap().committed.is_empty());
        assert!(!table.subscriptions("a").unwrap().combined().is_empty());
    }
}
