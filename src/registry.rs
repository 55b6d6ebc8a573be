//! Lookup of live connections by player.
//!
//! The registry holds the thread-safe halves of each [`Connection`]: the
//! [`OutboundHandle`] for the send path and the [`ClassifierHandle`] for reading results.
//! The connection itself stays with the network-receive context that owns it.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::classifier::ClassifierHandle;
use crate::connection::{Connection, OutboundHandle};
use crate::error::{AimwatchError, AimwatchResult};
use crate::PlayerId;

/// The shareable parts of one registered connection.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Send side of the connection.
    pub outbound: OutboundHandle,
    /// Classifier results.
    pub classifier: ClassifierHandle,
}

/// Registered connections, keyed by player.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: RwLock<BTreeMap<PlayerId, RegistryEntry>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection on login.
    ///
    /// # Errors
    ///
    /// Returns [`AimwatchError::AlreadyRegistered`] if the player already has an entry.
    pub fn register(&self, connection: &Connection) -> AimwatchResult<()> {
        let player = connection.player();
        let mut entries = self.entries.write();
        if entries.contains_key(&player) {
            return Err(AimwatchError::AlreadyRegistered { player });
        }
        entries.insert(
            player,
            RegistryEntry {
                outbound: connection.outbound(),
                classifier: connection.classifier_handle(),
            },
        );
        tracing::debug!(player = %player, "connection registered");
        Ok(())
    }

    /// Removes a connection on disconnect.
    ///
    /// # Errors
    ///
    /// Returns [`AimwatchError::UnknownPlayer`] if the player has no entry.
    pub fn remove(&self, player: PlayerId) -> AimwatchResult<RegistryEntry> {
        let removed = self.entries.write().remove(&player);
        match removed {
            Some(entry) => {
                tracing::debug!(player = %player, "connection removed");
                Ok(entry)
            },
            None => Err(AimwatchError::UnknownPlayer { player }),
        }
    }

    /// The entry for `player`.
    #[must_use]
    pub fn get(&self, player: PlayerId) -> Option<RegistryEntry> {
        self.entries.read().get(&player).cloned()
    }

    /// The send side for `player`.
    #[must_use]
    pub fn outbound(&self, player: PlayerId) -> Option<OutboundHandle> {
        self.entries
            .read()
            .get(&player)
            .map(|entry| entry.outbound.clone())
    }

    /// Damage multiplier for `player`; `1.0` when the player is unknown.
    #[must_use]
    pub fn damage_multiplier(&self, player: PlayerId) -> f64 {
        self.entries
            .read()
            .get(&player)
            .map_or(1.0, |entry| entry.classifier.damage_multiplier())
    }

    /// Latest probability for `player`.
    #[must_use]
    pub fn last_probability(&self, player: PlayerId) -> Option<f64> {
        self.entries
            .read()
            .get(&player)
            .map(|entry| entry.classifier.last_probability())
    }

    /// Registered players in ascending order.
    #[must_use]
    pub fn players(&self) -> Vec<PlayerId> {
        self.entries.read().keys().copied().collect()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::classifier::ClassificationService;
    use crate::config::AimwatchConfig;
    use crate::events::CollectingSink;
    use crate::network::messages::ClientEra;
    use crate::scheduler::{MainQueue, TokioScheduler};
    use std::sync::Arc;

    fn connection(id: u64) -> Connection {
        let config = AimwatchConfig::default();
        let scheduler = Arc::new(TokioScheduler::try_current(Arc::new(MainQueue::new())).unwrap());
        let service = Arc::new(
            ClassificationService::new(
                scheduler,
                Arc::new(CollectingSink::new()),
                config.classifier(),
            )
            .unwrap(),
        );
        Connection::new(PlayerId::new(id), ClientEra::Modern, &config, service).unwrap()
    }

    #[tokio::test]
    async fn register_lookup_remove() {
        let registry = ConnectionRegistry::new();
        let second = connection(2);
        let first = connection(1);
        registry.register(&second).unwrap();
        registry.register(&first).unwrap();

        assert_eq!(registry.players(), vec![PlayerId::new(1), PlayerId::new(2)]);
        assert_eq!(registry.damage_multiplier(PlayerId::new(1)), 1.0);
        assert_eq!(registry.last_probability(PlayerId::new(2)), Some(0.0));
        assert!(registry.outbound(PlayerId::new(1)).is_some());

        registry.remove(PlayerId::new(1)).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(PlayerId::new(1)).is_none());
    }

    #[tokio::test]
    async fn duplicate_and_unknown_players_are_errors() {
        let registry = ConnectionRegistry::new();
        let conn = connection(5);
        registry.register(&conn).unwrap();
        assert_eq!(
            registry.register(&conn),
            Err(AimwatchError::AlreadyRegistered {
                player: PlayerId::new(5)
            })
        );
        assert!(matches!(
            registry.remove(PlayerId::new(9)),
            Err(AimwatchError::UnknownPlayer { .. })
        ));
        assert_eq!(registry.damage_multiplier(PlayerId::new(9)), 1.0);
    }

    #[tokio::test]
    async fn outbound_handles_share_the_connection_clock() {
        let registry = ConnectionRegistry::new();
        let conn = connection(3);
        registry.register(&conn).unwrap();

        let outbound = registry.outbound(PlayerId::new(3)).unwrap();
        let _ = outbound.send_marker();
        assert_eq!(conn.outbound().clock().last_sent(), 1);
    }
}
