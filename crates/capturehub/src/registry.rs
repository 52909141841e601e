//! Live connections, keyed by producer id.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use captureproto::ProducerId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancellation handles of every live producer connection.
///
/// Cancelling a handle unblocks that connection's read, which then takes the
/// normal disconnect path.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ProducerId, CancellationToken>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and hand back its cancellation token.
    pub fn register(&self, producer_id: ProducerId) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(producer_id, token.clone());
        token
    }

    pub fn deregister(&self, producer_id: ProducerId) {
        self.lock().remove(&producer_id);
    }

    pub fn cancel_all(&self) {
        let connections = self.lock();
        debug!("cancelling {} producer connections", connections.len());
        for token in connections.values() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ProducerId, CancellationToken>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_all_reaches_every_connection() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(ProducerId(1));
        let b = registry.register(ProducerId(2));
        assert_eq!(registry.len(), 2);

        registry.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn test_deregister() {
        let registry = ConnectionRegistry::new();
        let token = registry.register(ProducerId(1));
        registry.deregister(ProducerId(1));
        assert!(registry.is_empty());

        registry.cancel_all();
        assert!(!token.is_cancelled());
    }
}
