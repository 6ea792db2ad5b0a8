//! Cancellation key registry.
//!
//! Maps the (processId, secretKey) pair a backend issued in BackendKeyData
//! to the backend that issued it, so a later CancelRequest can be relayed
//! to the right server. A single task owns the map; registration hands back
//! a guard whose drop deregisters the key, which ties each entry to the
//! lifetime of the client session that created it.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::oracle::BackendId;
use crate::pqproto::BackendKey;

enum RegistryRequest {
    Register {
        key: BackendKey,
        backend: BackendId,
    },
    Deregister {
        key: BackendKey,
    },
    Lookup {
        key: BackendKey,
        reply: oneshot::Sender<Option<BackendId>>,
    },
}

#[derive(Clone)]
pub struct RegistryHandle {
    // Unbounded so the guard's drop path never blocks.
    tx: mpsc::UnboundedSender<RegistryRequest>,
}

impl RegistryHandle {
    /// Register a key, overwriting any previous owner. The entry lives
    /// until the returned guard is dropped.
    pub fn register(&self, key: BackendKey, backend: BackendId) -> RegisteredKey {
        let _ = self.tx.send(RegistryRequest::Register { key, backend });
        RegisteredKey {
            key,
            tx: self.tx.clone(),
        }
    }

    pub async fn lookup(&self, key: BackendKey) -> Option<BackendId> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(RegistryRequest::Lookup { key, reply }).ok()?;
        rx.await.ok()?
    }
}

/// Keeps a registry entry alive; dropping it removes the entry.
pub struct RegisteredKey {
    key: BackendKey,
    tx: mpsc::UnboundedSender<RegistryRequest>,
}

impl Drop for RegisteredKey {
    fn drop(&mut self) {
        let _ = self.tx.send(RegistryRequest::Deregister { key: self.key });
    }
}

/// Spawn the registry task and return a handle to it.
pub fn spawn() -> RegistryHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut store: HashMap<BackendKey, BackendId> = HashMap::new();
        while let Some(request) = rx.recv().await {
            match request {
                RegistryRequest::Register { key, backend } => {
                    debug!(%key, %backend, "cancel key registered");
                    store.insert(key, backend);
                }
                RegistryRequest::Deregister { key } => {
                    debug!(%key, "cancel key deregistered");
                    store.remove(&key);
                }
                RegistryRequest::Lookup { key, reply } => {
                    let _ = reply.send(store.get(&key).cloned());
                }
            }
        }
    });
    RegistryHandle { tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registered_key_resolves_to_its_backend() {
        let registry = spawn();
        let key = BackendKey::new(4242, 0x11223344);
        let _guard = registry.register(key, "b1".to_owned());

        assert_eq!(registry.lookup(key).await.as_deref(), Some("b1"));
        assert_eq!(registry.lookup(BackendKey::new(1, 2)).await, None);
    }

    #[tokio::test]
    async fn register_overwrites_previous_owner() {
        let registry = spawn();
        let key = BackendKey::new(7, 7);
        let _first = registry.register(key, "b1".to_owned());
        let _second = registry.register(key, "b2".to_owned());

        assert_eq!(registry.lookup(key).await.as_deref(), Some("b2"));
    }

    #[tokio::test]
    async fn dropping_the_guard_deregisters() {
        let registry = spawn();
        let key = BackendKey::new(4242, 0x11223344);

        let guard = registry.register(key, "b1".to_owned());
        assert_eq!(registry.lookup(key).await.as_deref(), Some("b1"));

        drop(guard);
        assert_eq!(registry.lookup(key).await, None);
    }
}
