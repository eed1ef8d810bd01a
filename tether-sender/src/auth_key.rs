//! Shared handle to the session's authorization key.

use std::sync::Arc;

use tokio::sync::watch;

use tether_crypto::AuthKey;

/// Clonable handle to an [`AuthKey`] that may be set after construction.
///
/// Requests queued before the bootstrap handshake finishes park in
/// [`wait_ready`](SharedAuthKey::wait_ready) instead of failing.
#[derive(Clone)]
pub struct SharedAuthKey {
    tx: Arc<watch::Sender<Option<AuthKey>>>,
}

impl SharedAuthKey {
    pub fn new(initial: Option<AuthKey>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Install (or replace) the key, waking anyone blocked in `wait_ready`.
    ///
    /// `send_replace` stores the value even with no receiver subscribed;
    /// plain `send` would discard it.
    pub fn set(&self, key: AuthKey) {
        self.tx.send_replace(Some(key));
    }

    pub fn get(&self) -> Option<AuthKey> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The cached 8-byte key identifier, once a key exists.
    pub fn key_id(&self) -> Option<[u8; 8]> {
        self.tx.borrow().as_ref().map(|k| k.key_id())
    }

    /// Suspend until a key has been installed, then return a copy of it.
    pub async fn wait_ready(&self) -> AuthKey {
        let mut rx = self.tx.subscribe();
        let guard = rx
            .wait_for(Option::is_some)
            .await
            .expect("auth key sender owned by self");
        guard.clone().unwrap()
    }
}

impl Default for SharedAuthKey {
    fn default() -> Self {
        Self::new(None)
    }
}
