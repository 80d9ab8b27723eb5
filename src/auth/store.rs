// In-memory access credential

use parking_lot::RwLock;

#[derive(Debug, Default)]
struct Slot {
    token: Option<String>,
    /// Bumped on every write so stale writers can be detected
    epoch: u64,
}

/// Holds the current access credential in process memory only
///
/// Created once per [`SessionManager`](super::SessionManager) and shared by
/// reference with the dispatcher and the renewal coordinator. Writes happen
/// only on login success, renewal success, logout and definitive auth failure.
#[derive(Debug, Default)]
pub struct CredentialStore {
    slot: RwLock<Slot>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current credential, if any
    pub fn get(&self) -> Option<String> {
        self.slot.read().token.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.read().token.is_none()
    }

    /// Replace the credential. An empty value clears the store.
    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        let mut slot = self.slot.write();
        slot.epoch += 1;
        slot.token = if token.is_empty() { None } else { Some(token) };
    }

    pub fn clear(&self) {
        let mut slot = self.slot.write();
        slot.epoch += 1;
        slot.token = None;
    }

    /// Write counter observed before starting a long operation
    pub fn epoch(&self) -> u64 {
        self.slot.read().epoch
    }

    /// Store `token` only if nothing was written since `epoch` was observed
    ///
    /// Returns false when a login or logout won the race; the newer value is kept.
    pub fn set_if_epoch(&self, epoch: u64, token: impl Into<String>) -> bool {
        let mut slot = self.slot.write();
        if slot.epoch != epoch {
            return false;
        }
        let token = token.into();
        slot.epoch += 1;
        slot.token = if token.is_empty() { None } else { Some(token) };
        true
    }

    /// Clear only if nothing was written since `epoch` was observed
    pub fn clear_if_epoch(&self, epoch: u64) -> bool {
        let mut slot = self.slot.write();
        if slot.epoch != epoch {
            return false;
        }
        slot.epoch += 1;
        slot.token = None;
        true
    }

    /// Clear only if `token` is still the stored credential
    ///
    /// Returns false when a newer login or renewal already replaced it.
    pub fn clear_if_current(&self, token: &str) -> bool {
        let mut slot = self.slot.write();
        if slot.token.as_deref() != Some(token) {
            return false;
        }
        slot.epoch += 1;
        slot.token = None;
        true
    }

    /// Short prefix for logs; the full credential is never logged
    pub fn fingerprint(&self) -> Option<String> {
        self.slot
            .read()
            .token
            .as_ref()
            .map(|t| token_prefix(t).to_string())
    }
}

/// First few characters of a credential, for log lines
pub fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_clear() {
        let store = CredentialStore::new();
        assert!(store.get().is_none());

        store.set("T1");
        assert_eq!(store.get().as_deref(), Some("T1"));

        store.set("T2");
        assert_eq!(store.get().as_deref(), Some("T2"));

        store.clear();
        assert!(store.is_empty());

        // Clearing twice is harmless
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_empty_value_is_never_stored() {
        let store = CredentialStore::new();
        store.set("T1");
        store.set("");
        assert!(store.get().is_none());
    }

    #[test]
    fn test_stale_epoch_write_is_rejected() {
        let store = CredentialStore::new();
        let epoch = store.epoch();

        // A logout happens while the renewal is in flight
        store.clear();

        assert!(!store.set_if_epoch(epoch, "late-token"));
        assert!(store.is_empty());

        let epoch = store.epoch();
        assert!(store.set_if_epoch(epoch, "fresh"));
        assert_eq!(store.get().as_deref(), Some("fresh"));

        // A login lands before a failed renewal settles
        let epoch = store.epoch();
        store.set("from-login");
        assert!(!store.clear_if_epoch(epoch));
        assert_eq!(store.get().as_deref(), Some("from-login"));
    }

    #[test]
    fn test_clear_if_current_keeps_newer_credential() {
        let store = CredentialStore::new();
        store.set("T1");

        // A login replaced T1 before the rejection for it arrived
        store.set("T9");
        assert!(!store.clear_if_current("T1"));
        assert_eq!(store.get().as_deref(), Some("T9"));

        assert!(store.clear_if_current("T9"));
        assert!(store.is_empty());
        assert!(!store.clear_if_current("T9"));
    }

    #[test]
    fn test_token_prefix() {
        assert_eq!(token_prefix("abcdefghijkl"), "abcdefgh");
        assert_eq!(token_prefix("abc"), "abc");
        assert_eq!(token_prefix(""), "");

        let store = CredentialStore::new();
        assert!(store.fingerprint().is_none());
        store.set("eyJhbGciOiJIUzI1NiJ9.payload");
        assert_eq!(store.fingerprint().as_deref(), Some("eyJhbGci"));
    }
}
