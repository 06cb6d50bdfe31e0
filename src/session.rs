//! Session-scoped credential and state storage.
//!
//! Several logged-in identities can live in one client process. Each one owns
//! a session id and a JSON key/value bucket; one session at a time is marked
//! active and supplies the credential for outgoing requests and realtime
//! connections.
//!
//! Storage layout, shared with any other reader of the same medium:
//! - `current_session_id`: the active session pointer.
//! - `mini_chat_session_<id>`: the session's data map as a JSON object.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rand::Rng;
use secrecy::SecretString;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Storage key prefix for per-session data maps.
pub const SESSION_KEY_PREFIX: &str = "mini_chat_session_";
/// Storage key for the active session pointer.
pub const CURRENT_SESSION_KEY: &str = "current_session_id";
/// Session data key holding the bearer credential.
pub const TOKEN_KEY: &str = "token";

const SESSION_ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// String key/value medium backing a [`SessionStore`].
///
/// Implementations are last-write-wins per key and must never fail; a backend
/// that cannot read a key reports it as absent.
pub trait SessionStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: String);
    fn remove_item(&self, key: &str);
    fn keys(&self) -> Vec<String>;
}

/// Process-local storage medium. Lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: String) {
        self.items.write().insert(key.to_string(), value);
    }

    fn remove_item(&self, key: &str) {
        self.items.write().remove(key);
    }

    fn keys(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }
}

/// Source of the bearer credential for the current identity.
pub trait CredentialSource: Send + Sync {
    /// Returns the active credential, or `None` when nobody is signed in.
    fn credential(&self) -> Option<SecretString>;
}

/// Generates an opaque session id: `session_<unix-millis>_<9 base36 chars>`.
///
/// Unique enough for one process lifetime; not suitable as a secret.
pub fn generate_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SESSION_ID_SUFFIX_LEN)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect();
    format!("session_{millis}_{suffix}")
}

/// Multi-identity session store.
///
/// Cloning yields another handle onto the same storage medium. Every
/// operation is total: missing sessions, missing keys and unreadable entries
/// all surface as `None`.
#[derive(Clone)]
pub struct SessionStore {
    storage: Arc<dyn SessionStorage>,
}

impl SessionStore {
    /// Creates a store over a fresh in-memory medium.
    pub fn in_memory() -> Self {
        Self::with_storage(Arc::new(MemoryStorage::new()))
    }

    /// Creates a store over a caller-provided medium.
    pub fn with_storage(storage: Arc<dyn SessionStorage>) -> Self {
        Self { storage }
    }

    /// Marks `session_id` as the active session.
    pub fn set_active(&self, session_id: &str) {
        self.storage
            .set_item(CURRENT_SESSION_KEY, session_id.to_string());
    }

    /// Returns the active session id, if any.
    pub fn get_active_session_id(&self) -> Option<String> {
        self.storage.get_item(CURRENT_SESSION_KEY)
    }

    /// Writes `key` in `session_id`'s bucket, creating the session if needed.
    pub fn put(&self, session_id: &str, key: &str, value: impl Into<Value>) {
        let mut data = self.load(session_id).unwrap_or_default();
        data.insert(key.to_string(), value.into());
        self.save(session_id, &data);
    }

    /// Reads `key` from `session_id`'s bucket.
    pub fn get(&self, session_id: &str, key: &str) -> Option<Value> {
        self.load(session_id)?.remove(key)
    }

    /// Writes `key` in the active session. No-op without an active session.
    pub fn put_active(&self, key: &str, value: impl Into<Value>) {
        match self.get_active_session_id() {
            Some(session_id) => self.put(&session_id, key, value),
            None => debug!(event = "session_put_without_active", key),
        }
    }

    /// Reads `key` from the active session.
    pub fn get_active(&self, key: &str) -> Option<Value> {
        let session_id = self.get_active_session_id()?;
        self.get(&session_id, key)
    }

    /// Removes all data for `session_id`.
    ///
    /// The active pointer is left alone; use [`SessionStore::clear_active`] to
    /// drop the active session.
    pub fn clear(&self, session_id: &str) {
        self.storage.remove_item(&session_key(session_id));
    }

    /// Removes the active session's data and unsets the active pointer.
    pub fn clear_active(&self) {
        if let Some(session_id) = self.get_active_session_id() {
            self.clear(&session_id);
            self.storage.remove_item(CURRENT_SESSION_KEY);
            debug!(event = "session_cleared", session_id = %session_id);
        }
    }

    /// Signs `session_id` out: drops its data, and unsets the active pointer
    /// only while it still names this session.
    pub fn sign_out(&self, session_id: &str) {
        self.clear(session_id);
        if self.get_active_session_id().as_deref() == Some(session_id) {
            self.storage.remove_item(CURRENT_SESSION_KEY);
        }
        debug!(event = "session_signed_out", session_id);
    }

    /// Returns the bearer credential stored in `session_id`, if it holds a
    /// non-empty string token.
    pub fn credential_for(&self, session_id: &str) -> Option<SecretString> {
        match self.get(session_id, TOKEN_KEY)? {
            Value::String(token) if !token.is_empty() => Some(SecretString::from(token)),
            _ => None,
        }
    }

    /// Lists every session id present in the storage medium.
    pub fn list_session_ids(&self) -> Vec<String> {
        self.storage
            .keys()
            .into_iter()
            .filter_map(|key| key.strip_prefix(SESSION_KEY_PREFIX).map(str::to_string))
            .collect()
    }

    /// Starts a new session holding `token` and makes it active.
    pub fn sign_in(&self, token: &str) -> String {
        let session_id = generate_session_id();
        self.put(&session_id, TOKEN_KEY, token);
        self.set_active(&session_id);
        debug!(event = "session_signed_in", session_id = %session_id);
        session_id
    }

    /// Makes `session_id` active and reports whether it carries a credential.
    ///
    /// Used when a session is referenced from outside, such as a
    /// `?sessionId=` deep link.
    pub fn resume(&self, session_id: &str) -> bool {
        self.set_active(session_id);
        self.credential().is_some()
    }

    fn load(&self, session_id: &str) -> Option<Map<String, Value>> {
        let raw = self.storage.get_item(&session_key(session_id))?;
        match serde_json::from_str::<Map<String, Value>>(&raw) {
            Ok(data) => Some(data),
            Err(err) => {
                warn!(
                    event = "session_data_unreadable",
                    session_id,
                    error = %err
                );
                None
            }
        }
    }

    fn save(&self, session_id: &str, data: &Map<String, Value>) {
        match serde_json::to_string(data) {
            Ok(raw) => self.storage.set_item(&session_key(session_id), raw),
            Err(err) => warn!(event = "session_data_unwritable", session_id, error = %err),
        }
    }
}

impl CredentialSource for SessionStore {
    fn credential(&self) -> Option<SecretString> {
        let session_id = self.get_active_session_id()?;
        self.credential_for(&session_id)
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("active", &self.get_active_session_id())
            .finish_non_exhaustive()
    }
}

fn session_key(session_id: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{session_id}")
}
