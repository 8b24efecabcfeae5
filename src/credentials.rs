use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::RwLock;

/// Cookie holding the PKCE verifier between the OAuth start and callback.
pub const VERIFIER_COOKIE: &str = "openrouter_code_verifier";
/// Cookie persisting the OAuth-obtained key across restarts and instances.
pub const OAUTH_KEY_COOKIE: &str = "openrouter_oauth_key";
/// Cookie naming the browser session an obtained key belongs to.
pub const SESSION_COOKIE: &str = "leaderboard_session";

/// Fresh session identifier: 24 random bytes, base64url without padding.
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Same-process cache of OAuth-obtained keys, keyed by session id.
///
/// The persisted cookie is the source of truth: each request resolves its
/// credential through [`CredentialStore::resolve`], which re-hydrates that
/// session's entry from the cookie. A request only ever sees the key of its
/// own session or the statically configured key. Entries have no expiry.
pub struct CredentialStore {
    sessions: RwLock<HashMap<String, String>>,
    fallback: Option<String>,
}

impl CredentialStore {
    /// `fallback` is the statically configured key, used when a session has none.
    pub fn new(fallback: Option<String>) -> Self {
        CredentialStore {
            sessions: RwLock::new(HashMap::new()),
            fallback: fallback.filter(|k| !k.is_empty()),
        }
    }

    /// Key obtained by `session`, else the static fallback, else `None`.
    pub fn get(&self, session: Option<&str>) -> Option<String> {
        let cached = session.and_then(|id| {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions.get(id).cloned()
        });
        cached.or_else(|| self.fallback.clone())
    }

    /// Unconditionally replace the key cached for `session`.
    pub fn set(&self, session: &str, key: impl Into<String>) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session.to_string(), key.into());
    }

    /// Credential for one request: the persisted cookie value when present
    /// (cached under the request's session), otherwise [`CredentialStore::get`].
    pub fn resolve(&self, session: Option<&str>, persisted: Option<&str>) -> Option<String> {
        let session = session.map(str::trim).filter(|s| !s.is_empty());
        match persisted.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => {
                if let Some(id) = session {
                    self.set(id, key);
                }
                Some(key.to_string())
            }
            None => self.get(session),
        }
    }
}
