//! The credential store: the one piece of shared mutable state in the client.
//!
//! A [`CredentialStore`] is a cheap, cloneable handle.  It holds at most one live
//! [`Credential`] and mirrors every change to a [`CredentialStorage`] backend so that a
//! restarted process picks up where it left off.  It performs no network I/O.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Result};

/// A member's role within their organization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrganizationRole {
    Owner,
    Admin,
    User,
}

impl OrganizationRole {
    /// Whether this role may see organization management screens.
    pub fn can_manage(&self) -> bool {
        matches!(self, OrganizationRole::Owner | OrganizationRole::Admin)
    }
}

/// Identity claims carried in the access token's payload.
///
/// These are decoded without verifying the signature and are only good for UI gating.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "organizationId")]
    pub organization_id: String,
    #[serde(rename = "organizationRole")]
    pub organization_role: OrganizationRole,
    /// Expiry as unix seconds, when the issuer includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl Claims {
    /// The expiry instant, if present and representable.
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.exp
            .and_then(|exp| OffsetDateTime::from_unix_timestamp(exp).ok())
    }
}

/// Decode the claims from a JWT's payload segment.
///
/// Returns `None` for anything that is not a three-part token with a base64url JSON payload.
/// Trailing `=` padding is tolerated.
pub fn decode_claims(token: &str) -> Option<Claims> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// An access/refresh token pair plus the claims derived from the access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub claims: Option<Claims>,
}

impl Credential {
    /// Build a credential, deriving claims from the access token.
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        let access_token = access_token.into();
        let claims = decode_claims(&access_token);
        Self {
            access_token,
            refresh_token,
            claims,
        }
    }
}

/// Persistence backend for the credential store.
pub trait CredentialStorage: Send + Sync {
    /// Load the persisted credential, if any.
    fn load(&self) -> Result<Option<Credential>>;

    /// Persist the credential, replacing any previous one.
    fn save(&self, credential: &Credential) -> Result<()>;

    /// Remove the persisted credential entirely.
    fn clear(&self) -> Result<()>;
}

/// Keeps the credential in process memory only.
#[derive(Debug, Default)]
pub struct MemoryCredentialStorage {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Credential>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialStorage for MemoryCredentialStorage {
    fn load(&self) -> Result<Option<Credential>> {
        Ok(self.slot().clone())
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        *self.slot() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.slot() = None;
        Ok(())
    }
}

/// Persists the credential as JSON in `<dir>/<namespace>.json`.
#[derive(Debug, Clone)]
pub struct FileCredentialStorage {
    path: PathBuf,
}

impl FileCredentialStorage {
    /// Create a file-backed storage keyed by `namespace` inside `dir`.
    pub fn new(dir: impl AsRef<Path>, namespace: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{namespace}.json")),
        }
    }

    /// The file this storage reads and writes.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStorage for FileCredentialStorage {
    fn load(&self) -> Result<Option<Credential>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::io(
                format!("failed to read {}", self.path.display()),
                err,
            )),
        }
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(credential)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io(
                format!("failed to remove {}", self.path.display()),
                err,
            )),
        }
    }
}

#[derive(Default)]
struct StoreState {
    credential: Option<Credential>,
    generation: u64,
}

struct StoreInner {
    state: Mutex<StoreState>,
    storage: Arc<dyn CredentialStorage>,
}

/// Shared handle to the single live credential.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

impl CredentialStore {
    /// Create a store backed by `storage`, loading whatever it already holds.
    ///
    /// A storage that fails to load is logged and treated as empty.
    pub fn open(storage: Arc<dyn CredentialStorage>) -> Self {
        let credential = match storage.load() {
            Ok(credential) => credential,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load persisted credential");
                None
            }
        };
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    credential,
                    generation: 0,
                }),
                storage,
            }),
        }
    }

    /// Create an empty store that persists nothing.
    pub fn in_memory() -> Self {
        Self::open(Arc::new(MemoryCredentialStorage::new()))
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A copy of the live credential.
    pub fn credential(&self) -> Option<Credential> {
        self.state().credential.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state()
            .credential
            .as_ref()
            .map(|c| c.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state()
            .credential
            .as_ref()
            .and_then(|c| c.refresh_token.clone())
    }

    pub fn claims(&self) -> Option<Claims> {
        self.state()
            .credential
            .as_ref()
            .and_then(|c| c.claims.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().credential.is_some()
    }

    /// Counter bumped by every `set` and `clear`.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Replace the live credential.
    pub fn set(&self, access_token: impl Into<String>, refresh_token: Option<String>) -> Credential {
        let credential = Credential::new(access_token, refresh_token);
        let mut state = self.state();
        state.credential = Some(credential.clone());
        state.generation += 1;
        self.persist(Some(&credential));
        credential
    }

    /// Replace the live credential only if nothing else replaced or cleared it since
    /// `generation` was observed.  Returns whether the credential was stored.
    pub fn set_if_generation(
        &self,
        generation: u64,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
    ) -> bool {
        let mut state = self.state();
        if state.generation != generation {
            return false;
        }
        let credential = Credential::new(access_token, refresh_token);
        state.credential = Some(credential.clone());
        state.generation += 1;
        self.persist(Some(&credential));
        true
    }

    /// Drop the live credential and its persisted copy.
    pub fn clear(&self) {
        let mut state = self.state();
        state.credential = None;
        state.generation += 1;
        self.persist(None);
    }

    fn persist(&self, credential: Option<&Credential>) {
        let result = match credential {
            Some(credential) => self.inner.storage.save(credential),
            None => self.inner.storage.clear(),
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to persist credential");
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("CredentialStore")
            .field("authenticated", &state.credential.is_some())
            .field("generation", &state.generation)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// Build an unsigned JWT carrying the given claims.
    pub(crate) fn token_for(id: &str, role: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            json!({"_id": id, "organizationId": "org1", "organizationRole": role, "exp": 1_900_000_000})
                .to_string(),
        );
        format!("{header}.{payload}.signature")
    }

    #[test]
    fn decodes_claims_from_payload() {
        let claims = decode_claims(&token_for("u1", "OWNER")).unwrap();
        assert_eq!(claims.id, "u1");
        assert_eq!(claims.organization_id, "org1");
        assert_eq!(claims.organization_role, OrganizationRole::Owner);
        assert!(claims.organization_role.can_manage());
        assert_eq!(claims.expires_at().map(|t| t.unix_timestamp()), Some(1_900_000_000));
    }

    #[test]
    fn tolerates_padded_payload() {
        let token = token_for("u1", "USER");
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        while parts[1].len() % 4 != 0 {
            parts[1].push('=');
        }
        let claims = decode_claims(&parts.join(".")).unwrap();
        assert!(!claims.organization_role.can_manage());
    }

    #[test]
    fn garbage_tokens_have_no_claims() {
        assert!(decode_claims("opaque").is_none());
        assert!(decode_claims("a.!!!.c").is_none());
        let credential = Credential::new("opaque", Some("r".to_string()));
        assert!(credential.claims.is_none());
    }

    #[test]
    fn set_and_clear_bump_generation() {
        let store = CredentialStore::in_memory();
        assert!(!store.is_authenticated());
        let g0 = store.generation();
        store.set(token_for("u1", "USER"), Some("r1".to_string()));
        assert_eq!(store.refresh_token().as_deref(), Some("r1"));
        assert_eq!(store.claims().map(|c| c.id), Some("u1".to_string()));
        assert!(store.generation() > g0);
        let g1 = store.generation();
        store.clear();
        assert!(store.access_token().is_none());
        assert!(store.generation() > g1);
    }

    #[test]
    fn set_if_generation_rejects_stale_writers() {
        let store = CredentialStore::in_memory();
        store.set("a1", Some("r1".to_string()));
        let observed = store.generation();
        store.clear();
        assert!(!store.set_if_generation(observed, "a2", Some("r2".to_string())));
        assert!(store.access_token().is_none());
        let observed = store.generation();
        assert!(store.set_if_generation(observed, "a3", Some("r3".to_string())));
        assert_eq!(store.access_token().as_deref(), Some("a3"));
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("semki-cred-{}", std::process::id()));
        let storage = Arc::new(FileCredentialStorage::new(&dir, "auth-storage"));
        let store = CredentialStore::open(storage.clone());
        store.set(token_for("u9", "ADMIN"), Some("r9".to_string()));

        let reopened = CredentialStore::open(storage.clone());
        assert_eq!(reopened.refresh_token().as_deref(), Some("r9"));
        assert_eq!(
            reopened.claims().map(|c| c.organization_role),
            Some(OrganizationRole::Admin)
        );

        reopened.clear();
        assert!(!storage.path().exists());
        assert!(CredentialStore::open(storage).credential().is_none());
        let _ = fs::remove_dir_all(dir);
    }
}
