use std::any::Any;
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, Once,
};

use keyring::credential::{Credential, CredentialApi, CredentialBuilderApi, CredentialPersistence};
use keyring::Error as KeyringError;
use tracing::{info, warn};

/// Service name for every keychain entry the engine writes.
pub const KEYCHAIN_SERVICE_NAME: &str = "odrl-forge";

/// Set to `1`/`true` to skip the OS keychain entirely.
pub const IN_MEMORY_ENV_VAR: &str = "ODRL_FORGE_USE_IN_MEMORY_KEYCHAIN";

static KEYCHAIN_INITIALIZED: Once = Once::new();
static FALLBACK_ACTIVE: AtomicBool = AtomicBool::new(false);

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct EntryKey {
    target: Option<String>,
    service: String,
    user: String,
}

type SecretMap = Arc<Mutex<HashMap<EntryKey, Vec<u8>>>>;

#[derive(Clone, Debug, Default)]
struct InMemoryCredentialBuilder {
    store: SecretMap,
}

#[derive(Clone, Debug)]
struct InMemoryCredential {
    key: EntryKey,
    store: SecretMap,
}

/// Ensure that the keyring backend is usable.
///
/// When the OS keychain cannot be reached (no secret-service daemon, headless
/// CI) this installs a process-wide in-memory credential store instead.
pub fn ensure_available() {
    if using_in_memory_fallback() {
        return;
    }

    if should_force_in_memory() {
        install_in_memory_keyring();
        return;
    }

    KEYCHAIN_INITIALIZED.call_once(|| {
        if let Err(err) = probe_system_keyring() {
            warn!(error = %err, "system keychain unavailable; falling back to in-memory keyring");
            install_in_memory_keyring();
        }
    });
}

/// Force the use of the in-memory keyring. Used by tests.
pub fn force_in_memory_keyring() {
    install_in_memory_keyring();
}

pub fn using_in_memory_fallback() -> bool {
    FALLBACK_ACTIVE.load(Ordering::SeqCst)
}

pub fn store_secret(user: &str, secret: &str) -> keyring::Result<()> {
    ensure_available();
    keyring::Entry::new(KEYCHAIN_SERVICE_NAME, user)?.set_password(secret)
}

/// Returns `Ok(None)` when no secret is stored under `user`.
pub fn load_secret(user: &str) -> keyring::Result<Option<String>> {
    ensure_available();
    match keyring::Entry::new(KEYCHAIN_SERVICE_NAME, user)?.get_password() {
        Ok(secret) => Ok(Some(secret)),
        Err(KeyringError::NoEntry) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Deleting a missing secret is not an error.
pub fn delete_secret(user: &str) -> keyring::Result<()> {
    ensure_available();
    match keyring::Entry::new(KEYCHAIN_SERVICE_NAME, user)?.delete_credential() {
        Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
        Err(err) => Err(err),
    }
}

fn should_force_in_memory() -> bool {
    std::env::var(IN_MEMORY_ENV_VAR)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn probe_system_keyring() -> keyring::Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE_NAME, "__odrl_forge_keychain_probe__")?;
    let test_secret = "__probe_secret__";
    entry.set_password(test_secret)?;
    let retrieved = entry.get_password()?;

    if retrieved != test_secret {
        return Err(KeyringError::BadEncoding(retrieved.into_bytes()));
    }

    match entry.delete_credential() {
        Ok(()) | Err(KeyringError::NoEntry) => Ok(()),
        Err(err) => Err(err),
    }
}

fn install_in_memory_keyring() {
    let was_active = FALLBACK_ACTIVE.swap(true, Ordering::SeqCst);
    if was_active {
        return;
    }
    keyring::set_default_credential_builder(Box::new(InMemoryCredentialBuilder::default()));
    info!("using in-memory keyring; API keys will not persist between runs");
}

impl CredentialBuilderApi for InMemoryCredentialBuilder {
    fn build(
        &self,
        target: Option<&str>,
        service: &str,
        user: &str,
    ) -> keyring::Result<Box<Credential>> {
        let key = EntryKey {
            target: target.map(|value| value.to_string()),
            service: service.to_string(),
            user: user.to_string(),
        };

        Ok(Box::new(InMemoryCredential {
            key,
            store: Arc::clone(&self.store),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn persistence(&self) -> CredentialPersistence {
        CredentialPersistence::ProcessOnly
    }
}

impl CredentialApi for InMemoryCredential {
    fn set_secret(&self, secret: &[u8]) -> keyring::Result<()> {
        let mut store = self
            .store
            .lock()
            .expect("in-memory keyring store poisoned during set");
        store.insert(self.key.clone(), secret.to_vec());
        Ok(())
    }

    fn get_secret(&self) -> keyring::Result<Vec<u8>> {
        let store = self
            .store
            .lock()
            .expect("in-memory keyring store poisoned during get");
        store.get(&self.key).cloned().ok_or(KeyringError::NoEntry)
    }

    fn delete_credential(&self) -> keyring::Result<()> {
        let mut store = self
            .store
            .lock()
            .expect("in-memory keyring store poisoned during delete");

        if store.remove(&self.key).is_some() {
            Ok(())
        } else {
            Err(KeyringError::NoEntry)
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
