//! Remote credentials in the OS credential store.
//!
//! On Windows this uses the native credential manager (via the `keyring`
//! crate), on macOS Keychain, and on Linux the Secret Service API. Only the
//! remote endpoint and its API key live here; everything else is in the
//! local database or the environment.

use keyring::Entry;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::config::{PosConfig, RemoteConfig};
use crate::error::{PosError, Result};

const SERVICE_NAME: &str = "boutique-pos";

const KEY_REMOTE_URL: &str = "remote_url";
const KEY_REMOTE_API_KEY: &str = "remote_api_key";

const ALL_KEYS: &[&str] = &[KEY_REMOTE_URL, KEY_REMOTE_API_KEY];

fn keyring_err(key: &str, e: keyring::Error) -> PosError {
    PosError::Config(format!("credential store ({key}): {e}"))
}

/// Read one credential. `None` when absent or the store is unavailable.
pub fn get_credential(key: &str) -> Option<Zeroizing<String>> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(Zeroizing::new(pw)),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| keyring_err(key, e))?;
    entry.set_password(value).map_err(|e| keyring_err(key, e))
}

/// Succeeds when the entry is already absent.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| keyring_err(key, e))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(keyring_err(key, e)),
    }
}

/// The stored remote, if both URL and key are present and valid.
pub fn load_remote_config() -> Option<RemoteConfig> {
    let url = get_credential(KEY_REMOTE_URL)?;
    let key = get_credential(KEY_REMOTE_API_KEY)?;
    match RemoteConfig::new(&url, &key) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("Stored remote credentials are unusable: {e}");
            None
        }
    }
}

pub fn save_remote_config(config: &RemoteConfig) -> Result<()> {
    set_credential(KEY_REMOTE_URL, &config.url)?;
    set_credential(KEY_REMOTE_API_KEY, config.api_key.as_str())?;
    info!(url = %config.url, "Remote credentials stored");
    Ok(())
}

/// Forget the remote (terminal reset).
pub fn clear_remote_config() -> Result<()> {
    info!("Deleting stored remote credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

/// Fill in the remote from the credential store when the environment did
/// not provide one.
pub fn with_stored_remote(mut config: PosConfig) -> PosConfig {
    if config.remote.is_none() {
        config.remote = load_remote_config();
    }
    config
}
