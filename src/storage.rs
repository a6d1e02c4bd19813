//! Backend credentials in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Nothing secret is
//! written to SQLite.

use keyring::Entry;
use tracing::{info, warn};

use crate::error::{PosError, PosResult};

const SERVICE_NAME: &str = "cafe-pos";

pub const KEY_BACKEND_URL: &str = "backend_url";
pub const KEY_API_KEY: &str = "api_key";

const ALL_KEYS: &[&str] = &[KEY_BACKEND_URL, KEY_API_KEY];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// or the platform store cannot be read.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> PosResult<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| PosError::Credential(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| PosError::Credential(e.to_string()))
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> PosResult<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| PosError::Credential(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(PosError::Credential(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCredentials {
    pub backend_url: String,
    pub api_key: String,
}

impl BackendCredentials {
    /// Both parts must be present and non-blank.
    pub fn from_parts(backend_url: Option<String>, api_key: Option<String>) -> Option<Self> {
        let backend_url = backend_url.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
        let api_key = api_key.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
        Some(Self {
            backend_url,
            api_key,
        })
    }
}

pub fn backend_credentials() -> Option<BackendCredentials> {
    BackendCredentials::from_parts(get_credential(KEY_BACKEND_URL), get_credential(KEY_API_KEY))
}

pub fn store_backend_credentials(backend_url: &str, api_key: &str) -> PosResult<()> {
    let creds = BackendCredentials::from_parts(
        Some(backend_url.to_string()),
        Some(api_key.to_string()),
    )
    .ok_or_else(|| PosError::InvalidInput("backend URL and API key are required".into()))?;

    let normalized = crate::api::normalize_backend_url(&creds.backend_url);
    set_credential(KEY_BACKEND_URL, &normalized)?;
    set_credential(KEY_API_KEY, &creds.api_key)?;
    info!(backend_url = %normalized, "backend credentials updated");
    Ok(())
}

/// Delete every stored credential.
pub fn clear_credentials() -> PosResult<()> {
    info!("clearing backend credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_require_both_parts() {
        assert_eq!(
            BackendCredentials::from_parts(
                Some(" https://pos.example.com ".into()),
                Some("secret\n".into())
            ),
            Some(BackendCredentials {
                backend_url: "https://pos.example.com".into(),
                api_key: "secret".into(),
            })
        );
        assert_eq!(
            BackendCredentials::from_parts(Some("https://pos.example.com".into()), None),
            None
        );
        assert_eq!(
            BackendCredentials::from_parts(Some("   ".into()), Some("secret".into())),
            None
        );
    }

    #[test]
    fn test_store_rejects_blank_input_before_touching_keyring() {
        assert!(matches!(
            store_backend_credentials("", "secret"),
            Err(PosError::InvalidInput(_))
        ));
    }
}
