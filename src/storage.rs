//! Webhook credential storage using the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Only the webhook URL
//! and its shared token live here; everything else is environment config.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

const SERVICE_NAME: &str = "dealer-ledger";

// Credential keys
pub const KEY_WEBHOOK_URL: &str = "webhook_url";
pub const KEY_WEBHOOK_TOKEN: &str = "webhook_token";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_WEBHOOK_URL, KEY_WEBHOOK_TOKEN];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
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

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Show only the last four characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let trimmed = secret.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("****{suffix}")
}

/// Stored webhook config with the token masked.
pub fn get_webhook_summary() -> Value {
    serde_json::json!({
        "webhookUrl": get_credential(KEY_WEBHOOK_URL),
        "webhookToken": get_credential(KEY_WEBHOOK_TOKEN).map(|t| mask_secret(&t)),
    })
}

/// Store webhook credentials.
///
/// Accepts `{ "webhookUrl", "webhookToken" }` or a single
/// `{ "connectionString" }` carrying both.
pub fn update_webhook_credentials(payload: &Value) -> Result<Value, String> {
    let str_field = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| payload.get(*k).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let mut url = str_field(&["webhookUrl", "webhook_url", "url"]);
    let mut token = str_field(&["webhookToken", "webhook_token", "token"]);
    if let Some(conn) = str_field(&["connectionString", "connection_string", "connection"]) {
        url = crate::api::extract_url_from_connection_string(&conn).or(url);
        token = crate::api::extract_token_from_connection_string(&conn).or(token);
    }

    let url = url
        .map(|u| crate::api::normalize_webhook_url(&u))
        .filter(|u| !u.is_empty())
        .ok_or("Missing required field: webhookUrl")?;

    set_credential(KEY_WEBHOOK_URL, &url)?;
    if let Some(token) = token.as_deref() {
        set_credential(KEY_WEBHOOK_TOKEN, token)?;
    }

    info!(webhook_url = %url, "webhook credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<Value, String> {
    info!("deleting all webhook credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}
