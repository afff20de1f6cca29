//! Diagnostics for the dealer ledger.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Ledger health**: schema version, cache size, settlement journal counts
//! - **Diagnostics export**: a redactable JSON bundle with the above plus the
//!   most recent settlement journal rows
//! - **Log rotation helpers**: used by `lib.rs` when configuring log files

use crate::cache::LedgerCache;
use crate::config::LedgerConfig;
use crate::db::{self, DbState};
use crate::settlement;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the daily rolling log files.
pub const LOG_FILE_PREFIX: &str = "ledger.log";

/// Journal rows included in an export.
const EXPORT_JOURNAL_ROWS: usize = 20;

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Ledger health
// ---------------------------------------------------------------------------

/// Collects the local store's health for the diagnostics screen.
pub fn get_ledger_health(db: Arc<DbState>) -> Result<Value, String> {
    // Scoped so the lock is released before the cache and journal queries,
    // which take it again (std::sync::Mutex is not reentrant).
    let (schema_version, db_size) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let schema_version = db::schema_version(&conn);
        let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);
        (schema_version, db_size)
    };

    let journal = settlement::journal_counts(&db).map_err(|e| e.to_string())?;
    let cached_views = LedgerCache::new(db).len().map_err(|e| e.to_string())?;

    Ok(json!({
        "schemaVersion": schema_version,
        "dbSizeBytes": db_size,
        "cachedViews": cached_views,
        "settlementJournal": journal,
    }))
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Writes a diagnostics bundle to `output_dir` and returns its path.
/// Credentials in the bundle are always redacted.
pub fn export_diagnostics(
    db: Arc<DbState>,
    config: &LedgerConfig,
    output_dir: &Path,
) -> Result<String, String> {
    fs::create_dir_all(output_dir).map_err(|e| format!("Failed to create output dir: {e}"))?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let path = output_dir.join(format!("dealer-ledger-diagnostics-{timestamp}.json"));

    let journal = settlement::recent_journal(&db, EXPORT_JOURNAL_ROWS).map_err(|e| e.to_string())?;
    let bundle = json!({
        "about": get_about_info(),
        "health": get_ledger_health(db)?,
        "config": {
            "webhookUrl": config.webhook_url,
            "webhookToken": config.webhook_token,
            "dataDir": config.data_dir.to_string_lossy(),
            "requestTimeoutSecs": config.request_timeout.as_secs(),
            "settleTimeoutSecs": config.settle_timeout.as_secs(),
            "timestampBucketMinutes": config.timestamp_bucket_minutes,
        },
        "recentSettlements": journal,
        "logFiles": list_log_files(&config.log_dir())
            .into_iter()
            .filter_map(|(p, _)| p.file_name().map(|n| n.to_string_lossy().to_string()))
            .collect::<Vec<_>>(),
    });

    let body = serde_json::to_string_pretty(&redact_sensitive_fields(bundle))
        .map_err(|e| e.to_string())?;
    fs::write(&path, body).map_err(|e| format!("Failed to write diagnostics: {e}"))?;

    Ok(path.to_string_lossy().to_string())
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) && !value.is_null() {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = ["secret", "password", "token", "authorization", "key"];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
        && !normalized.ends_with("groupkey")
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

fn list_log_files(log_dir: &Path) -> Vec<(PathBuf, std::time::SystemTime)> {
    let mut log_files = Vec::new();
    let Ok(entries) = fs::read_dir(log_dir) else {
        return log_files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
        if is_log {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            log_files.push((path, modified));
        }
    }
    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));
    log_files
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    for (path, _) in list_log_files(log_dir).iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}
