//! Dealer Ledger - payment reconciliation and ledger settlement engine.
//!
//! Turns heterogeneous booking, job-card and minor-sale rows from the
//! dealership sheet webhook into canonical ledger entries, aggregates pending
//! collections per staff and branch, and settles them optimistically with
//! rollback. [`LedgerEngine`] wires the pieces together; [`commands`] is the
//! JSON surface a UI shell calls.

use std::sync::Arc;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod alias;
pub mod api;
pub mod balance;
pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod ledger;
pub mod money;
pub mod normalize;
pub mod payments;
pub mod settlement;
pub mod storage;
pub mod summary;
pub mod sync;

pub use api::{LedgerRpc, WebhookClient};
pub use config::LedgerConfig;
pub use error::{LedgerError, Result};
pub use events::{BroadcastEventSink, EventSink, TracingEventSink};
pub use ledger::{CanonicalLedgerEntry, StatusFilter};
pub use settlement::{SettleMode, SettlementAction, SettlementCoordinator, SettlementReceipt};
pub use summary::{AggregateFilters, StaffBranchAggregate};
pub use sync::{FetchOutcome, LedgerQuery, LedgerState, LedgerSync, LedgerView};

// ============================================================================
// Logging
// ============================================================================

/// Install structured logging (console + daily rolling file under
/// `{data_dir}/logs`). Keep the returned guard alive for the life of the
/// process; dropping it flushes buffered log lines.
///
/// A second call leaves the first subscriber in place.
pub fn init_tracing(config: &LedgerConfig) -> std::result::Result<WorkerGuard, String> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .unwrap_or_else(|_| EnvFilter::new(config::DEFAULT_LOG_FILTER));

    // Prune old log files before setting up the appender
    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir).map_err(|e| format!("Failed to create log dir: {e}"))?;
    diagnostics::prune_old_logs(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if installed {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            log_dir = %log_dir.display(),
            "Starting dealer ledger"
        );
    }
    Ok(guard)
}

// ============================================================================
// Engine
// ============================================================================

/// Owns the shared state and both ledger paths.
pub struct LedgerEngine {
    config: LedgerConfig,
    db: Arc<db::DbState>,
    sync: LedgerSync,
    settlement: SettlementCoordinator,
}

impl LedgerEngine {
    /// Open the local store under `config.data_dir` and connect to the
    /// configured webhook.
    pub fn from_config(config: LedgerConfig, events: Arc<dyn EventSink>) -> Result<Self> {
        let url = config.require_webhook_url()?;
        let client = WebhookClient::new(url, config.webhook_token.clone(), config.request_timeout)?;
        let db = db::init(&config.data_dir).map_err(LedgerError::Cache)?;
        info!(webhook_url = %client.url(), "ledger engine ready");
        Ok(Self::new(config, Arc::new(client), Arc::new(db), events))
    }

    /// Assemble an engine from already-built parts.
    pub fn new(
        config: LedgerConfig,
        rpc: Arc<dyn LedgerRpc>,
        db: Arc<db::DbState>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let state = Arc::new(LedgerState::new());
        let sync = LedgerSync::new(
            rpc.clone(),
            db.clone(),
            state.clone(),
            events.clone(),
            config.timestamp_bucket_minutes,
        );
        let settlement =
            SettlementCoordinator::new(rpc, db.clone(), state, events, config.settle_timeout);
        Self {
            config,
            db,
            sync,
            settlement,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn db(&self) -> &Arc<db::DbState> {
        &self.db
    }

    pub fn sync(&self) -> &LedgerSync {
        &self.sync
    }

    pub fn settlement(&self) -> &SettlementCoordinator {
        &self.settlement
    }

    pub fn state(&self) -> &Arc<LedgerState> {
        self.sync.state()
    }
}
