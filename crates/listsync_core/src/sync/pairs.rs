//! Reconciliation of several list pairs against one store.
//!
//! # Responsibility
//! - Run every registered pair once per pass, in registration order.
//! - Report each pair's outcome separately.
//!
//! # Invariants
//! - Pair ids are unique within a runner, and every engine shares the
//!   runner's store.
//! - A pair that fails does not stop the pairs after it.
//! - Disabled pairs are never registered.

use crate::config::{ConfigError, SyncConfig};
use crate::sync::engine::{SharedStore, SyncEngine, SyncError};
use crate::sync::report::{CycleReport, SyncStatus};
use crate::sync::source::SourceCollaborator;
use log::{info, warn};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Result of one pair within a pass.
#[derive(Debug)]
pub struct PairOutcome {
    pub pair_id: String,
    pub result: Result<CycleReport, SyncError>,
}

/// Outcome of one `run_all` pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<PairOutcome>,
}

impl PassReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// True when at least one pair completed its cycle.
    pub fn is_success(&self) -> bool {
        self.succeeded() > 0
    }

    pub fn outcome(&self, pair_id: &str) -> Option<&PairOutcome> {
        self.outcomes
            .iter()
            .find(|outcome| outcome.pair_id == pair_id)
    }
}

pub struct PairRunner {
    store: SharedStore,
    engines: Vec<SyncEngine>,
}

impl PairRunner {
    pub fn new(store: Connection) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            engines: Vec::new(),
        }
    }

    /// Store handle to build engines with, via `SyncEngine::with_shared_store`.
    pub fn shared_store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    /// Builds and registers an engine for `config` with default clock and
    /// sleeper. Returns `false` when the pair is disabled.
    ///
    /// # Errors
    /// - `SyncError::Config` for an invalid config or a repeated pair id.
    pub fn add_pair(
        &mut self,
        config: SyncConfig,
        source_a: Arc<dyn SourceCollaborator>,
        source_b: Arc<dyn SourceCollaborator>,
    ) -> Result<bool, SyncError> {
        let engine = SyncEngine::with_shared_store(config, self.shared_store(), source_a, source_b)?;
        self.register(engine)
    }

    /// Registers an engine built over `shared_store()`. Returns `false` when
    /// its pair is disabled.
    ///
    /// # Errors
    /// - `SyncError::Config` for a repeated pair id or an engine bound to
    ///   another store.
    pub fn register(&mut self, engine: SyncEngine) -> Result<bool, SyncError> {
        let pair_id = engine.pair_id().to_string();
        if !engine.config().enabled {
            info!("event=pair_register module=sync status=skip pair_id={pair_id} reason=disabled");
            return Ok(false);
        }
        if !engine.shares_store(&self.store) {
            return Err(SyncError::Config(ConfigError::Invalid(format!(
                "pair `{pair_id}` was built over a different store"
            ))));
        }
        if self.engine(&pair_id).is_some() {
            return Err(SyncError::Config(ConfigError::Invalid(format!(
                "pair_id `{pair_id}` is already registered"
            ))));
        }
        info!("event=pair_register module=sync status=ok pair_id={pair_id}");
        self.engines.push(engine);
        Ok(true)
    }

    pub fn engine(&self, pair_id: &str) -> Option<&SyncEngine> {
        self.engines
            .iter()
            .find(|engine| engine.pair_id() == pair_id)
    }

    pub fn pair_ids(&self) -> Vec<&str> {
        self.engines.iter().map(SyncEngine::pair_id).collect()
    }

    /// Runs one cycle per registered pair.
    pub fn run_all(&self, dry_run: bool) -> PassReport {
        let started = Instant::now();
        let mut report = PassReport::default();
        for engine in &self.engines {
            let result = engine.run_cycle(dry_run);
            if let Err(err) = &result {
                warn!(
                    "event=sync_pass module=sync status=warn pair_id={} error={err}",
                    engine.pair_id()
                );
            }
            report.outcomes.push(PairOutcome {
                pair_id: engine.pair_id().to_string(),
                result,
            });
        }
        info!(
            "event=sync_pass module=sync status={} dry_run={dry_run} pairs={} succeeded={} failed={} duration_ms={}",
            if report.is_success() || report.outcomes.is_empty() { "ok" } else { "error" },
            report.outcomes.len(),
            report.succeeded(),
            report.failed(),
            started.elapsed().as_millis()
        );
        report
    }

    /// Status of every registered pair, in registration order.
    pub fn status(&self) -> Result<Vec<(String, SyncStatus)>, SyncError> {
        self.engines
            .iter()
            .map(|engine| Ok((engine.pair_id().to_string(), engine.status()?)))
            .collect()
    }
}
