//! Background sweep tasks
//!
//! Each sweep is a tokio task ticking on its own interval. The sweep itself
//! is blocking Diesel work, so every run goes to `spawn_blocking`. Missed
//! ticks are skipped rather than bunched up.

use crate::lifecycle::LeadEngine;
use crate::sweep::SweepReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    Deadlines,
    Reminders,
}

impl SweepKind {
    pub fn name(&self) -> &'static str {
        match self {
            SweepKind::Deadlines => "deadlines",
            SweepKind::Reminders => "reminders",
        }
    }

    fn interval(&self, engine: &LeadEngine) -> Duration {
        let mins = match self {
            SweepKind::Deadlines => engine.sweep_config().deadline_interval_mins,
            SweepKind::Reminders => engine.sweep_config().reminder_interval_mins,
        };
        Duration::from_secs(mins.max(1) * 60)
    }
}

/// Run one sweep now with the engine's clock and batch size
pub fn run_once(engine: &LeadEngine, kind: SweepKind, cancel: &CancellationToken) -> crate::error::Result<SweepReport> {
    let now = engine.now();
    let config = engine.sweep_config();
    match kind {
        SweepKind::Deadlines => engine.run_deadline_sweep_with(now, config.deadline_batch, cancel),
        SweepKind::Reminders => engine.run_reminder_sweep_with(now, config.reminder_batch, cancel),
    }
}

/// Handles of the running sweep tasks
pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Spawn both sweeps on the current runtime
    pub fn start(engine: Arc<LeadEngine>, cancel: CancellationToken) -> Self {
        let handles = [SweepKind::Deadlines, SweepKind::Reminders]
            .into_iter()
            .map(|kind| tokio::spawn(sweep_loop(engine.clone(), kind, cancel.clone())))
            .collect();
        Self { cancel, handles }
    }

    /// Stop ticking; a lead already being handled finishes first
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "sweep task ended abnormally");
            }
        }
    }
}

async fn sweep_loop(engine: Arc<LeadEngine>, kind: SweepKind, cancel: CancellationToken) {
    let period = kind.interval(&engine);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(sweep = kind.name(), every_secs = period.as_secs(), "sweep scheduled");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let engine = engine.clone();
        let token = cancel.clone();
        let run = tokio::task::spawn_blocking(move || run_once(&engine, kind, &token)).await;
        match run {
            Ok(Ok(report)) => tracing::debug!(sweep = kind.name(), %report, "sweep run"),
            Ok(Err(e)) => tracing::error!(sweep = kind.name(), error = %e, "sweep run failed"),
            Err(e) => tracing::error!(sweep = kind.name(), error = %e, "sweep task panicked"),
        }
    }
    tracing::info!(sweep = kind.name(), "sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::Database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_scheduler_stops_on_cancel() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let db = Database::open_at(dir.path().join("sched.db"), &config.database).unwrap();
        let engine = Arc::new(LeadEngine::new(db, &config));

        let scheduler = Scheduler::start(engine, CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(10), scheduler.shutdown())
            .await
            .unwrap();
    }

    #[test]
    fn test_cancelled_run_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let config = Config::default();
        let db = Database::open_at(dir.path().join("sched.db"), &config.database).unwrap();
        let engine = LeadEngine::new(db, &config);
        let token = CancellationToken::new();
        token.cancel();
        let report = run_once(&engine, SweepKind::Deadlines, &token).unwrap();
        assert_eq!(report.acted, 0);
    }
}
