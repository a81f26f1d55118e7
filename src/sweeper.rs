//! Periodic retention job: expires overdue instances and prunes aged
//! solved-flag and audit records on independent windows.

use chrono::{Duration, NaiveDateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config;
use crate::db::Db;
use crate::docker::SharedEngine;
use crate::lifecycle::Controller;

/// Cutoff for a retention window; `None` means keep forever (window 0).
pub fn retention_cutoff(now: NaiveDateTime, window_seconds: u64) -> Option<NaiveDateTime> {
    if window_seconds == 0 {
        None
    } else {
        Some(now - Duration::seconds(window_seconds as i64))
    }
}

/// Ticks forever until shutdown. A sweep runs to completion before the next
/// tick is honored, so the job never overlaps itself; stopping only ceases
/// scheduling, in-flight engine calls finish.
pub async fn run(
    db: Db,
    engine: SharedEngine,
    controller: Controller,
    config: config::Root,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(config.sweeper.interval));
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => sweep_once(&db, &engine, &controller, &config).await,
            _ = shutdown.changed() => {
                info!("sweeper stopping");
                return;
            }
        }
    }
}

/// One pass over the three steps. Each step commits on its own; a failing
/// step is logged and never blocks the others.
pub async fn sweep_once(db: &Db, engine: &SharedEngine, controller: &Controller, config: &config::Root) {
    let now = Utc::now().naive_utc();

    // step 1: tear down instances past their timeout
    let overdue_cutoff = now - Duration::seconds(config.instances.timeout as i64);
    match db.instances_started_before(overdue_cutoff).await {
        Ok(overdue) if overdue.is_empty() => {}
        Ok(overdue) => {
            let handle = engine.read().await.clone();
            match handle {
                Some(engine) => {
                    for instance in overdue {
                        if let Err(e) = controller.expire(&engine, &instance).await {
                            warn!("failed to expire instance {}: {e}", instance.uuid);
                        }
                    }
                }
                None => warn!(
                    "engine not initialized, {} overdue instances left running",
                    overdue.len()
                ),
            }
        }
        Err(e) => warn!("failed to list overdue instances: {e}"),
    }

    // step 2: prune solved-flag history
    if let Some(cutoff) = retention_cutoff(now, config.sweeper.solved_flag_retention) {
        match db.delete_solved_flags_before(cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(
                "pruned {n} solved flags older than {}s",
                config.sweeper.solved_flag_retention
            ),
            Err(e) => warn!("failed to prune solved flags: {e}"),
        }
    }

    // step 3: prune the audit log, on its own window
    if let Some(cutoff) = retention_cutoff(now, config.sweeper.cheating_log_retention) {
        match db.delete_cheating_attempts_before(cutoff).await {
            Ok(0) => {}
            Ok(n) => info!(
                "pruned {n} cheating records older than {}s",
                config.sweeper.cheating_log_retention
            ),
            Err(e) => warn!("failed to prune cheating records: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_splits_records_by_age() {
        let now = Utc::now().naive_utc();
        let cutoff = retention_cutoff(now, 86400).unwrap();

        let aged_90000 = now - Duration::seconds(90000);
        let aged_80000 = now - Duration::seconds(80000);

        // 90000s old falls before the cutoff and gets deleted
        assert!(aged_90000 < cutoff);
        // 80000s old survives
        assert!(aged_80000 >= cutoff);
    }

    #[test]
    fn zero_window_keeps_everything() {
        let now = Utc::now().naive_utc();
        assert_eq!(retention_cutoff(now, 0), None);
    }
}
