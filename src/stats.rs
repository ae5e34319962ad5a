use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde_json::{Map, Value, json};

use crate::stage_client::StageId;

/// Process-wide counters. Written by runs, read only by `/metrics` and the
/// periodic logger.
#[derive(Debug, Default)]
pub struct DecodeStats {
    dropped: DashMap<StageId, u64>,
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl DecodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Malformed or out-of-order SSE messages ignored for `stage`.
    pub fn record_dropped(&self, stage: StageId, count: u64) {
        if count == 0 {
            return;
        }
        *self.dropped.entry(stage).or_insert(0) += count;
    }

    pub fn dropped(&self, stage: StageId) -> u64 {
        self.dropped.get(&stage).map(|v| *v).unwrap_or(0)
    }

    pub fn run_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn run_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_json(&self) -> Value {
        let mut dropped = Map::new();
        let mut stages: Vec<(StageId, u64)> =
            self.dropped.iter().map(|e| (*e.key(), *e.value())).collect();
        stages.sort();
        for (stage, count) in stages {
            dropped.insert(stage.as_str().to_string(), Value::from(count));
        }
        json!({
            "dropped_messages": dropped,
            "runs": {
                "started": self.started.load(Ordering::Relaxed),
                "completed": self.completed.load(Ordering::Relaxed),
                "failed": self.failed.load(Ordering::Relaxed),
                "cancelled": self.cancelled.load(Ordering::Relaxed),
            }
        })
    }
}

impl fmt::Display for DecodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "runs started={} completed={} failed={} cancelled={}",
            self.started.load(Ordering::Relaxed),
            self.completed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.cancelled.load(Ordering::Relaxed),
        )?;
        let mut stages: Vec<(StageId, u64)> =
            self.dropped.iter().map(|e| (*e.key(), *e.value())).collect();
        stages.sort();
        for (stage, count) in stages {
            write!(f, ", {} dropped={}", stage, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_stage() {
        let stats = DecodeStats::new();
        stats.record_dropped(StageId::Generation, 2);
        stats.record_dropped(StageId::Generation, 1);
        stats.record_dropped(StageId::Analysis, 0);
        stats.run_started();
        stats.run_failed();

        assert_eq!(stats.dropped(StageId::Generation), 3);
        assert_eq!(stats.dropped(StageId::Analysis), 0);
        let snapshot = stats.to_json();
        assert_eq!(snapshot["dropped_messages"]["generation"], 3);
        assert!(snapshot["dropped_messages"].get("analysis").is_none());
        assert_eq!(snapshot["runs"]["failed"], 1);
        assert_eq!(
            stats.to_string(),
            "runs started=1 completed=0 failed=1 cancelled=0, generation dropped=3"
        );
    }
}
