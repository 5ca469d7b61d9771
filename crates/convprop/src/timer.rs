use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use convprop_api::TimingSink;
use log::info;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;

static GLOBAL_TIMER: Lazy<StatefulTimer> = Lazy::new(StatefulTimer::new);

/// Accumulated time for one stage label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageTiming {
    pub label: String,
    pub count: u64,
    pub total_ns: u64,
}

impl StageTiming {
    pub fn total(&self) -> Duration {
        Duration::from_nanos(self.total_ns)
    }
}

struct TimerState {
    last: Instant,
    stages: BTreeMap<String, (u64, u64)>,
}

/// Checkpoint timer: each `time_check(label)` charges the time elapsed since the
/// previous checkpoint to `label`.
pub struct StatefulTimer {
    enabled: AtomicBool,
    state: Mutex<TimerState>,
}

impl Default for StatefulTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl StatefulTimer {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            state: Mutex::new(TimerState {
                last: Instant::now(),
                stages: BTreeMap::new(),
            }),
        }
    }

    /// Process-wide instance used by dispatchers unless another sink is set.
    pub fn global() -> &'static StatefulTimer {
        &GLOBAL_TIMER
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        if enabled {
            self.state.lock().last = Instant::now();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn time_check(&self, label: &str) {
        if !self.is_enabled() {
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        let elapsed = saturating_duration_ns(now.saturating_duration_since(state.last));
        state.last = now;
        let entry = state.stages.entry(label.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 = entry.1.saturating_add(elapsed);
    }

    pub fn snapshot(&self) -> Vec<StageTiming> {
        self.state
            .lock()
            .stages
            .iter()
            .map(|(label, (count, total_ns))| StageTiming {
                label: label.clone(),
                count: *count,
                total_ns: *total_ns,
            })
            .collect()
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.stages.clear();
        state.last = Instant::now();
    }

    /// Log every stage at info level; optionally clear afterwards.
    pub fn dump(&self, reset: bool) -> Vec<StageTiming> {
        let stages = self.snapshot();
        for stage in &stages {
            info!(
                "StatefulTimer {}: {:.3} ms over {} checks",
                stage.label,
                stage.total().as_secs_f64() * 1000.0,
                stage.count
            );
        }
        if reset {
            self.reset();
        }
        stages
    }
}

impl TimingSink for StatefulTimer {
    fn time_check(&self, label: &str) {
        StatefulTimer::time_check(self, label);
    }
}

fn saturating_duration_ns(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}
