//! Run counters and the terminal stats line.

pub mod output;

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::bolts::current_millis;

/// Purely observational run counters; nothing reads them back to make
/// decisions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStatus {
    /// Queue pass iteration index
    pub iteration: u64,
    /// Total sends so far
    pub total_executions: u64,
    /// Crashes with a distinct signature
    pub unique_crash_count: u64,
    /// Hangs on distinct methods
    pub unique_hang_count: u64,
    /// Executions that covered a new path
    pub new_path_count: u64,
    /// Progress through the current entry's energy, percent
    pub message_progress: f64,
    /// Path of the entry under fuzz
    pub current_message: String,
    pub start_time_millis: u64,
    pub new_path_time_millis: u64,
    pub last_crash_time_millis: u64,
    pub last_hang_time_millis: u64,
}

impl LoopStatus {
    /// Executions per second since the run started
    #[must_use]
    pub fn execs_per_sec(&self) -> f64 {
        let elapsed = current_millis().saturating_sub(self.start_time_millis);
        if elapsed == 0 {
            return 0.0;
        }
        self.total_executions as f64 * 1000.0 / elapsed as f64
    }
}

/// Shared, locked view of the counters, handed to background refreshers.
#[derive(Clone, Default)]
pub struct StatsHandle(Arc<Mutex<LoopStatus>>);

impl StatsHandle {
    pub fn update(&self, f: impl FnOnce(&mut LoopStatus)) {
        let mut status = self.0.lock().unwrap();
        f(&mut status);
    }

    #[must_use]
    pub fn snapshot(&self) -> LoopStatus {
        self.0.lock().unwrap().clone()
    }
}

/// Stats that print through a supplied closure, one line per event.
#[derive(Clone)]
pub struct SimpleStats {
    handle: StatsHandle,
    print_fn: Arc<dyn Fn(String) + Send + Sync>,
}

impl SimpleStats {
    /// Creates stats printing through `print_fn`
    pub fn new<F>(print_fn: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        Self {
            handle: StatsHandle::default(),
            print_fn: Arc::new(print_fn),
        }
    }

    /// The shared counter handle
    #[must_use]
    pub fn handle(&self) -> StatsHandle {
        self.handle.clone()
    }

    /// Prints one stats line tagged with the given event
    pub fn display(&self, event: &str) {
        let s = self.handle.snapshot();
        (self.print_fn)(format!(
            "[{event}] iter: {} | execs: {} ({:.1}/s) | paths: {} | crashes: {} | hangs: {} | {} {:.0}%",
            s.iteration,
            s.total_executions,
            s.execs_per_sec(),
            s.new_path_count,
            s.unique_crash_count,
            s.unique_hang_count,
            s.current_message,
            s.message_progress,
        ));
    }
}
