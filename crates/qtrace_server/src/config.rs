//! Process-wide capture settings.
//!
//! All settings are runtime-settable before a statement begins; executors
//! read a snapshot when a statement starts so a mid-statement flip never
//! changes the fate of frames already on the stack.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Capture configuration shared by every backend in the process.
#[derive(Debug)]
pub struct Settings {
    /// Master gate; when false the whole pipeline is a no-op.
    capture_enabled: AtomicBool,
    /// Enables counter allocation and per-node persistence.
    capture_exec_stats: AtomicBool,
    /// Enables whole-query elapsed-time capture.
    capture_query_runtime: AtomicBool,
    /// When false, only the outermost executor frame persists.
    capture_nested: AtomicBool,
    /// Internal-table output versus JSON-to-log output.
    output_noisepage: AtomicBool,
    /// Per-statement probability of arming the executor markers, f64 bits.
    executor_sampling_rate: AtomicU64,
}

/// Point-in-time copy of [`Settings`], taken once per statement.
#[derive(Debug, Clone, Copy)]
pub struct SettingsSnapshot {
    pub capture_enabled: bool,
    pub capture_exec_stats: bool,
    pub capture_query_runtime: bool,
    pub capture_nested: bool,
    pub output_noisepage: bool,
    pub executor_sampling_rate: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            capture_enabled: AtomicBool::new(false),
            capture_exec_stats: AtomicBool::new(false),
            capture_query_runtime: AtomicBool::new(false),
            capture_nested: AtomicBool::new(false),
            output_noisepage: AtomicBool::new(true),
            executor_sampling_rate: AtomicU64::new(1.0f64.to_bits()),
        }
    }
}

impl Settings {
    pub fn set_capture_enabled(&self, value: bool) {
        self.capture_enabled.store(value, Ordering::Relaxed);
    }

    pub fn set_capture_exec_stats(&self, value: bool) {
        self.capture_exec_stats.store(value, Ordering::Relaxed);
    }

    pub fn set_capture_query_runtime(&self, value: bool) {
        self.capture_query_runtime.store(value, Ordering::Relaxed);
    }

    pub fn set_capture_nested(&self, value: bool) {
        self.capture_nested.store(value, Ordering::Relaxed);
    }

    pub fn set_output_noisepage(&self, value: bool) {
        self.output_noisepage.store(value, Ordering::Relaxed);
    }

    /// Rejects rates outside `[0, 1]` at the boundary.
    pub fn set_executor_sampling_rate(&self, rate: f64) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&rate) || rate.is_nan() {
            anyhow::bail!("executor_sampling_rate must be within [0, 1], got {rate}");
        }
        self.executor_sampling_rate
            .store(rate.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            capture_enabled: self.capture_enabled.load(Ordering::Relaxed),
            capture_exec_stats: self.capture_exec_stats.load(Ordering::Relaxed),
            capture_query_runtime: self.capture_query_runtime.load(Ordering::Relaxed),
            capture_nested: self.capture_nested.load(Ordering::Relaxed),
            output_noisepage: self.output_noisepage.load(Ordering::Relaxed),
            executor_sampling_rate: f64::from_bits(
                self.executor_sampling_rate.load(Ordering::Relaxed),
            ),
        }
    }
}
