//! Instrumentation blocks and the counter-block downcast discipline.
//!
//! The host executor attaches a generic instrumentation block to plan-state
//! nodes when timing is requested. The counter pipeline swaps in extended
//! blocks carrying ten opaque f64 accumulators plus a signature word. Every
//! helper that treats a block as a counter block checks the signature first;
//! a missing signature is not an error, it means "not ours, ignore".

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Signature word tagging counter blocks owned by this pipeline.
pub const COUNTER_BLOCK_SIGNATURE: u32 = 0x5153_5343;

/// Number of opaque counters per block. Counter meaning is assigned by
/// convention per OU; the core never interprets them.
pub const NUM_COUNTERS: usize = 10;

/// Timing flag for `QueryDesc::instrument_options`.
pub const INSTRUMENT_TIMER: u32 = 1 << 0;

fn atomic_add_f64(cell: &AtomicU64, value: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + value).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Instrumentation attached to one plan-state node (or to plan-independent
/// work such as triggers).
pub struct Instrumentation {
    signature: u32,
    plan_node_id: i32,
    /// OU label for plan-independent blocks; empty for plan nodes.
    ou: Option<String>,
    total_us: AtomicU64,
    counters: [AtomicU64; NUM_COUNTERS],
    payload: AtomicI64,
}

impl Instrumentation {
    /// A counter block owned by the counter pipeline.
    pub fn counter_block(plan_node_id: i32, ou: Option<&str>) -> Arc<Self> {
        Arc::new(Self::raw(COUNTER_BLOCK_SIGNATURE, plan_node_id, ou))
    }

    /// A plain timing block the host executor would have allocated itself.
    /// Carries no counter signature.
    pub fn foreign(plan_node_id: i32) -> Arc<Self> {
        Arc::new(Self::raw(0, plan_node_id, None))
    }

    fn raw(signature: u32, plan_node_id: i32, ou: Option<&str>) -> Self {
        Self {
            signature,
            plan_node_id,
            ou: ou.map(str::to_string),
            total_us: AtomicU64::new(0f64.to_bits()),
            counters: std::array::from_fn(|_| AtomicU64::new(0f64.to_bits())),
            payload: AtomicI64::new(0),
        }
    }

    /// The downcast check. Everything below that touches counters goes
    /// through this.
    pub fn is_counter_block(&self) -> bool {
        self.signature == COUNTER_BLOCK_SIGNATURE
    }

    pub fn plan_node_id(&self) -> i32 {
        self.plan_node_id
    }

    pub fn ou(&self) -> Option<&str> {
        self.ou.as_deref()
    }

    /// Non-blocking, signature-checked counter increment. Silently ignores
    /// foreign blocks and out-of-range counter indexes.
    pub fn add_counter(&self, index: usize, value: f64) {
        if !self.is_counter_block() {
            return;
        }
        if let Some(cell) = self.counters.get(index) {
            atomic_add_f64(cell, value);
        }
    }

    /// Counter value; zero for foreign blocks.
    pub fn counter(&self, index: usize) -> f64 {
        if !self.is_counter_block() {
            return 0.0;
        }
        self.counters
            .get(index)
            .map(|cell| f64::from_bits(cell.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }

    pub fn add_elapsed(&self, elapsed: Duration) {
        atomic_add_f64(&self.total_us, elapsed.as_secs_f64() * 1_000_000.0);
    }

    /// Accumulated elapsed time in microseconds.
    pub fn total_us(&self) -> f64 {
        f64::from_bits(self.total_us.load(Ordering::Relaxed))
    }

    pub fn set_payload(&self, value: i64) {
        self.payload.store(value, Ordering::Relaxed);
    }

    pub fn payload(&self) -> i64 {
        self.payload.load(Ordering::Relaxed)
    }
}

/// A correctly paired begin/end timer: start is captured at construction and
/// consumed exactly once at stop.
pub struct ElapsedTimer {
    started: Instant,
}

impl ElapsedTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn stop(self) -> Duration {
        self.started.elapsed()
    }
}

/// Add a counter increment through an optional instrumentation reference.
/// Null-safe: absent blocks are tolerated.
pub fn instrument_add_counter(instr: Option<&Arc<Instrumentation>>, index: usize, value: f64) {
    if let Some(instr) = instr {
        instr.add_counter(index, value);
    }
}
