//! Counter sources sampled at BEGIN and END.
//!
//! The generated tracing program reads hardware performance counters and
//! per-task kernel counters when it runs in a kernel runtime. When the
//! engine runs in-process (tests, the userspace coordinator) these traits
//! provide the same shape from software sources.

use std::sync::OnceLock;
use std::time::Instant;

use sysinfo::{Pid, ProcessRefreshKind, System};

/// The five hardware counters sampled per invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfCounter {
    CpuCycles,
    Instructions,
    CacheReferences,
    CacheMisses,
    RefCpuCycles,
}

/// Sampling order, fixed to match the metrics struct layout.
pub const PERF_COUNTERS: [PerfCounter; 5] = [
    PerfCounter::CpuCycles,
    PerfCounter::Instructions,
    PerfCounter::CacheReferences,
    PerfCounter::CacheMisses,
    PerfCounter::RefCpuCycles,
];

/// One raw counter read, before multiplexing normalization.
#[derive(Debug, Clone, Copy)]
pub struct PerfSample {
    pub counter: u64,
    pub enabled: u64,
    pub running: u64,
}

impl PerfSample {
    /// `counter × enabled ÷ running`, correcting for counter multiplexing.
    /// `None` when the counter never ran.
    pub fn normalized(&self) -> Option<u64> {
        if self.running == 0 {
            return None;
        }
        let value = u128::from(self.counter) * u128::from(self.enabled) / u128::from(self.running);
        Some(value.min(u128::from(u64::MAX)) as u64)
    }
}

/// Hardware-counter reads. A failed read returns `None` and resets the key.
pub trait PerfSource: Send {
    fn read(&mut self, counter: PerfCounter, cpu_id: u32) -> Option<PerfSample>;
}

/// Process-wide disk I/O counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskIo {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

pub trait TaskIoSource: Send {
    fn read(&mut self) -> TaskIo;
}

/// Per-socket TCP counters, sampled only for backends with a client socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketBytes {
    /// Bytes received but not yet consumed by the application.
    pub unread_bytes: u64,
    pub sent_bytes: u64,
}

pub trait SocketSource: Send {
    fn read(&mut self) -> SocketBytes;
}

/// Monotonic clock plus the executing CPU id.
pub trait ClockSource: Send {
    fn now_ns(&mut self) -> u64;
    fn cpu_id(&mut self) -> u32;
}

/// Nanoseconds to microseconds by right shift, the approximation used
/// throughout the pipeline.
pub fn ns_to_us(ns: u64) -> u64 {
    ns >> 10
}

static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

fn clock_epoch() -> Instant {
    *CLOCK_EPOCH.get_or_init(Instant::now)
}

/// Process-monotonic clock. CPU id is reported as 0; software sources have
/// no migration signal to offer.
#[derive(Debug, Default)]
pub struct MonotonicClock;

impl ClockSource for MonotonicClock {
    fn now_ns(&mut self) -> u64 {
        clock_epoch().elapsed().as_nanos().min(u128::from(u64::MAX)) as u64
    }

    fn cpu_id(&mut self) -> u32 {
        0
    }
}

/// Software stand-in for the hardware counters: derives monotone counter
/// values from elapsed time with per-counter scale factors. `enabled` and
/// `running` are equal, so normalization is the identity and deltas are
/// always non-negative.
#[derive(Debug, Default)]
pub struct SoftwarePerfSource {
    clock: MonotonicClock,
}

impl PerfSource for SoftwarePerfSource {
    fn read(&mut self, counter: PerfCounter, _cpu_id: u32) -> Option<PerfSample> {
        let ns = self.clock.now_ns();
        let value = match counter {
            PerfCounter::CpuCycles => ns.saturating_mul(3),
            PerfCounter::Instructions => ns.saturating_mul(4),
            PerfCounter::CacheReferences => ns / 8,
            PerfCounter::CacheMisses => ns / 64,
            PerfCounter::RefCpuCycles => ns.saturating_mul(2),
        };
        Some(PerfSample {
            counter: value,
            enabled: ns.max(1),
            running: ns.max(1),
        })
    }
}

/// Process-wide disk I/O from the OS, by pid.
pub struct ProcessIoSource {
    system: System,
    pid: Pid,
}

impl ProcessIoSource {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
        }
    }
}

impl TaskIoSource for ProcessIoSource {
    fn read(&mut self) -> TaskIo {
        self.system
            .refresh_process_specifics(self.pid, ProcessRefreshKind::new().with_disk_usage());
        match self.system.process(self.pid) {
            Some(process) => {
                let usage = process.disk_usage();
                TaskIo {
                    read_bytes: usage.total_read_bytes,
                    write_bytes: usage.total_written_bytes,
                }
            }
            None => TaskIo::default(),
        }
    }
}

/// Socket source for backends without a client socket.
#[derive(Debug, Default)]
pub struct NullSocketSource;

impl SocketSource for NullSocketSource {
    fn read(&mut self) -> SocketBytes {
        SocketBytes::default()
    }
}

/// The set of sources one engine samples from.
pub struct SourceSet {
    pub perf: Box<dyn PerfSource>,
    pub io: Box<dyn TaskIoSource>,
    /// Present only when the backend carries a client socket fd.
    pub socket: Option<Box<dyn SocketSource>>,
    pub clock: Box<dyn ClockSource>,
}

impl SourceSet {
    /// Software sources for a target process, used when no kernel runtime is
    /// available.
    pub fn software(pid: u32) -> Self {
        Self {
            perf: Box::new(SoftwarePerfSource::default()),
            io: Box::new(ProcessIoSource::new(pid)),
            socket: None,
            clock: Box::new(MonotonicClock),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_scales_for_multiplexing() {
        let sample = PerfSample {
            counter: 1000,
            enabled: 200,
            running: 100,
        };
        assert_eq!(sample.normalized(), Some(2000));
    }

    #[test]
    fn normalization_fails_when_counter_never_ran() {
        let sample = PerfSample {
            counter: 1000,
            enabled: 200,
            running: 0,
        };
        assert_eq!(sample.normalized(), None);
    }

    #[test]
    fn software_perf_values_are_monotone() {
        let mut source = SoftwarePerfSource::default();
        let first = source.read(PerfCounter::Instructions, 0).unwrap();
        let second = source.read(PerfCounter::Instructions, 0).unwrap();
        assert!(second.normalized().unwrap() >= first.normalized().unwrap());
    }

    #[test]
    fn ns_shift_approximates_microseconds() {
        assert_eq!(ns_to_us(1 << 10), 1);
        assert_eq!(ns_to_us(0), 0);
    }
}
