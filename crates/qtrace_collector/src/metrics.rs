//! Per-record resource metrics and the accumulate rule.

use bytes::{Buf, BufMut};

/// Packed wire size of [`ResourceMetrics`]: twelve u64 counters plus
/// `cpu_id` and `pid` as u32.
pub const METRICS_WIRE_SIZE: usize = 12 * 8 + 2 * 4;

/// Resource metrics for one (OU, plan node) invocation.
///
/// At BEGIN the struct holds absolute counter snapshots; at END the same
/// fields are rewritten with deltas against that snapshot. Times are
/// microseconds from a monotonic nanosecond clock shifted right by 10, an
/// intentional approximation accepted throughout the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceMetrics {
    pub start_time: u64,
    pub end_time: u64,
    pub elapsed_us: u64,
    pub cpu_cycles: u64,
    pub instructions: u64,
    pub cache_references: u64,
    pub cache_misses: u64,
    pub ref_cpu_cycles: u64,
    pub disk_bytes_read: u64,
    pub disk_bytes_written: u64,
    pub network_bytes_read: u64,
    pub network_bytes_written: u64,
    pub cpu_id: u32,
    pub pid: u32,
}

impl ResourceMetrics {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u64_ne(self.start_time);
        buf.put_u64_ne(self.end_time);
        buf.put_u64_ne(self.elapsed_us);
        buf.put_u64_ne(self.cpu_cycles);
        buf.put_u64_ne(self.instructions);
        buf.put_u64_ne(self.cache_references);
        buf.put_u64_ne(self.cache_misses);
        buf.put_u64_ne(self.ref_cpu_cycles);
        buf.put_u64_ne(self.disk_bytes_read);
        buf.put_u64_ne(self.disk_bytes_written);
        buf.put_u64_ne(self.network_bytes_read);
        buf.put_u64_ne(self.network_bytes_written);
        buf.put_u32_ne(self.cpu_id);
        buf.put_u32_ne(self.pid);
    }

    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() != METRICS_WIRE_SIZE {
            return None;
        }
        Some(Self {
            start_time: buf.get_u64_ne(),
            end_time: buf.get_u64_ne(),
            elapsed_us: buf.get_u64_ne(),
            cpu_cycles: buf.get_u64_ne(),
            instructions: buf.get_u64_ne(),
            cache_references: buf.get_u64_ne(),
            cache_misses: buf.get_u64_ne(),
            ref_cpu_cycles: buf.get_u64_ne(),
            disk_bytes_read: buf.get_u64_ne(),
            disk_bytes_written: buf.get_u64_ne(),
            network_bytes_read: buf.get_u64_ne(),
            network_bytes_written: buf.get_u64_ne(),
            cpu_id: buf.get_u32_ne(),
            pid: buf.get_u32_ne(),
        })
    }

    /// Render the metric values in wire order, for sink output.
    pub fn render_columns(&self) -> Vec<String> {
        vec![
            self.start_time.to_string(),
            self.end_time.to_string(),
            self.elapsed_us.to_string(),
            self.cpu_cycles.to_string(),
            self.instructions.to_string(),
            self.cache_references.to_string(),
            self.cache_misses.to_string(),
            self.ref_cpu_cycles.to_string(),
            self.disk_bytes_read.to_string(),
            self.disk_bytes_written.to_string(),
            self.network_bytes_read.to_string(),
            self.network_bytes_written.to_string(),
            self.cpu_id.to_string(),
            self.pid.to_string(),
        ]
    }
}

/// Fold a newly finished BEGIN/END pair into an existing completed entry.
///
/// Keeps the existing `start_time`, `cpu_id`, and `pid`, overwrites
/// `end_time`, and sums every other metric. This is exactly the expansion
/// the code generator produces for its accumulate placeholder.
pub fn accumulate(lhs: &mut ResourceMetrics, rhs: &ResourceMetrics) {
    lhs.end_time = rhs.end_time;
    lhs.elapsed_us = lhs.elapsed_us.saturating_add(rhs.elapsed_us);
    lhs.cpu_cycles = lhs.cpu_cycles.saturating_add(rhs.cpu_cycles);
    lhs.instructions = lhs.instructions.saturating_add(rhs.instructions);
    lhs.cache_references = lhs.cache_references.saturating_add(rhs.cache_references);
    lhs.cache_misses = lhs.cache_misses.saturating_add(rhs.cache_misses);
    lhs.ref_cpu_cycles = lhs.ref_cpu_cycles.saturating_add(rhs.ref_cpu_cycles);
    lhs.disk_bytes_read = lhs.disk_bytes_read.saturating_add(rhs.disk_bytes_read);
    lhs.disk_bytes_written = lhs.disk_bytes_written.saturating_add(rhs.disk_bytes_written);
    lhs.network_bytes_read = lhs.network_bytes_read.saturating_add(rhs.network_bytes_read);
    lhs.network_bytes_written = lhs
        .network_bytes_written
        .saturating_add(rhs.network_bytes_written);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_roundtrip() {
        let metrics = ResourceMetrics {
            start_time: 100,
            end_time: 250,
            elapsed_us: 150,
            cpu_cycles: 1,
            instructions: 2,
            cache_references: 3,
            cache_misses: 4,
            ref_cpu_cycles: 5,
            disk_bytes_read: 6,
            disk_bytes_written: 7,
            network_bytes_read: 8,
            network_bytes_written: 9,
            cpu_id: 3,
            pid: 4242,
        };
        let mut buf = Vec::new();
        metrics.encode(&mut buf);
        assert_eq!(buf.len(), METRICS_WIRE_SIZE);
        assert_eq!(ResourceMetrics::decode(&buf), Some(metrics));
    }

    #[test]
    fn accumulate_keeps_first_identity_and_sums_counters() {
        let mut lhs = ResourceMetrics {
            start_time: 10,
            end_time: 20,
            elapsed_us: 10,
            instructions: 100,
            cpu_id: 1,
            pid: 55,
            ..Default::default()
        };
        let rhs = ResourceMetrics {
            start_time: 30,
            end_time: 40,
            elapsed_us: 10,
            instructions: 25,
            cpu_id: 2,
            pid: 55,
            ..Default::default()
        };
        accumulate(&mut lhs, &rhs);
        assert_eq!(lhs.start_time, 10);
        assert_eq!(lhs.end_time, 40);
        assert_eq!(lhs.elapsed_us, 20);
        assert_eq!(lhs.instructions, 125);
        assert_eq!(lhs.cpu_id, 1);
        assert_eq!(lhs.pid, 55);
    }
}
