//! Per-key collector state machines.
//!
//! For every `(ou_index, plan_node_id)` key the engine runs the protocol
//! `BEGIN → END (one or more) → FLUSH`, with FEATURES stored any time after
//! BEGIN. BEGIN snapshots the counter sources, END folds the deltas into the
//! completed entry, FLUSH joins features with metrics and publishes the
//! record on the OU's ring. Any read failure or protocol violation RESETs
//! the key: all three maps forget it and nothing is emitted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BufMut;

use crate::metrics::{accumulate, ResourceMetrics, METRICS_WIRE_SIZE};
use crate::ring::RecordRing;
use crate::schema::CollectorSchema;
use crate::sources::{ns_to_us, PerfCounter, SourceSet, PERF_COUNTERS};

/// Fixed capacity of each collector map. Overflowing writes fail silently
/// (counted, never fatal).
pub const MAP_CAPACITY: usize = 64;

/// Default capacity of each per-OU record ring.
pub const RING_CAPACITY: usize = 1024;

/// `(ou_index, plan_node_id)` packed into 64 bits. plan_node_id is unique
/// within one backend even across repeated invocations, so one outstanding
/// BEGIN per key is the protocol invariant.
fn state_key(ou_index: u32, plan_node_id: i32) -> u64 {
    (u64::from(ou_index)) << 32 | u64::from(plan_node_id as u32)
}

struct BoundedMap<K, V> {
    entries: HashMap<K, V>,
    capacity: usize,
}

impl<K: std::hash::Hash + Eq, V> BoundedMap<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Insert or replace. Returns false when the map is full and the key is
    /// new; the write is dropped.
    fn insert(&mut self, key: K, value: V) -> bool {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Counters exported for observability, per OU. A reset is any discarded
/// key (protocol violation, failed counter read, backward-moving counter);
/// overflows are map writes dropped at capacity.
pub struct CollectorStats {
    resets: Vec<AtomicU64>,
    map_overflows: Vec<AtomicU64>,
}

#[derive(Debug, Clone)]
pub struct CollectorStatsSnapshot {
    pub resets: Vec<u64>,
    pub map_overflows: Vec<u64>,
}

impl CollectorStats {
    fn new(ou_count: usize) -> Self {
        Self {
            resets: (0..ou_count).map(|_| AtomicU64::new(0)).collect(),
            map_overflows: (0..ou_count).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn count_reset(&self, ou_index: u32) {
        if let Some(counter) = self.resets.get(ou_index as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn count_overflow(&self, ou_index: u32) {
        if let Some(counter) = self.map_overflows.get(ou_index as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn resets(&self, ou_index: u32) -> u64 {
        self.resets
            .get(ou_index as usize)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn map_overflows(&self, ou_index: u32) -> u64 {
        self.map_overflows
            .get(ou_index as usize)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> CollectorStatsSnapshot {
        CollectorStatsSnapshot {
            resets: self
                .resets
                .iter()
                .map(|counter| counter.load(Ordering::Relaxed))
                .collect(),
            map_overflows: self
                .map_overflows
                .iter()
                .map(|counter| counter.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

/// Presence of a key across the three collector maps, for invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyState {
    pub running: bool,
    pub complete: bool,
    pub features: bool,
}

impl KeyState {
    pub fn is_absent(&self) -> bool {
        !self.running && !self.complete && !self.features
    }
}

/// One backend's collector: state maps, counter sources, and per-OU rings.
pub struct CollectorEngine {
    schema: Arc<CollectorSchema>,
    pid: u32,
    running: BoundedMap<u64, ResourceMetrics>,
    complete: BoundedMap<u64, ResourceMetrics>,
    features: Vec<BoundedMap<i32, Vec<u8>>>,
    rings: Vec<Arc<RecordRing>>,
    stats: Arc<CollectorStats>,
    sources: SourceSet,
}

fn perf_field(metrics: &ResourceMetrics, counter: PerfCounter) -> u64 {
    match counter {
        PerfCounter::CpuCycles => metrics.cpu_cycles,
        PerfCounter::Instructions => metrics.instructions,
        PerfCounter::CacheReferences => metrics.cache_references,
        PerfCounter::CacheMisses => metrics.cache_misses,
        PerfCounter::RefCpuCycles => metrics.ref_cpu_cycles,
    }
}

fn set_perf_field(metrics: &mut ResourceMetrics, counter: PerfCounter, value: u64) {
    match counter {
        PerfCounter::CpuCycles => metrics.cpu_cycles = value,
        PerfCounter::Instructions => metrics.instructions = value,
        PerfCounter::CacheReferences => metrics.cache_references = value,
        PerfCounter::CacheMisses => metrics.cache_misses = value,
        PerfCounter::RefCpuCycles => metrics.ref_cpu_cycles = value,
    }
}

impl CollectorEngine {
    pub fn new(schema: Arc<CollectorSchema>, pid: u32, sources: SourceSet) -> Self {
        Self::with_ring_capacity(schema, pid, sources, RING_CAPACITY)
    }

    pub fn with_ring_capacity(
        schema: Arc<CollectorSchema>,
        pid: u32,
        sources: SourceSet,
        ring_capacity: usize,
    ) -> Self {
        let ou_count = schema.ous.len();
        Self {
            pid,
            running: BoundedMap::new(MAP_CAPACITY),
            complete: BoundedMap::new(MAP_CAPACITY),
            features: (0..ou_count).map(|_| BoundedMap::new(MAP_CAPACITY)).collect(),
            rings: (0..ou_count)
                .map(|_| Arc::new(RecordRing::new(ring_capacity)))
                .collect(),
            stats: Arc::new(CollectorStats::new(ou_count)),
            schema,
            sources,
        }
    }

    pub fn schema(&self) -> &Arc<CollectorSchema> {
        &self.schema
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn ring(&self, ou_index: u32) -> Option<Arc<RecordRing>> {
        self.rings.get(ou_index as usize).cloned()
    }

    pub fn rings(&self) -> &[Arc<RecordRing>] {
        &self.rings
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    /// Close every ring, waking consumers for shutdown.
    pub fn close(&self) {
        for ring in &self.rings {
            ring.close();
        }
    }

    pub fn key_state(&self, ou_index: u32, plan_node_id: i32) -> KeyState {
        let key = state_key(ou_index, plan_node_id);
        KeyState {
            running: self.running.contains_key(&key),
            complete: self.complete.contains_key(&key),
            features: self
                .features
                .get(ou_index as usize)
                .map(|map| map.contains_key(&plan_node_id))
                .unwrap_or(false),
        }
    }

    fn reset_key(&mut self, ou_index: u32, plan_node_id: i32) {
        let key = state_key(ou_index, plan_node_id);
        self.running.remove(&key);
        self.complete.remove(&key);
        if let Some(map) = self.features.get_mut(ou_index as usize) {
            map.remove(&plan_node_id);
        }
    }

    fn discard(&mut self, ou_index: u32, plan_node_id: i32) {
        tracing::trace!(ou_index, plan_node_id, "resetting collector key");
        self.reset_key(ou_index, plan_node_id);
        self.stats.count_reset(ou_index);
    }

    /// BEGIN: snapshot every counter source and arm the key.
    pub fn on_begin(&mut self, ou_index: u32, plan_node_id: i32) {
        if ou_index as usize >= self.schema.ous.len() {
            return;
        }
        let key = state_key(ou_index, plan_node_id);
        if self.running.contains_key(&key) {
            // Nested BEGIN for the same key violates the one-outstanding
            // invariant; discard everything we had.
            self.discard(ou_index, plan_node_id);
            return;
        }

        let mut snapshot = ResourceMetrics::default();
        let cpu_id = self.sources.clock.cpu_id();
        for counter in PERF_COUNTERS {
            let Some(value) = self
                .sources
                .perf
                .read(counter, cpu_id)
                .and_then(|sample| sample.normalized())
            else {
                self.discard(ou_index, plan_node_id);
                return;
            };
            set_perf_field(&mut snapshot, counter, value);
        }
        let io = self.sources.io.read();
        snapshot.disk_bytes_read = io.read_bytes;
        snapshot.disk_bytes_written = io.write_bytes;
        if let Some(socket) = self.sources.socket.as_mut() {
            let bytes = socket.read();
            snapshot.network_bytes_read = bytes.unread_bytes;
            snapshot.network_bytes_written = bytes.sent_bytes;
        }
        // Take the start time after the probes so probe cost is excluded.
        snapshot.start_time = ns_to_us(self.sources.clock.now_ns());
        snapshot.pid = self.pid;

        if !self.running.insert(key, snapshot) {
            self.stats.count_overflow(ou_index);
        }
    }

    /// END: compute deltas against the snapshot and fold into the completed
    /// entry, accumulating across repeated BEGIN/END pairs.
    pub fn on_end(&mut self, ou_index: u32, plan_node_id: i32) {
        if ou_index as usize >= self.schema.ous.len() {
            return;
        }
        let key = state_key(ou_index, plan_node_id);
        let Some(snapshot) = self.running.remove(&key) else {
            self.discard(ou_index, plan_node_id);
            return;
        };

        // End time is taken before the probes, mirroring BEGIN.
        let end_time = ns_to_us(self.sources.clock.now_ns());
        let Some(elapsed_us) = end_time.checked_sub(snapshot.start_time) else {
            self.discard(ou_index, plan_node_id);
            return;
        };

        let mut finished = ResourceMetrics {
            start_time: snapshot.start_time,
            end_time,
            elapsed_us,
            pid: self.pid,
            ..Default::default()
        };

        let cpu_id = self.sources.clock.cpu_id();
        for counter in PERF_COUNTERS {
            let Some(end_value) = self
                .sources
                .perf
                .read(counter, cpu_id)
                .and_then(|sample| sample.normalized())
            else {
                self.discard(ou_index, plan_node_id);
                return;
            };
            let begin_value = perf_field(&snapshot, counter);
            // A counter that moved backward (CPU migration) poisons the key.
            let Some(delta) = end_value.checked_sub(begin_value) else {
                self.discard(ou_index, plan_node_id);
                return;
            };
            set_perf_field(&mut finished, counter, delta);
        }
        finished.cpu_id = cpu_id;

        let io = self.sources.io.read();
        let (Some(disk_read), Some(disk_written)) = (
            io.read_bytes.checked_sub(snapshot.disk_bytes_read),
            io.write_bytes.checked_sub(snapshot.disk_bytes_written),
        ) else {
            self.discard(ou_index, plan_node_id);
            return;
        };
        finished.disk_bytes_read = disk_read;
        finished.disk_bytes_written = disk_written;

        if let Some(socket) = self.sources.socket.as_mut() {
            let bytes = socket.read();
            let (Some(net_read), Some(net_written)) = (
                bytes.unread_bytes.checked_sub(snapshot.network_bytes_read),
                bytes.sent_bytes.checked_sub(snapshot.network_bytes_written),
            ) else {
                self.discard(ou_index, plan_node_id);
                return;
            };
            finished.network_bytes_read = net_read;
            finished.network_bytes_written = net_written;
        }

        match self.complete.get_mut(&key) {
            Some(existing) => accumulate(existing, &finished),
            None => {
                if !self.complete.insert(key, finished) {
                    self.stats.count_overflow(ou_index);
                }
            }
        }
    }

    /// FEATURES: scratch-copy the payload, keyed by plan node alone, held
    /// until FLUSH.
    pub fn on_features(&mut self, ou_index: u32, plan_node_id: i32, payload: &[u8]) {
        let Some(expected_len) = self.schema.ou(ou_index).map(|ou| ou.feature_wire_size()) else {
            return;
        };
        let key = state_key(ou_index, plan_node_id);
        if !self.running.contains_key(&key) && !self.complete.contains_key(&key) {
            // FEATURES without a BEGIN.
            self.discard(ou_index, plan_node_id);
            return;
        }
        if payload.len() != expected_len {
            self.discard(ou_index, plan_node_id);
            return;
        }
        if !self.features[ou_index as usize].insert(plan_node_id, payload.to_vec()) {
            self.stats.count_overflow(ou_index);
        }
    }

    /// FLUSH: join features with accumulated metrics, publish, and RESET.
    pub fn on_flush(&mut self, ou_index: u32, plan_node_id: i32) {
        if ou_index as usize >= self.schema.ous.len() {
            return;
        }
        let key = state_key(ou_index, plan_node_id);
        let has_features = self.features[ou_index as usize].contains_key(&plan_node_id);
        if !has_features || !self.complete.contains_key(&key) {
            self.discard(ou_index, plan_node_id);
            return;
        }

        let features = self.features[ou_index as usize]
            .remove(&plan_node_id)
            .expect("features present");
        let metrics = self.complete.remove(&key).expect("complete present");
        self.running.remove(&key);

        let mut record = Vec::with_capacity(4 + features.len() + METRICS_WIRE_SIZE);
        record.put_u32_ne(ou_index);
        record.extend_from_slice(&features);
        metrics.encode(&mut record);
        // A full ring drops the record; the ring counts it.
        self.rings[ou_index as usize].push(record);
    }

    /// Total entries across the running/complete maps, for debug logging.
    pub fn outstanding(&self) -> usize {
        self.running.len() + self.complete.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::PopResult;
    use crate::schema::{decode_record, FieldKind, FieldSpec, FieldValue, OuSchema};
    use crate::sources::{ClockSource, PerfSample, PerfSource, SocketBytes, SocketSource, TaskIo, TaskIoSource};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::time::Duration;

    const SEQ_SCAN: u32 = 0;
    const AGG: u32 = 1;

    fn test_schema() -> Arc<CollectorSchema> {
        Arc::new(CollectorSchema::new(vec![
            OuSchema {
                ou_index: SEQ_SCAN,
                name: "ExecSeqScan".to_string(),
                features: vec![
                    FieldSpec::new("query_id", FieldKind::Int64),
                    FieldSpec::new("plan_plan_node_id", FieldKind::Int32),
                    FieldSpec::new("scan_scanrelid", FieldKind::Int32),
                ],
            },
            OuSchema {
                ou_index: AGG,
                name: "ExecAgg".to_string(),
                features: vec![FieldSpec::new("query_id", FieldKind::Int64)],
            },
        ]))
    }

    #[derive(Clone, Default)]
    struct Script {
        time_ns: Arc<AtomicU64>,
        perf_value: Arc<AtomicU64>,
        perf_fails: Arc<AtomicBool>,
        cpu: Arc<AtomicU32>,
        io_read: Arc<AtomicU64>,
        io_written: Arc<AtomicU64>,
    }

    impl Script {
        fn advance_us(&self, us: u64) {
            self.time_ns.fetch_add(us << 10, Ordering::Relaxed);
        }
    }

    struct ScriptPerf(Script);

    impl PerfSource for ScriptPerf {
        fn read(&mut self, _counter: PerfCounter, _cpu_id: u32) -> Option<PerfSample> {
            if self.0.perf_fails.load(Ordering::Relaxed) {
                return None;
            }
            Some(PerfSample {
                counter: self.0.perf_value.load(Ordering::Relaxed),
                enabled: 1,
                running: 1,
            })
        }
    }

    struct ScriptIo(Script);

    impl TaskIoSource for ScriptIo {
        fn read(&mut self) -> TaskIo {
            TaskIo {
                read_bytes: self.0.io_read.load(Ordering::Relaxed),
                write_bytes: self.0.io_written.load(Ordering::Relaxed),
            }
        }
    }

    struct ScriptClock(Script);

    impl ClockSource for ScriptClock {
        fn now_ns(&mut self) -> u64 {
            self.0.time_ns.load(Ordering::Relaxed)
        }

        fn cpu_id(&mut self) -> u32 {
            self.0.cpu.load(Ordering::Relaxed)
        }
    }

    struct ZeroSocket;

    impl SocketSource for ZeroSocket {
        fn read(&mut self) -> SocketBytes {
            SocketBytes::default()
        }
    }

    fn engine_with(script: &Script, ring_capacity: usize) -> CollectorEngine {
        let sources = SourceSet {
            perf: Box::new(ScriptPerf(script.clone())),
            io: Box::new(ScriptIo(script.clone())),
            socket: None,
            clock: Box::new(ScriptClock(script.clone())),
        };
        CollectorEngine::with_ring_capacity(test_schema(), 4242, sources, ring_capacity)
    }

    fn seq_scan_features(plan_node_id: i32, query_id: i64, relid: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        crate::schema::encode_features(
            &test_schema().ou(SEQ_SCAN).unwrap().features,
            &[
                FieldValue::Int64(query_id),
                FieldValue::Int32(plan_node_id),
                FieldValue::Int32(relid),
            ],
            &mut buf,
        );
        buf
    }

    fn pop_record(engine: &CollectorEngine, ou: u32) -> Option<Vec<u8>> {
        match engine.ring(ou).unwrap().pop_timeout(Duration::from_millis(5)) {
            PopResult::Record(record) => Some(record),
            _ => None,
        }
    }

    #[test]
    fn single_pair_emits_one_record() {
        let script = Script::default();
        script.time_ns.store(1000 << 10, Ordering::Relaxed);
        script.perf_value.store(500, Ordering::Relaxed);
        let mut engine = engine_with(&script, 8);

        engine.on_begin(SEQ_SCAN, 7);
        engine.on_features(SEQ_SCAN, 7, &seq_scan_features(7, 42, 100));
        script.advance_us(250);
        script.perf_value.store(560, Ordering::Relaxed);
        engine.on_end(SEQ_SCAN, 7);
        engine.on_flush(SEQ_SCAN, 7);

        let record = pop_record(&engine, SEQ_SCAN).expect("one record");
        let decoded = decode_record(&test_schema(), &record).expect("decodable");
        assert_eq!(decoded.ou_index, SEQ_SCAN);
        assert_eq!(decoded.features[2], FieldValue::Int32(100));
        assert_eq!(decoded.metrics.start_time, 1000);
        assert_eq!(decoded.metrics.end_time, 1250);
        assert_eq!(decoded.metrics.elapsed_us, 250);
        assert_eq!(decoded.metrics.instructions, 60);
        assert_eq!(decoded.metrics.pid, 4242);
        assert!(pop_record(&engine, SEQ_SCAN).is_none());
        assert!(engine.key_state(SEQ_SCAN, 7).is_absent());
    }

    #[test]
    fn accumulation_across_three_pairs() {
        let script = Script::default();
        script.time_ns.store(100 << 10, Ordering::Relaxed);
        let mut engine = engine_with(&script, 8);

        let deltas = [10u64, 20, 30];
        let mut counter = 1000u64;
        for (round, delta) in deltas.iter().enumerate() {
            script.perf_value.store(counter, Ordering::Relaxed);
            script.cpu.store(round as u32 + 1, Ordering::Relaxed);
            engine.on_begin(SEQ_SCAN, 7);
            script.advance_us(5);
            counter += delta;
            script.perf_value.store(counter, Ordering::Relaxed);
            engine.on_end(SEQ_SCAN, 7);
            script.advance_us(5);
        }
        engine.on_features(SEQ_SCAN, 7, &seq_scan_features(7, 9, 100));
        engine.on_flush(SEQ_SCAN, 7);

        let record = pop_record(&engine, SEQ_SCAN).expect("one record");
        let decoded = decode_record(&test_schema(), &record).unwrap();
        assert_eq!(decoded.metrics.instructions, 60);
        assert_eq!(decoded.metrics.start_time, 100);
        // Last END happened after two full rounds plus one begin-to-end gap.
        assert_eq!(decoded.metrics.end_time, 125);
        // cpu_id comes from the first END.
        assert_eq!(decoded.metrics.cpu_id, 1);
        assert_eq!(decoded.metrics.elapsed_us, 15);
    }

    #[test]
    fn flush_without_features_resets_and_counts() {
        let script = Script::default();
        let mut engine = engine_with(&script, 8);

        engine.on_begin(SEQ_SCAN, 7);
        engine.on_end(SEQ_SCAN, 7);
        engine.on_flush(SEQ_SCAN, 7);

        assert!(pop_record(&engine, SEQ_SCAN).is_none());
        assert_eq!(engine.stats().resets(SEQ_SCAN), 1);
        assert!(engine.key_state(SEQ_SCAN, 7).is_absent());
    }

    #[test]
    fn backward_counter_resets_key() {
        let script = Script::default();
        script.perf_value.store(1000, Ordering::Relaxed);
        let mut engine = engine_with(&script, 8);

        engine.on_begin(SEQ_SCAN, 3);
        engine.on_features(SEQ_SCAN, 3, &seq_scan_features(3, 1, 5));
        // Normalized counter moves backward, e.g. after a CPU migration.
        script.perf_value.store(900, Ordering::Relaxed);
        engine.on_end(SEQ_SCAN, 3);

        assert!(engine.key_state(SEQ_SCAN, 3).is_absent());
        engine.on_flush(SEQ_SCAN, 3);
        assert!(pop_record(&engine, SEQ_SCAN).is_none());
    }

    #[test]
    fn perf_read_failure_at_begin_resets() {
        let script = Script::default();
        script.perf_fails.store(true, Ordering::Relaxed);
        let mut engine = engine_with(&script, 8);

        engine.on_begin(SEQ_SCAN, 1);
        assert!(engine.key_state(SEQ_SCAN, 1).is_absent());
        assert_eq!(engine.stats().resets(SEQ_SCAN), 1);
    }

    #[test]
    fn nested_begin_is_a_protocol_violation() {
        let script = Script::default();
        let mut engine = engine_with(&script, 8);

        engine.on_begin(SEQ_SCAN, 7);
        engine.on_begin(SEQ_SCAN, 7);
        assert!(engine.key_state(SEQ_SCAN, 7).is_absent());
        assert_eq!(engine.stats().resets(SEQ_SCAN), 1);
    }

    #[test]
    fn features_without_begin_is_discarded() {
        let script = Script::default();
        let mut engine = engine_with(&script, 8);

        engine.on_features(SEQ_SCAN, 7, &seq_scan_features(7, 1, 2));
        assert!(engine.key_state(SEQ_SCAN, 7).is_absent());
        assert_eq!(engine.stats().resets(SEQ_SCAN), 1);
    }

    #[test]
    fn end_without_begin_is_discarded() {
        let script = Script::default();
        let mut engine = engine_with(&script, 8);

        engine.on_end(AGG, 2);
        assert_eq!(engine.stats().resets(AGG), 1);
    }

    #[test]
    fn mismatched_feature_payload_resets() {
        let script = Script::default();
        let mut engine = engine_with(&script, 8);

        engine.on_begin(SEQ_SCAN, 7);
        engine.on_features(SEQ_SCAN, 7, &[0u8; 3]);
        assert!(engine.key_state(SEQ_SCAN, 7).is_absent());
    }

    #[test]
    fn keys_do_not_collide_across_ous() {
        let script = Script::default();
        let mut engine = engine_with(&script, 8);

        engine.on_begin(SEQ_SCAN, 7);
        engine.on_begin(AGG, 7);
        assert!(engine.key_state(SEQ_SCAN, 7).running);
        assert!(engine.key_state(AGG, 7).running);
    }

    #[test]
    fn map_overflow_is_counted_against_its_ou() {
        let script = Script::default();
        let mut engine = engine_with(&script, 8);

        for plan_node_id in 0..(MAP_CAPACITY as i32 + 1) {
            engine.on_begin(SEQ_SCAN, plan_node_id);
        }
        assert_eq!(engine.stats().map_overflows(SEQ_SCAN), 1);
        assert_eq!(engine.stats().map_overflows(AGG), 0);
        assert_eq!(engine.stats().snapshot().map_overflows[SEQ_SCAN as usize], 1);
    }

    #[test]
    fn full_ring_drops_record() {
        let script = Script::default();
        let mut engine = engine_with(&script, 1);

        for plan_node_id in [1, 2] {
            engine.on_begin(SEQ_SCAN, plan_node_id);
            engine.on_end(SEQ_SCAN, plan_node_id);
            engine.on_features(SEQ_SCAN, plan_node_id, &seq_scan_features(plan_node_id, 1, 2));
            engine.on_flush(SEQ_SCAN, plan_node_id);
        }
        assert_eq!(engine.ring(SEQ_SCAN).unwrap().dropped(), 1);
        assert!(pop_record(&engine, SEQ_SCAN).is_some());
        assert!(pop_record(&engine, SEQ_SCAN).is_none());
    }
}
