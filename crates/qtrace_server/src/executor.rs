//! Query execution with the marker wrapper convention.
//!
//! Every executor node is wrapped by a thin outer function that fires
//! `<Exec>_begin` before real work and `<Exec>_end` after it, with a
//! features marker at a convenient emission point and a flush marker at
//! node teardown. Most nodes share the generic wrapper; the bitmap, hash,
//! hash-join, and subplan executors have nonstandard signatures and carry
//! their markers inline.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::instrument::{ElapsedTimer, Instrumentation, INSTRUMENT_TIMER};
use crate::marker::{MarkerId, TracepointFabric};
use crate::plan::{child_plan_node_id, NodeBody, NodeTag, PlanNode};
use crate::{marker, ServerShared};

/// Markers the postmaster fires for backend lifecycle tracking.
pub const POSTMASTER_MARKERS: [&str; 4] = [
    "postmaster_fork_backend",
    "postmaster_fork_background",
    "postmaster_reap_backend",
    "postmaster_reap_background",
];

/// Current wall time in microseconds since the Unix epoch.
pub fn unix_time_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Every marker name the server registers: four per operating unit plus the
/// postmaster lifecycle probes.
pub fn server_marker_names() -> Vec<String> {
    let mut names = Vec::new();
    for tag in NodeTag::ALL {
        let function = tag.exec_function();
        for suffix in ["begin", "end", "features", "flush"] {
            names.push(format!("{function}_{suffix}"));
        }
    }
    names.extend(POSTMASTER_MARKERS.iter().map(|name| name.to_string()));
    names
}

/// The four marker ids of one executor node type.
#[derive(Debug, Clone, Copy)]
pub struct NodeMarkers {
    pub begin: MarkerId,
    pub end: MarkerId,
    pub features: MarkerId,
    pub flush: MarkerId,
}

/// Marker ids resolved once per backend.
pub struct OuMarkers {
    map: HashMap<NodeTag, NodeMarkers>,
}

impl OuMarkers {
    pub fn resolve(fabric: &TracepointFabric) -> anyhow::Result<Self> {
        let mut map = HashMap::new();
        for tag in NodeTag::ALL {
            let function = tag.exec_function();
            let resolve = |suffix: &str| {
                fabric
                    .lookup(&format!("{function}_{suffix}"))
                    .ok_or_else(|| anyhow::anyhow!("marker {function}_{suffix} not registered"))
            };
            map.insert(
                tag,
                NodeMarkers {
                    begin: resolve("begin")?,
                    end: resolve("end")?,
                    features: resolve("features")?,
                    flush: resolve("flush")?,
                },
            );
        }
        Ok(Self { map })
    }

    pub fn get(&self, tag: NodeTag) -> NodeMarkers {
        self.map[&tag]
    }
}

/// One executor invocation's description: the plan plus runtime state that
/// lives and dies with the statement's query context.
pub struct QueryDesc {
    pub query_id: i64,
    pub generation: i32,
    pub query_text: String,
    pub params: Option<String>,
    pub plan: PlanNode,
    pub statement_start_ts: i64,
    pub instrument_options: u32,
    /// Result destination is an internal consumer (e.g. a SQL function);
    /// per-node capture is suppressed for these.
    pub dest_internal: bool,
    pub totaltime: Option<Arc<Instrumentation>>,
    /// Per-node instrumentation, keyed by plan node id.
    pub instruments: HashMap<i32, Arc<Instrumentation>>,
    features_emitted: HashSet<i32>,
}

impl QueryDesc {
    pub fn new(query_id: i64, generation: i32, query_text: &str, plan: PlanNode) -> Self {
        Self {
            query_id,
            generation,
            query_text: query_text.to_string(),
            params: None,
            plan,
            statement_start_ts: unix_time_us(),
            instrument_options: 0,
            dest_internal: false,
            totaltime: None,
            instruments: HashMap::new(),
            features_emitted: HashSet::new(),
        }
    }

    pub fn instrument(&self, plan_node_id: i32) -> Option<&Arc<Instrumentation>> {
        self.instruments.get(&plan_node_id)
    }
}

/// One executor frame pushed by the counter pipeline at executor start.
pub struct ExecFrame {
    pub statement_ts: i64,
    next_independent_id: i32,
    pub instrs: Vec<Arc<Instrumentation>>,
    pub persist_on_pop: bool,
}

impl ExecFrame {
    pub fn new(statement_ts: i64, persist_on_pop: bool) -> Self {
        Self {
            statement_ts,
            next_independent_id: crate::plan::INDEPENDENT_INSTR_ID_START,
            instrs: Vec::new(),
            persist_on_pop,
        }
    }

    /// Descending allocator for plan-independent instrumentation ids.
    pub fn alloc_independent_id(&mut self) -> i32 {
        let id = self.next_independent_id;
        self.next_independent_id -= 1;
        id
    }
}

/// Counter-pipeline state owned by the backend: a strict LIFO of frames
/// plus the active plan-independent instrumentation.
#[derive(Default)]
pub struct QssExecState {
    pub nesting_level: i32,
    pub frames: Vec<ExecFrame>,
    pub active: Option<Arc<Instrumentation>>,
}

impl QssExecState {
    pub fn top_mut(&mut self) -> Option<&mut ExecFrame> {
        self.frames.last_mut()
    }
}

/// Per-backend executor state. One backend is single-threaded within a
/// statement; everything here is owned by the backend's thread.
pub struct ExecutorContext {
    pub backend_pid: u32,
    pub fabric: Arc<TracepointFabric>,
    pub markers: Arc<OuMarkers>,
    /// Sampling gate: armed per execution, reset at teardown. All executor
    /// markers check this before firing.
    pub executor_running: bool,
    executor_depth: i32,
    rng: StdRng,
    pub qss: QssExecState,
}

impl ExecutorContext {
    pub fn new(server: &ServerShared, backend_pid: u32) -> anyhow::Result<Self> {
        Ok(Self {
            backend_pid,
            fabric: Arc::clone(&server.fabric),
            markers: Arc::new(OuMarkers::resolve(&server.fabric)?),
            executor_running: false,
            executor_depth: 0,
            rng: StdRng::from_entropy(),
            qss: QssExecState::default(),
        })
    }

    /// Arm the sampling gate for this execution with the configured
    /// probability. Called exactly once per outermost executor invocation;
    /// nothing else may assign the gate.
    fn executor_sample(&mut self, server: &ServerShared) {
        let snapshot = server.settings.snapshot();
        self.executor_running =
            snapshot.capture_enabled && self.rng.gen::<f64>() < snapshot.executor_sampling_rate;
    }
}

/// Host behavior when no executor-start hook is installed: attach plain
/// timing instrumentation when requested.
pub fn standard_executor_start(
    _ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    _eflags: u32,
) -> anyhow::Result<()> {
    if query_desc.instrument_options & INSTRUMENT_TIMER != 0 {
        let mut instruments = HashMap::new();
        query_desc.plan.walk(&mut |node| {
            instruments.insert(node.plan_node_id, Instrumentation::foreign(node.plan_node_id));
        });
        query_desc.instruments = instruments;
    }
    Ok(())
}

/// Host behavior when no executor-end hook is installed.
pub fn standard_executor_end(
    _ctx: &mut ExecutorContext,
    _query_desc: &mut QueryDesc,
) -> anyhow::Result<()> {
    Ok(())
}

/// Default EXPLAIN rendering: the query and its plan as one JSON object.
pub fn explain_query(query_desc: &QueryDesc) -> String {
    serde_json::json!({
        "query": query_desc.query_text,
        "plan": query_desc.plan,
    })
    .to_string()
}

/// EXPLAIN entry point: consult the hook chain, falling back to the
/// default rendering.
pub fn run_explain(server: &ServerShared, query_desc: &QueryDesc) -> String {
    let hook = server
        .hooks
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .explain_one_query
        .clone();
    match hook {
        Some(hook) => hook(query_desc),
        None => explain_query(query_desc),
    }
}

/// Invoke the registered clear hook after a failed statement, discarding
/// any frames the aborted execution left behind.
pub fn run_qss_clear(server: &ServerShared, ctx: &mut ExecutorContext) {
    let hook = server
        .hooks
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .qss_clear
        .clone();
    if let Some(hook) = hook {
        hook(ctx);
    }
}

/// Run one statement through the executor: sample the gate, run the
/// start/end hook chains, execute the plan, and fire teardown markers.
pub fn run_query(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    eflags: u32,
) -> anyhow::Result<u64> {
    let outermost = ctx.executor_depth == 0;
    if outermost {
        ctx.executor_sample(server);
    }
    ctx.executor_depth += 1;

    let start_hook = server
        .hooks
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .executor_start
        .clone();
    let started = match start_hook {
        Some(hook) => hook(ctx, query_desc, eflags),
        None => standard_executor_start(ctx, query_desc, eflags),
    };
    if let Err(err) = started {
        ctx.executor_depth -= 1;
        if outermost {
            ctx.executor_running = false;
        }
        return Err(err);
    }

    let rows = execute_plan(server, ctx, query_desc);

    let end_hook = server
        .hooks
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .executor_end
        .clone();
    let ended = match end_hook {
        Some(hook) => hook(ctx, query_desc),
        None => standard_executor_end(ctx, query_desc),
    };

    ctx.executor_depth -= 1;
    if outermost {
        ctx.executor_running = false;
    }
    ended?;
    Ok(rows)
}

fn execute_plan(server: &ServerShared, ctx: &mut ExecutorContext, query_desc: &mut QueryDesc) -> u64 {
    // The plan tree itself is read-only; execution state lives beside it.
    let plan = query_desc.plan.clone();
    let timer = ElapsedTimer::start();
    let rows = exec_node(server, ctx, query_desc, &plan);
    if let Some(totaltime) = &query_desc.totaltime {
        totaltime.add_elapsed(timer.stop());
    }

    // Node teardown: flush markers release the joined record per node.
    if ctx.executor_running {
        flush_markers(ctx, &plan);
    }
    rows
}

/// Teardown walk. Does not descend into SubPlan inputs: those ran (and
/// flushed) inside their own nested executor invocation.
fn flush_markers(ctx: &ExecutorContext, node: &PlanNode) {
    let markers = ctx.markers.get(node.tag());
    marker!(ctx.fabric, ctx.backend_pid, markers.flush, node.plan_node_id);
    if matches!(node.body, NodeBody::SubPlan { .. }) {
        return;
    }
    if let Some(left) = node.left() {
        flush_markers(ctx, left);
    }
    if let Some(right) = node.right() {
        flush_markers(ctx, right);
    }
}

fn exec_node(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
) -> u64 {
    match &node.body {
        // Nonstandard signatures: wrapped manually below.
        NodeBody::Hash { .. } => {
            let mut scratch = HashScratch::default();
            exec_hash(server, ctx, query_desc, node, &mut scratch)
        }
        NodeBody::HashJoin { .. } => exec_hash_join(server, ctx, query_desc, node),
        NodeBody::SubPlan { .. } => exec_sub_plan(server, ctx, query_desc, node),
        NodeBody::BitmapIndexScan { .. } => {
            let mut bitmap = Vec::new();
            exec_bitmap_index_scan(ctx, query_desc, node, &mut bitmap)
        }
        NodeBody::BitmapHeapScan { .. } => exec_bitmap_heap_scan(server, ctx, query_desc, node),
        _ => exec_wrapped(server, ctx, query_desc, node),
    }
}

/// The generic executor wrapper: begin marker, wrapped work, end marker.
fn exec_wrapped(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
) -> u64 {
    if ctx.executor_running {
        let markers = ctx.markers.get(node.tag());
        marker!(ctx.fabric, ctx.backend_pid, markers.begin, node.plan_node_id);
        let rows = exec_node_work(server, ctx, query_desc, node);
        marker!(ctx.fabric, ctx.backend_pid, markers.end, node.plan_node_id);
        return rows;
    }
    exec_node_work(server, ctx, query_desc, node)
}

/// Fire the features marker once per node per statement, scratch-copying
/// the feature payload.
fn emit_features(ctx: &mut ExecutorContext, query_desc: &mut QueryDesc, node: &PlanNode) {
    if !ctx.executor_running || !query_desc.features_emitted.insert(node.plan_node_id) {
        return;
    }
    let markers = ctx.markers.get(node.tag());
    if !ctx.fabric.is_enabled(markers.features) {
        return;
    }
    let mut payload = Vec::new();
    node.encode_features(query_desc.query_id, query_desc.statement_start_ts, &mut payload);
    let args = [
        node.plan_node_id as u64,
        query_desc.query_id as u64,
        payload.as_ptr() as u64,
        child_plan_node_id(node.left()) as u64,
        child_plan_node_id(node.right()) as u64,
        query_desc.statement_start_ts as u64,
    ];
    ctx.fabric
        .emit_with_payload(ctx.backend_pid, markers.features, &args, Some(&payload));
}

/// Cheap deterministic work standing in for tuple processing.
fn process_rows(rows: u64) -> u64 {
    let mut acc = 0u64;
    for i in 0..rows {
        acc = acc.wrapping_mul(31).wrapping_add(i ^ 0x9e37_79b9);
    }
    acc
}

fn clamp_rows(plan_rows: f64) -> u64 {
    plan_rows.max(1.0).min(50_000.0) as u64
}

/// Per-node work: features emission, node-local instrumentation timing, and
/// the tag-specific row processing.
fn exec_node_work(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
) -> u64 {
    emit_features(ctx, query_desc, node);
    let instr = query_desc.instrument(node.plan_node_id).cloned();
    let timer = instr.as_ref().map(|_| ElapsedTimer::start());

    let rows = exec_body(server, ctx, query_desc, node, instr.as_ref());

    if let (Some(instr), Some(timer)) = (&instr, timer) {
        instr.add_elapsed(timer.stop());
        instr.set_payload(rows as i64);
    }
    rows
}

fn exec_body(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
    instr: Option<&Arc<Instrumentation>>,
) -> u64 {
    match &node.body {
        NodeBody::SeqScan { .. } => {
            let rows = clamp_rows(node.plan_rows);
            process_rows(rows);
            crate::instrument::instrument_add_counter(instr, 0, rows as f64);
            crate::instrument::instrument_add_counter(
                instr,
                1,
                rows as f64 * f64::from(node.plan_width),
            );
            rows
        }
        NodeBody::IndexScan { .. } | NodeBody::IndexOnlyScan { .. } => {
            let rows = clamp_rows(node.plan_rows);
            process_rows(rows);
            crate::instrument::instrument_add_counter(instr, 0, rows as f64);
            crate::instrument::instrument_add_counter(instr, 2, node.startup_cost);
            rows
        }
        NodeBody::NestLoop { .. } => {
            let outer_rows = node
                .left()
                .map(|outer| exec_node(server, ctx, query_desc, outer))
                .unwrap_or(0);
            // Rescan the inner side once per outer batch; each rescan fires
            // its own begin/end pair and accumulates in the collector.
            let rescans = outer_rows.clamp(1, 3);
            let mut inner_rows = 0;
            if let Some(inner) = node.right() {
                for _ in 0..rescans {
                    inner_rows = exec_node(server, ctx, query_desc, inner);
                }
            }
            let rows = clamp_rows(node.plan_rows);
            crate::instrument::instrument_add_counter(instr, 0, rows as f64);
            crate::instrument::instrument_add_counter(instr, 3, (outer_rows + inner_rows) as f64);
            rows
        }
        NodeBody::Agg { num_groups, .. } => {
            let input_rows = node
                .left()
                .map(|child| exec_node(server, ctx, query_desc, child))
                .unwrap_or(0);
            process_rows(input_rows.min(1024));
            let rows = (*num_groups).max(1) as u64;
            crate::instrument::instrument_add_counter(instr, 0, rows as f64);
            crate::instrument::instrument_add_counter(instr, 1, input_rows as f64);
            rows
        }
        NodeBody::Sort { .. } => {
            let input_rows = node
                .left()
                .map(|child| exec_node(server, ctx, query_desc, child))
                .unwrap_or(0);
            process_rows(input_rows.min(4096));
            crate::instrument::instrument_add_counter(instr, 0, input_rows as f64);
            input_rows
        }
        NodeBody::Limit { limit_count, .. } => {
            let input_rows = node
                .left()
                .map(|child| exec_node(server, ctx, query_desc, child))
                .unwrap_or(0);
            let rows = input_rows.min((*limit_count).max(0) as u64);
            crate::instrument::instrument_add_counter(instr, 0, rows as f64);
            rows
        }
        NodeBody::LockRows { .. } => {
            let rows = node
                .left()
                .map(|child| exec_node(server, ctx, query_desc, child))
                .unwrap_or(0);
            crate::instrument::instrument_add_counter(instr, 0, rows as f64);
            rows
        }
        NodeBody::ModifyTable { .. } => {
            let rows = node
                .left()
                .map(|child| exec_node(server, ctx, query_desc, child))
                .unwrap_or(0);
            process_rows(rows.min(2048));
            crate::instrument::instrument_add_counter(instr, 0, rows as f64);
            // Row triggers run against the active instrumentation.
            let previous = ctx.qss.active.take();
            ctx.qss.active = instr.cloned();
            fire_row_triggers(ctx, rows);
            ctx.qss.active = previous;
            rows
        }
        NodeBody::Result => {
            let rows = clamp_rows(node.plan_rows);
            crate::instrument::instrument_add_counter(instr, 0, rows as f64);
            rows
        }
        // Manual-wrapper nodes never reach the generic body.
        NodeBody::Hash { .. }
        | NodeBody::HashJoin { .. }
        | NodeBody::SubPlan { .. }
        | NodeBody::BitmapIndexScan { .. }
        | NodeBody::BitmapHeapScan { .. } => 0,
    }
}

/// Trigger work charged to whatever instrumentation is active.
fn fire_row_triggers(ctx: &mut ExecutorContext, rows: u64) {
    if let Some(active) = &ctx.qss.active {
        active.add_counter(4, rows as f64);
    }
}

#[derive(Default)]
struct HashScratch {
    buckets: u64,
}

/// Hash build side. Takes the scratch table, so the generic wrapper does
/// not fit; markers are inlined.
fn exec_hash(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
    scratch: &mut HashScratch,
) -> u64 {
    let markers = ctx.markers.get(node.tag());
    let running = ctx.executor_running;
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.begin, node.plan_node_id);
    }
    emit_features(ctx, query_desc, node);
    let instr = query_desc.instrument(node.plan_node_id).cloned();
    let timer = instr.as_ref().map(|_| ElapsedTimer::start());
    let rows = node
        .left()
        .map(|child| exec_node(server, ctx, query_desc, child))
        .unwrap_or(0);
    scratch.buckets = rows.next_power_of_two();
    process_rows(scratch.buckets.min(4096));
    crate::instrument::instrument_add_counter(instr.as_ref(), 0, rows as f64);
    if let (Some(instr), Some(timer)) = (&instr, timer) {
        instr.add_elapsed(timer.stop());
    }
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.end, node.plan_node_id);
    }
    rows
}

/// Hash join: builds from the inner Hash node, then probes the outer side.
fn exec_hash_join(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
) -> u64 {
    let markers = ctx.markers.get(node.tag());
    let running = ctx.executor_running;
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.begin, node.plan_node_id);
    }
    emit_features(ctx, query_desc, node);
    let instr = query_desc.instrument(node.plan_node_id).cloned();
    let timer = instr.as_ref().map(|_| ElapsedTimer::start());

    let build_rows = node
        .right()
        .map(|build| exec_node(server, ctx, query_desc, build))
        .unwrap_or(0);
    let probe_rows = node
        .left()
        .map(|probe| exec_node(server, ctx, query_desc, probe))
        .unwrap_or(0);
    process_rows(probe_rows.min(4096));
    let rows = clamp_rows(node.plan_rows);
    crate::instrument::instrument_add_counter(instr.as_ref(), 0, rows as f64);
    crate::instrument::instrument_add_counter(instr.as_ref(), 3, (build_rows + probe_rows) as f64);

    if let (Some(instr), Some(timer)) = (&instr, timer) {
        instr.add_elapsed(timer.stop());
    }
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.end, node.plan_node_id);
    }
    rows
}

/// SubPlan runs its input as a nested executor invocation, the way a SQL
/// function would.
fn exec_sub_plan(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
) -> u64 {
    let markers = ctx.markers.get(node.tag());
    let running = ctx.executor_running;
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.begin, node.plan_node_id);
    }
    emit_features(ctx, query_desc, node);

    let rows = match node.left() {
        Some(inner) => {
            let plan_id = match &node.body {
                NodeBody::SubPlan { plan_id } => *plan_id,
                _ => 0,
            };
            let mut nested = QueryDesc::new(
                query_desc.query_id ^ i64::from(plan_id),
                query_desc.generation,
                &format!("{} [subplan {plan_id}]", query_desc.query_text),
                inner.clone(),
            );
            nested.dest_internal = true;
            match run_query(server, ctx, &mut nested, 0) {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(error = %err, "nested subplan execution failed");
                    0
                }
            }
        }
        None => 0,
    };

    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.end, node.plan_node_id);
    }
    rows
}

/// Bitmap index scan fills the caller's bitmap instead of returning tuples.
fn exec_bitmap_index_scan(
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
    bitmap: &mut Vec<u64>,
) -> u64 {
    let markers = ctx.markers.get(node.tag());
    let running = ctx.executor_running;
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.begin, node.plan_node_id);
    }
    emit_features(ctx, query_desc, node);
    let instr = query_desc.instrument(node.plan_node_id).cloned();
    let timer = instr.as_ref().map(|_| ElapsedTimer::start());

    let rows = clamp_rows(node.plan_rows);
    bitmap.extend((0..rows.min(1024)).map(|i| i * 64));
    crate::instrument::instrument_add_counter(instr.as_ref(), 0, rows as f64);

    if let (Some(instr), Some(timer)) = (&instr, timer) {
        instr.add_elapsed(timer.stop());
    }
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.end, node.plan_node_id);
    }
    rows
}

fn exec_bitmap_heap_scan(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    node: &PlanNode,
) -> u64 {
    let markers = ctx.markers.get(node.tag());
    let running = ctx.executor_running;
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.begin, node.plan_node_id);
    }
    emit_features(ctx, query_desc, node);
    let instr = query_desc.instrument(node.plan_node_id).cloned();
    let timer = instr.as_ref().map(|_| ElapsedTimer::start());

    let mut bitmap = Vec::new();
    if let Some(NodeBody::BitmapIndexScan { .. }) = node.left().map(|n| &n.body) {
        if let Some(index_node) = node.left() {
            exec_bitmap_index_scan(ctx, query_desc, index_node, &mut bitmap);
        }
    } else if let Some(child) = node.left() {
        exec_node(server, ctx, query_desc, child);
    }
    let rows = clamp_rows(node.plan_rows);
    process_rows(rows);
    crate::instrument::instrument_add_counter(instr.as_ref(), 0, rows as f64);
    crate::instrument::instrument_add_counter(instr.as_ref(), 1, bitmap.len() as f64);

    if let (Some(instr), Some(timer)) = (&instr, timer) {
        instr.add_elapsed(timer.stop());
    }
    if running {
        marker!(ctx.fabric, ctx.backend_pid, markers.end, node.plan_node_id);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::MarkerObserver;
    use std::sync::Mutex;

    struct Recorder {
        events: Mutex<Vec<(String, Vec<u64>, bool)>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _, _)| name.clone())
                .collect()
        }
    }

    struct RecorderObserver {
        recorder: Arc<Recorder>,
        fabric: Arc<TracepointFabric>,
    }

    impl MarkerObserver for RecorderObserver {
        fn marker(&self, _pid: u32, marker: MarkerId, args: &[u64], payload: Option<&[u8]>) {
            self.recorder.events.lock().unwrap().push((
                self.fabric.name(marker).unwrap_or("?").to_string(),
                args.to_vec(),
                payload.is_some(),
            ));
        }
    }

    fn server_with_recorder() -> (Arc<ServerShared>, Arc<Recorder>) {
        let server = ServerShared::new(1, 1000);
        let recorder = Recorder::new();
        server.fabric.set_observer(Arc::new(RecorderObserver {
            recorder: Arc::clone(&recorder),
            fabric: Arc::clone(&server.fabric),
        }));
        for name in server.fabric.marker_names().to_vec() {
            server.fabric.attach(&name);
        }
        server.settings.set_capture_enabled(true);
        (server, recorder)
    }

    fn seq_scan_plan() -> PlanNode {
        PlanNode {
            plan_node_id: 0,
            startup_cost: 0.0,
            total_cost: 10.0,
            plan_rows: 16.0,
            plan_width: 8,
            parallel_aware: false,
            qual_count: 0,
            body: NodeBody::SeqScan { scanrelid: 100 },
            lefttree: None,
            righttree: None,
        }
    }

    #[test]
    fn sampled_execution_fires_the_marker_protocol() {
        let (server, recorder) = server_with_recorder();
        let mut ctx = ExecutorContext::new(&server, 9).unwrap();
        let mut query = QueryDesc::new(42, 1, "select * from t", seq_scan_plan());
        run_query(&server, &mut ctx, &mut query, 0).unwrap();

        let names = recorder.names();
        assert_eq!(
            names,
            vec![
                "ExecSeqScan_begin",
                "ExecSeqScan_features",
                "ExecSeqScan_end",
                "ExecSeqScan_flush",
            ]
        );
        assert!(!ctx.executor_running, "gate resets at teardown");
    }

    #[test]
    fn zero_sampling_rate_fires_nothing() {
        let (server, recorder) = server_with_recorder();
        server.settings.set_executor_sampling_rate(0.0).unwrap();
        let mut ctx = ExecutorContext::new(&server, 9).unwrap();
        let mut query = QueryDesc::new(42, 1, "select * from t", seq_scan_plan());
        run_query(&server, &mut ctx, &mut query, 0).unwrap();
        assert!(recorder.names().is_empty());
    }

    #[test]
    fn disabled_capture_fires_nothing() {
        let (server, recorder) = server_with_recorder();
        server.settings.set_capture_enabled(false);
        let mut ctx = ExecutorContext::new(&server, 9).unwrap();
        let mut query = QueryDesc::new(42, 1, "select * from t", seq_scan_plan());
        run_query(&server, &mut ctx, &mut query, 0).unwrap();
        assert!(recorder.names().is_empty());
    }

    #[test]
    fn nestloop_rescans_emit_repeated_pairs_single_features() {
        let (server, recorder) = server_with_recorder();
        let mut builder = crate::planner::PlanBuilder::new();
        let rel = crate::planner::RelOptInfo {
            relid: 100,
            pages: 10,
            tuples: 4.0,
            indexlist: Vec::new(),
        };
        let outer = builder.seq_scan(&rel, 0);
        let inner = builder.seq_scan(&rel, 0);
        let join = builder.nest_loop(outer, inner);

        let mut ctx = ExecutorContext::new(&server, 9).unwrap();
        let mut query = QueryDesc::new(7, 1, "select ... join", join);
        run_query(&server, &mut ctx, &mut query, 0).unwrap();

        let names = recorder.names();
        let inner_begins = names.iter().filter(|n| *n == "ExecSeqScan_begin").count();
        // Outer scan once plus three inner rescans.
        assert_eq!(inner_begins, 4);
        let features = names.iter().filter(|n| *n == "ExecSeqScan_features").count();
        assert_eq!(features, 2, "features fire once per node");
        let flushes = names.iter().filter(|n| *n == "ExecSeqScan_flush").count();
        assert_eq!(flushes, 2);
    }

    #[test]
    fn instrumentation_timer_attaches_when_requested() {
        let (server, _recorder) = server_with_recorder();
        let mut ctx = ExecutorContext::new(&server, 9).unwrap();
        let mut query = QueryDesc::new(42, 1, "select * from t", seq_scan_plan());
        query.instrument_options |= INSTRUMENT_TIMER;
        run_query(&server, &mut ctx, &mut query, 0).unwrap();
        let instr = query.instrument(0).expect("instrumentation attached");
        assert!(instr.total_us() >= 0.0);
        assert_eq!(instr.payload(), 16);
    }
}
