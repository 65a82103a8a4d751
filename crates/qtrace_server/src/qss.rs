//! The in-server counter pipeline.
//!
//! Installs into the executor hook slots at module init: executor start
//! pushes a frame and swaps counter blocks into the plan tree, executor end
//! persists the plan and per-node counters into the internal tables (or
//! logs them as JSON), and the get-relation-info hook applies spoofed
//! statistics. Prior hook occupants are preserved and chained.

use std::sync::Arc;

use anyhow::Context;

use crate::config::Settings;
use crate::executor::{
    explain_query, standard_executor_end, standard_executor_start, ExecFrame, ExecutorContext,
    QueryDesc,
};
use crate::hooks::HookTable;
use crate::instrument::{Instrumentation, INSTRUMENT_TIMER};
use crate::plan::{CmdKind, NodeBody, NodeTag, PlanNode, INVALID_PLAN_ID};
use crate::spoof::SpoofList;
use crate::tables::{PlansRow, QssTables, StatsRow};
use crate::ServerShared;

/// Node tags whose instrumentation is replaced with counter blocks at
/// executor start.
const COUNTER_BLOCK_TAGS: [NodeTag; 8] = [
    NodeTag::IndexScan,
    NodeTag::IndexOnlyScan,
    NodeTag::ModifyTable,
    NodeTag::LockRows,
    NodeTag::NestLoop,
    NodeTag::Agg,
    NodeTag::BitmapIndexScan,
    NodeTag::BitmapHeapScan,
];

/// State shared by all of the pipeline's hook closures.
pub struct QssShared {
    pub settings: Arc<Settings>,
    pub tables: Arc<QssTables>,
    pub spoof: SpoofList,
    pub db_id: i32,
}

impl QssShared {
    pub fn new(settings: Arc<Settings>, tables: Arc<QssTables>, db_id: i32) -> Arc<Self> {
        Arc::new(Self {
            settings,
            tables,
            spoof: SpoofList::default(),
            db_id,
        })
    }
}

/// Installed-hook handle. Dropping it without `uninstall` leaves the hooks
/// in place for the process lifetime, like a loaded extension.
pub struct QssInstalled {
    server: Arc<ServerShared>,
    prev: HookTable,
}

impl QssInstalled {
    /// Restore the prior hook occupants.
    pub fn uninstall(self) {
        *self
            .server
            .hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = self.prev;
    }
}

/// Register the pipeline into the server's hook table, preserving and
/// chaining whatever was installed before.
pub fn install(server: &Arc<ServerShared>, shared: Arc<QssShared>) -> QssInstalled {
    let mut hooks = server
        .hooks
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let prev = hooks.clone();

    {
        let shared = Arc::clone(&shared);
        let prev_start = prev.executor_start.clone();
        hooks.executor_start = Some(Arc::new(move |ctx, query_desc, eflags| {
            qss_executor_start(&shared, prev_start.as_deref(), ctx, query_desc, eflags)
        }));
    }
    {
        let shared = Arc::clone(&shared);
        let prev_end = prev.executor_end.clone();
        hooks.executor_end = Some(Arc::new(move |ctx, query_desc| {
            qss_executor_end(&shared, prev_end.as_deref(), ctx, query_desc)
        }));
    }
    {
        let shared = Arc::clone(&shared);
        hooks.alloc_instrumentation = Some(Arc::new(move |ctx, ou| {
            qss_alloc_instrumentation(&shared, ctx, ou)
        }));
    }
    hooks.qss_clear = Some(Arc::new(|ctx| {
        ctx.qss.frames.clear();
        ctx.qss.active = None;
        ctx.qss.nesting_level = 0;
    }));
    {
        let shared = Arc::clone(&shared);
        let prev_rel_info = prev.get_relation_info.clone();
        hooks.get_relation_info = Some(Arc::new(move |root, rel_oid, inhparent, rel| {
            // Let any earlier hook edit first, then apply spoofed entries.
            if let Some(prev) = &prev_rel_info {
                prev(root, rel_oid, inhparent, rel);
            }
            shared.spoof.apply(rel_oid, rel);
        }));
    }
    {
        let shared = Arc::clone(&shared);
        hooks.explain_one_query = Some(Arc::new(move |query_desc| {
            qss_explain_one_query(&shared, query_desc)
        }));
    }
    drop(hooks);

    QssInstalled {
        server: Arc::clone(server),
        prev,
    }
}

/// Allocate a counter block in the current frame; null when disabled or
/// before the first executor start.
pub fn alloc_counters(
    server: &ServerShared,
    ctx: &mut ExecutorContext,
    ou: &str,
) -> Option<Arc<Instrumentation>> {
    let snapshot = server.settings.snapshot();
    if !snapshot.capture_enabled || !snapshot.capture_exec_stats || !snapshot.output_noisepage {
        return None;
    }
    let hook = server
        .hooks
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .alloc_instrumentation
        .clone();
    hook.and_then(|hook| hook(ctx, ou))
}

/// Null-safe increment against the active plan-independent instrumentation.
pub fn active_add_counter(server: &ServerShared, ctx: &ExecutorContext, index: usize, value: f64) {
    if !server.settings.snapshot().capture_exec_stats {
        return;
    }
    if let Some(active) = &ctx.qss.active {
        active.add_counter(index, value);
    }
}

fn qss_alloc_instrumentation(
    shared: &QssShared,
    ctx: &mut ExecutorContext,
    ou: &str,
) -> Option<Arc<Instrumentation>> {
    let snapshot = shared.settings.snapshot();
    if !snapshot.capture_enabled || !snapshot.capture_exec_stats || !snapshot.output_noisepage {
        return None;
    }
    // No executor start yet: nowhere to charge the block.
    let frame = ctx.qss.frames.last_mut()?;
    let id = frame.alloc_independent_id();
    let block = Instrumentation::counter_block(id, Some(ou));
    frame.instrs.push(Arc::clone(&block));
    Some(block)
}

fn need_instrument(shared: &QssShared, top_level_ok: bool, query_desc: &QueryDesc) -> bool {
    let snapshot = shared.settings.snapshot();
    snapshot.capture_enabled
        && snapshot.capture_exec_stats
        && top_level_ok
        && query_desc.generation >= 0
        && !query_desc.dest_internal
}

fn qss_executor_start(
    shared: &QssShared,
    prev: Option<&(dyn Fn(&mut ExecutorContext, &mut QueryDesc, u32) -> anyhow::Result<()> + Send + Sync)>,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
    eflags: u32,
) -> anyhow::Result<()> {
    ctx.qss.nesting_level += 1;
    let snapshot = shared.settings.snapshot();
    let top_level_ok = snapshot.capture_nested || ctx.qss.nesting_level == 1;
    let need_total = snapshot.capture_enabled && snapshot.capture_query_runtime && top_level_ok;
    let need_instrument = need_instrument(shared, top_level_ok, query_desc);

    if need_instrument {
        query_desc.instrument_options |= INSTRUMENT_TIMER;
    }

    // Initialize the plan.
    match prev {
        Some(prev) => prev(ctx, query_desc, eflags)?,
        None => standard_executor_start(ctx, query_desc, eflags)?,
    }

    // The frame records the decision taken now; flipping capture_nested
    // mid-statement does not change the fate of frames already pushed.
    ctx.qss
        .frames
        .push(ExecFrame::new(query_desc.statement_start_ts, top_level_ok));

    if need_instrument {
        let mut blocks = Vec::new();
        query_desc.plan.walk(&mut |node| {
            if COUNTER_BLOCK_TAGS.contains(&node.tag()) {
                blocks.push((
                    node.plan_node_id,
                    Instrumentation::counter_block(node.plan_node_id, None),
                ));
            }
        });
        for (plan_node_id, block) in blocks {
            query_desc.instruments.insert(plan_node_id, block);
        }
    }

    if need_total && query_desc.totaltime.is_none() {
        query_desc.totaltime = Some(Instrumentation::foreign(INVALID_PLAN_ID));
    }
    Ok(())
}

fn qss_executor_end(
    shared: &QssShared,
    prev: Option<&(dyn Fn(&mut ExecutorContext, &mut QueryDesc) -> anyhow::Result<()> + Send + Sync)>,
    ctx: &mut ExecutorContext,
    query_desc: &mut QueryDesc,
) -> anyhow::Result<()> {
    let snapshot = shared.settings.snapshot();
    let persist_frame = ctx
        .qss
        .frames
        .last()
        .map(|frame| frame.persist_on_pop)
        .unwrap_or(false);
    let instrument = need_instrument(shared, persist_frame, query_desc);

    let persisted = if snapshot.capture_enabled
        && persist_frame
        && query_desc.totaltime.is_some()
        && !ctx.qss.frames.is_empty()
    {
        if snapshot.output_noisepage {
            process_query_internal_table(shared, ctx, query_desc, instrument)
        } else {
            process_query_explain(shared, ctx, query_desc, instrument);
            Ok(())
        }
    } else {
        Ok(())
    };

    // The frame pops even when persistence failed; the query context it
    // charged is being torn down either way.
    ctx.qss.frames.pop();

    let chained = match prev {
        Some(prev) => prev(ctx, query_desc),
        None => standard_executor_end(ctx, query_desc),
    };
    ctx.qss.nesting_level -= 1;

    persisted?;
    chained
}

fn stats_comment(node: Option<&PlanNode>, instr: &Instrumentation) -> String {
    match node {
        Some(node) => match &node.body {
            NodeBody::ModifyTable { operation, .. } => match operation {
                CmdKind::Insert => "ModifyTableInsert".to_string(),
                CmdKind::Update => "ModifyTableUpdate".to_string(),
                CmdKind::Delete => "ModifyTableDelete".to_string(),
            },
            _ => node.tag().node_name().to_string(),
        },
        None => instr.ou().unwrap_or("").to_string(),
    }
}

fn write_instrumentation(
    shared: &QssShared,
    query_desc: &QueryDesc,
    backend_pid: u32,
    timestamp: i64,
    node: Option<&PlanNode>,
    instr: &Instrumentation,
) -> anyhow::Result<()> {
    // Downcast discipline: counters only flow out of signature-checked
    // blocks, so foreign instrumentation contributes timing alone.
    let mut counters = [0.0f64; 10];
    if instr.is_counter_block() {
        for (index, slot) in counters.iter_mut().enumerate() {
            *slot = instr.counter(index);
        }
    }
    let row = StatsRow {
        query_id: query_desc.query_id,
        db_id: shared.db_id,
        pid: backend_pid as i32,
        timestamp,
        plan_node_id: node.map(|n| n.plan_node_id).unwrap_or(instr.plan_node_id()),
        elapsed_us: instr.total_us(),
        counters,
        payload: instr.payload(),
        comment: Some(stats_comment(node, instr)),
    };
    shared.tables.append_stat(&row)
}

fn write_plan_instrumentation(
    shared: &QssShared,
    query_desc: &QueryDesc,
    backend_pid: u32,
    timestamp: i64,
    node: &PlanNode,
) -> anyhow::Result<()> {
    if let Some(instr) = query_desc.instrument(node.plan_node_id) {
        write_instrumentation(shared, query_desc, backend_pid, timestamp, Some(node), instr)?;
    }
    if let Some(left) = node.left() {
        write_plan_instrumentation(shared, query_desc, backend_pid, timestamp, left)?;
    }
    if let Some(right) = node.right() {
        write_plan_instrumentation(shared, query_desc, backend_pid, timestamp, right)?;
    }
    Ok(())
}

fn process_query_internal_table(
    shared: &QssShared,
    ctx: &ExecutorContext,
    query_desc: &QueryDesc,
    instrument: bool,
) -> anyhow::Result<()> {
    let Some(frame) = ctx.qss.frames.last() else {
        return Ok(());
    };
    let backend_pid = ctx.backend_pid;

    // Format the plan text once, then upsert under the pkey existence check.
    let features_text = explain_query(query_desc);
    shared
        .tables
        .upsert_plan(&PlansRow {
            query_id: query_desc.query_id,
            generation: query_desc.generation,
            db_id: shared.db_id,
            pid: backend_pid as i32,
            timestamp: frame.statement_ts,
            features_text,
        })
        .context("persist plan row")?;

    if let Some(totaltime) = &query_desc.totaltime {
        shared
            .tables
            .append_stat(&StatsRow {
                query_id: query_desc.query_id,
                db_id: shared.db_id,
                pid: backend_pid as i32,
                timestamp: frame.statement_ts,
                plan_node_id: INVALID_PLAN_ID,
                elapsed_us: totaltime.total_us(),
                counters: [0.0; 10],
                payload: 0,
                comment: query_desc.params.clone(),
            })
            .context("persist whole-query stats row")?;
    }

    if instrument {
        for instr in &frame.instrs {
            write_instrumentation(shared, query_desc, backend_pid, frame.statement_ts, None, instr)
                .context("persist independent counter block")?;
        }
        write_plan_instrumentation(
            shared,
            query_desc,
            backend_pid,
            frame.statement_ts,
            &query_desc.plan,
        )
        .context("persist plan counter blocks")?;
    }
    Ok(())
}

fn qss_explain_one_query(shared: &QssShared, query_desc: &QueryDesc) -> String {
    serde_json::json!({
        "query": query_desc.query_text,
        "generation": query_desc.generation,
        "db_id": shared.db_id,
        "plan": query_desc.plan,
    })
    .to_string()
}

fn process_query_explain(
    shared: &QssShared,
    ctx: &ExecutorContext,
    query_desc: &QueryDesc,
    instrument: bool,
) {
    let start_time = ctx
        .qss
        .frames
        .last()
        .map(|frame| frame.statement_ts)
        .unwrap_or(0);
    let elapsed_us = query_desc
        .totaltime
        .as_ref()
        .map(|tt| tt.total_us())
        .unwrap_or(0.0);
    let output = serde_json::json!({
        "query": query_desc.query_text,
        "start_time": start_time,
        "elapsed_us": elapsed_us,
        "analyze": instrument,
        "generation": query_desc.generation,
        "db_id": shared.db_id,
        "plan": query_desc.plan,
    });
    tracing::info!(target: "qss", "{output}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{run_query, ExecutorContext, QueryDesc};
    use crate::planner::{PlanBuilder, RelOptInfo};
    use crate::ServerShared;

    fn test_server(dir: &std::path::Path) -> (Arc<ServerShared>, Arc<QssShared>, QssInstalled) {
        let server = ServerShared::new(1, 1000);
        let keyspace = fjall::Config::new(dir).open().expect("open keyspace");
        let tables = Arc::new(QssTables::open(&keyspace).expect("open tables"));
        let shared = QssShared::new(Arc::clone(&server.settings), tables, 1);
        let installed = install(&server, Arc::clone(&shared));
        server.settings.set_capture_enabled(true);
        server.settings.set_capture_exec_stats(true);
        server.settings.set_capture_query_runtime(true);
        server.settings.set_output_noisepage(true);
        (server, shared, installed)
    }

    fn rel(tuples: f64) -> RelOptInfo {
        RelOptInfo {
            relid: 100,
            pages: 10,
            tuples,
            indexlist: Vec::new(),
        }
    }

    fn scan_query(query_id: i64, generation: i32) -> QueryDesc {
        let mut builder = PlanBuilder::new();
        let plan = builder.seq_scan(&rel(64.0), 0);
        QueryDesc::new(query_id, generation, "select * from t", plan)
    }

    #[test]
    fn repeated_execution_upserts_one_plan_row() {
        let dir = tempfile::tempdir().unwrap();
        let (server, shared, _installed) = test_server(dir.path());
        let mut ctx = ExecutorContext::new(&server, 7).unwrap();

        for _ in 0..2 {
            let mut query = scan_query(9, 1);
            run_query(&server, &mut ctx, &mut query, 0).unwrap();
        }

        let plans = shared.tables.scan_plans().unwrap();
        assert_eq!(plans.len(), 1, "second execution must not duplicate");
        let stats = shared.tables.scan_stats().unwrap();
        let whole_query_rows = stats
            .iter()
            .filter(|row| row.plan_node_id == INVALID_PLAN_ID)
            .count();
        assert_eq!(whole_query_rows, 2, "one stats row per execution");
    }

    #[test]
    fn new_generation_gets_its_own_plan_row() {
        let dir = tempfile::tempdir().unwrap();
        let (server, shared, _installed) = test_server(dir.path());
        let mut ctx = ExecutorContext::new(&server, 7).unwrap();

        for generation in [1, 2] {
            let mut query = scan_query(9, generation);
            run_query(&server, &mut ctx, &mut query, 0).unwrap();
        }
        assert_eq!(shared.tables.scan_plans().unwrap().len(), 2);
    }

    #[test]
    fn disabled_master_gate_produces_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (server, shared, _installed) = test_server(dir.path());
        server.settings.set_capture_enabled(false);
        let mut ctx = ExecutorContext::new(&server, 7).unwrap();

        let mut query = scan_query(9, 1);
        run_query(&server, &mut ctx, &mut query, 0).unwrap();

        assert!(shared.tables.scan_plans().unwrap().is_empty());
        assert!(shared.tables.scan_stats().unwrap().is_empty());
        assert!(alloc_counters(&server, &mut ctx, "TriggerFire").is_none());
    }

    #[test]
    fn counter_blocks_attach_for_documented_tags_only() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _shared, _installed) = test_server(dir.path());
        let mut ctx = ExecutorContext::new(&server, 7).unwrap();

        let mut builder = PlanBuilder::new();
        let input = builder.seq_scan(&rel(32.0), 0);
        let plan = builder.agg(input, 4);
        let mut query = QueryDesc::new(11, 1, "select count(*)", plan);
        run_query(&server, &mut ctx, &mut query, 0).unwrap();

        let agg_id = query.plan.plan_node_id;
        let scan_id = query.plan.left().unwrap().plan_node_id;
        assert!(query.instrument(agg_id).unwrap().is_counter_block());
        assert!(!query.instrument(scan_id).unwrap().is_counter_block());
    }

    #[test]
    fn independent_ids_descend_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _shared, _installed) = test_server(dir.path());
        let mut ctx = ExecutorContext::new(&server, 7).unwrap();

        // Executor start must have run before counters can be allocated.
        assert!(alloc_counters(&server, &mut ctx, "early").is_none());

        ctx.qss.frames.push(ExecFrame::new(0, true));
        let first = alloc_counters(&server, &mut ctx, "TriggerFire").unwrap();
        let second = alloc_counters(&server, &mut ctx, "TriggerFire").unwrap();
        assert_eq!(first.plan_node_id(), crate::plan::INDEPENDENT_INSTR_ID_START);
        assert_eq!(second.plan_node_id(), crate::plan::INDEPENDENT_INSTR_ID_START - 1);
        assert_eq!(ctx.qss.frames.last().unwrap().instrs.len(), 2);
    }

    #[test]
    fn frames_nest_strictly_and_nested_capture_is_gated() {
        let dir = tempfile::tempdir().unwrap();
        let (server, shared, _installed) = test_server(dir.path());
        server.settings.set_capture_nested(false);
        let mut ctx = ExecutorContext::new(&server, 7).unwrap();

        // SubPlan runs its input as a nested executor invocation.
        let mut builder = PlanBuilder::new();
        let inner = builder.seq_scan(&rel(8.0), 0);
        let plan = builder.subplan(inner, 1);
        let mut query = QueryDesc::new(21, 1, "select (select ...)", plan);
        run_query(&server, &mut ctx, &mut query, 0).unwrap();

        assert!(ctx.qss.frames.is_empty(), "all frames popped");
        assert_eq!(ctx.qss.nesting_level, 0);
        let plans = shared.tables.scan_plans().unwrap();
        assert_eq!(plans.len(), 1, "nested statement does not persist");
        assert_eq!(plans[0].query_id, 21);

        server.settings.set_capture_nested(true);
        let mut builder = PlanBuilder::new();
        let inner = builder.seq_scan(&rel(8.0), 0);
        let plan = builder.subplan(inner, 1);
        let mut query = QueryDesc::new(22, 1, "select (select ...)", plan);
        run_query(&server, &mut ctx, &mut query, 0).unwrap();
        let plans = shared.tables.scan_plans().unwrap();
        // Outer and nested rows both persist now.
        assert_eq!(plans.len(), 3);
    }

    #[test]
    fn explain_hook_reports_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (server, _shared, _installed) = test_server(dir.path());
        let query = scan_query(5, 3);
        let text = crate::executor::run_explain(&server, &query);
        assert!(text.contains("\"generation\":3"));
        assert!(text.contains("\"plan\""));
    }

    #[test]
    fn uninstall_restores_prior_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let server = ServerShared::new(1, 1000);
        let keyspace = fjall::Config::new(dir.path()).open().unwrap();
        let tables = Arc::new(QssTables::open(&keyspace).unwrap());
        let shared = QssShared::new(Arc::clone(&server.settings), tables, 1);
        let installed = install(&server, shared);
        assert!(server.hooks.read().unwrap().executor_start.is_some());
        installed.uninstall();
        assert!(server.hooks.read().unwrap().executor_start.is_none());
    }

    #[test]
    fn spoofed_stats_flow_through_relation_info() {
        let dir = tempfile::tempdir().unwrap();
        let (server, shared, _installed) = test_server(dir.path());
        server.catalog.register_table(100, "orders", 50, 10_000.0);

        let root = crate::planner::PlannerRoot { query_id: 1 };
        let baseline = crate::planner::get_relation_info(&server, &root, 100, false);
        assert_eq!(baseline.tuples, 10_000.0);

        shared.spoof.install_stats(100, 1_000_000, 5e8, 0);
        let spoofed = crate::planner::get_relation_info(&server, &root, 100, false);
        assert_eq!(spoofed.pages, 1_000_000);
        assert_eq!(spoofed.tuples, 5e8);

        shared.spoof.clear_stats();
        let cleared = crate::planner::get_relation_info(&server, &root, 100, false);
        assert_eq!(cleared.tuples, 10_000.0);
    }
}
