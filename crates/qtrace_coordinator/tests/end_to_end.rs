//! Full-pipeline test: an in-process node streams markers over its probe
//! socket, the coordinator attaches, routes records, and writes CSVs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use qtrace_coordinator::attach::{AttachConfig, Coordinator};
use qtrace_coordinator::decls;
use qtrace_coordinator::sink::SinkSet;
use qtrace_server::bus::socket_path;
use qtrace_server::node::{run_node_with_shutdown, NodeArgs};
use qtrace_server::plan::OU_DECLARATIONS;
use qtrace_server::tables::QssTables;

fn node_args(data_dir: &std::path::Path, runtime_dir: &std::path::Path) -> NodeArgs {
    NodeArgs {
        data_dir: data_dir.to_str().expect("utf8 path").to_string(),
        runtime_dir: runtime_dir.to_str().expect("utf8 path").to_string(),
        backends: 2,
        statements: 0,
        statement_pause_ms: 1,
        sampling_rate: 1.0,
        capture: true,
        capture_exec_stats: true,
        capture_query_runtime: true,
        capture_nested: false,
        output_noisepage: true,
        db_id: 1,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn collects_training_data_end_to_end() {
    let data_dir = tempfile::tempdir().expect("data dir");
    let runtime_dir = tempfile::tempdir().expect("runtime dir");
    let outdir = tempfile::tempdir().expect("outdir");

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let args = node_args(data_dir.path(), runtime_dir.path());
    let server = tokio::spawn(run_node_with_shutdown(args, async move {
        let _ = stop_rx.await;
    }));

    // The node shares this process; its socket is named after our pid.
    let postmaster_pid = std::process::id();
    let socket = socket_path(runtime_dir.path(), postmaster_pid);
    let deadline = Instant::now() + Duration::from_secs(20);
    while !socket.exists() {
        assert!(Instant::now() < deadline, "probe socket never appeared");
        assert!(!server.is_finished(), "node exited early");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let schema = Arc::new(decls::build_schema(OU_DECLARATIONS).expect("schema"));
    let sinks = Arc::new(SinkSet::create(outdir.path(), &schema).expect("sinks"));

    let config = AttachConfig {
        postmaster_pid,
        runtime_dir: runtime_dir.path().to_path_buf(),
        read_timeout: Duration::from_millis(100),
    };
    let attach_schema = Arc::clone(&schema);
    let attach_sinks = Arc::clone(&sinks);
    let coordinator = tokio::task::spawn_blocking(move || {
        Coordinator::attach(attach_schema, attach_sinks, &config)
    })
    .await
    .expect("attach task")
    .expect("attach");

    let shutdown = Arc::new(AtomicBool::new(false));
    let runner_shutdown = Arc::clone(&shutdown);
    let runner = tokio::task::spawn_blocking(move || {
        let mut coordinator = coordinator;
        let result = coordinator.run(&runner_shutdown);
        coordinator.shutdown();
        result
    });

    // Let the workload produce a few rotations of every statement shape.
    tokio::time::sleep(Duration::from_secs(3)).await;
    shutdown.store(true, Ordering::Relaxed);
    runner.await.expect("runner task").expect("run");
    sinks.close_all().expect("close sinks");

    let _ = stop_tx.send(());
    server.await.expect("server task").expect("server run");

    // Per-OU CSVs: header plus at least one seq-scan record.
    let seq_csv =
        std::fs::read_to_string(outdir.path().join("ExecSeqScan.csv")).expect("seq scan csv");
    let lines: Vec<&str> = seq_csv.lines().collect();
    assert!(
        lines.len() >= 2,
        "expected seq scan records, got: {seq_csv:?}"
    );
    assert!(lines[0].starts_with("query_id,SeqScan_scan_plan_plan_node_id"));
    assert!(lines[0].ends_with(",cpu_id,pid"));
    let header_columns = lines[0].split(',').count();
    for row in &lines[1..] {
        assert_eq!(row.split(',').count(), header_columns, "ragged row: {row}");
    }
    // The workload's plain seq scan is query 9000 against relation 100.
    assert!(
        lines[1..]
            .iter()
            .any(|row| row.starts_with("9000,") && row.contains(",100,")),
        "no record for the plain seq scan statement"
    );

    // Every OU file exists with its header, even if quiet OUs stayed empty.
    for ou in &schema.ous {
        let path = outdir.path().join(format!("{}.csv", ou.name));
        assert!(path.exists(), "missing sink file for {}", ou.name);
    }

    // The in-server pipeline persisted plans and stats rows of its own.
    let keyspace = fjall::Config::new(data_dir.path().join("storage"))
        .open()
        .expect("reopen keyspace");
    let tables = QssTables::open(&keyspace).expect("reopen tables");
    let plans = tables.scan_plans().expect("scan plans");
    assert!(!plans.is_empty(), "plans table stayed empty");
    assert!(plans.iter().any(|row| row.query_id == 9_000));
    let stats = tables.scan_stats().expect("scan stats");
    assert!(stats.iter().any(|row| row.plan_node_id == -1));
    // Plans upsert stays idempotent across repeated executions.
    let mut keys: Vec<(i64, i32, i32, i32)> = plans
        .iter()
        .map(|row| (row.query_id, row.generation, row.db_id, row.pid))
        .collect();
    keys.sort_unstable();
    let before = keys.len();
    keys.dedup();
    assert_eq!(before, keys.len(), "duplicate plans primary keys");
}
