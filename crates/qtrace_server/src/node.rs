//! The `qtrace-server` node runtime.
//!
//! Wires together the catalog tables, the counter pipeline, the tracepoint
//! fabric, and the probe transport, then runs the synthetic workload on a
//! set of backend worker threads. Each backend models one single-threaded
//! server process; the postmaster fires fork/reap lifecycle markers as
//! backends come and go.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use crate::bus::{socket_path, BackendDirectory, BackendInfo, ProbeBusListener};
use crate::executor::{run_query, ExecutorContext};
use crate::qss::{self, QssShared};
use crate::tables::QssTables;
use crate::{marker, workload, ServerShared};

/// Synthetic backend pids live far from real pid ranges.
const BACKEND_PID_BASE: u32 = 10_000;
/// Synthetic client socket fds reported in fork events.
const BACKEND_SOCKET_FD_BASE: i32 = 40;

/// CLI options for running a node.
#[derive(Parser, Debug)]
pub struct NodeArgs {
    /// Data directory for the internal catalog tables.
    #[arg(long)]
    pub data_dir: String,

    /// Directory for the probe socket.
    #[arg(long, env = "QTRACE_RUNTIME_DIR", default_value = "/tmp")]
    pub runtime_dir: String,

    /// Number of backend worker threads.
    #[arg(long, default_value_t = 2)]
    pub backends: usize,

    /// Statements per backend; 0 runs until shutdown.
    #[arg(long, default_value_t = 0)]
    pub statements: u64,

    /// Pause between statements, in milliseconds.
    #[arg(long, default_value_t = 5)]
    pub statement_pause_ms: u64,

    /// Per-statement probability of arming the executor markers.
    #[arg(long, env = "QTRACE_SAMPLING_RATE", default_value_t = 1.0)]
    pub sampling_rate: f64,

    /// Master capture gate.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
    pub capture: bool,

    /// Counter allocation and per-node persistence.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
    pub capture_exec_stats: bool,

    /// Whole-query elapsed-time capture.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
    pub capture_query_runtime: bool,

    /// Persist nested executor frames too.
    #[arg(long, default_value_t = false, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
    pub capture_nested: bool,

    /// Internal-table output versus JSON-to-log output.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, value_parser = clap::value_parser!(bool))]
    pub output_noisepage: bool,

    #[arg(long, default_value_t = 1)]
    pub db_id: i32,
}

/// Run a node until Ctrl-C.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Run a node until `shutdown` resolves. Backends given a finite statement
/// count idle once it is spent; the node stays up for late collectors.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send,
{
    let postmaster_pid = std::process::id();
    let server = ServerShared::new(args.db_id, postmaster_pid);
    server
        .settings
        .set_executor_sampling_rate(args.sampling_rate)
        .context("invalid sampling rate")?;
    server.settings.set_capture_enabled(args.capture);
    server.settings.set_capture_exec_stats(args.capture_exec_stats);
    server
        .settings
        .set_capture_query_runtime(args.capture_query_runtime);
    server.settings.set_capture_nested(args.capture_nested);
    server.settings.set_output_noisepage(args.output_noisepage);

    workload::register_demo_catalog(&server);

    let data_dir = PathBuf::from(&args.data_dir);
    std::fs::create_dir_all(&data_dir).context("create data dir")?;
    let keyspace = fjall::Config::new(data_dir.join("storage"))
        .open()
        .context("open keyspace")?;
    let tables = Arc::new(QssTables::open(&keyspace)?);
    let qss_shared = QssShared::new(Arc::clone(&server.settings), tables, args.db_id);
    let _installed = qss::install(&server, qss_shared);

    let backends = Arc::new(BackendDirectory::default());
    let listener = ProbeBusListener::start(
        Arc::clone(&server),
        Arc::clone(&backends),
        socket_path(Path::new(&args.runtime_dir), postmaster_pid),
    )?;
    tracing::info!(
        pid = postmaster_pid,
        socket = %listener.path().display(),
        backends = args.backends,
        "qtrace server ready"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let fork_marker = server
        .fabric
        .lookup("postmaster_fork_backend")
        .context("fork marker registered")?;
    let reap_marker = server
        .fabric
        .lookup("postmaster_reap_backend")
        .context("reap marker registered")?;

    let mut workers: Vec<(u32, JoinHandle<()>)> = Vec::new();
    for index in 0..args.backends.max(1) {
        let backend_pid = BACKEND_PID_BASE + index as u32;
        let socket_fd = BACKEND_SOCKET_FD_BASE + index as i32;
        backends.register(BackendInfo {
            pid: backend_pid,
            socket_fd,
            background: false,
        });
        marker!(server.fabric, postmaster_pid, fork_marker, backend_pid, socket_fd);

        let worker_server = Arc::clone(&server);
        let worker_stop = Arc::clone(&stop);
        let statements = args.statements;
        let pause = Duration::from_millis(args.statement_pause_ms);
        let handle = std::thread::Builder::new()
            .name(format!("backend-{backend_pid}"))
            .spawn(move || backend_main(worker_server, backend_pid, statements, pause, worker_stop))
            .context("spawn backend thread")?;
        workers.push((backend_pid, handle));
    }

    shutdown.await;
    tracing::info!("qtrace server shutting down");
    stop.store(true, Ordering::Relaxed);

    let reap_server = Arc::clone(&server);
    let reap_backends = Arc::clone(&backends);
    tokio::task::spawn_blocking(move || {
        for (backend_pid, handle) in workers {
            if handle.join().is_err() {
                tracing::warn!(backend_pid, "backend thread panicked");
            }
            reap_backends.unregister(backend_pid);
            marker!(reap_server.fabric, reap_server.postmaster_pid, reap_marker, backend_pid);
        }
    })
    .await
    .context("join backend threads")?;

    listener.shutdown();
    Ok(())
}

fn backend_main(
    server: Arc<ServerShared>,
    backend_pid: u32,
    statements: u64,
    pause: Duration,
    stop: Arc<AtomicBool>,
) {
    let mut ctx = match ExecutorContext::new(&server, backend_pid) {
        Ok(ctx) => ctx,
        Err(err) => {
            tracing::error!(backend_pid, error = %err, "backend init failed");
            return;
        }
    };
    let mut seq = 0u64;
    while !stop.load(Ordering::Relaxed) {
        if statements != 0 && seq >= statements {
            break;
        }
        let mut query = workload::build_statement(&server, seq);
        if let Err(err) = run_query(&server, &mut ctx, &mut query, 0) {
            tracing::warn!(backend_pid, query_id = query.query_id, error = %err, "statement failed");
            // Aborted executions drop whatever frames they left behind.
            crate::executor::run_qss_clear(&server, &mut ctx);
        }
        seq += 1;
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
    }
    tracing::info!(backend_pid, statements = seq, "backend finished");
}
