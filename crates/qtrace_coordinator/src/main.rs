use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use qtrace_coordinator::attach::{AttachConfig, Coordinator};
use qtrace_coordinator::sink::SinkSet;
use qtrace_coordinator::{codegen, decls};
use qtrace_server::plan::OU_DECLARATIONS;

/// Exit codes: 0 clean shutdown, 1 attach failure, 2 schema-parse failure,
/// 3 output-sink failure.
const EXIT_ATTACH: u8 = 1;
const EXIT_SCHEMA: u8 = 2;
const EXIT_SINK: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "qtrace")]
#[command(about = "Query-execution telemetry collector", long_about = None)]
struct Args {
    /// Postmaster pid to attach to.
    pid: u32,

    /// Training-data output directory.
    #[arg(long, default_value = ".")]
    outdir: String,

    /// Directory holding the server's probe socket.
    #[arg(long, env = "QTRACE_RUNTIME_DIR", default_value = "/tmp")]
    runtime_dir: String,

    /// Read deadline on the probe socket, in milliseconds.
    #[arg(long, default_value_t = 200)]
    read_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let schema = match decls::build_schema(OU_DECLARATIONS) {
        Ok(schema) => Arc::new(schema),
        Err(err) => {
            tracing::error!(error = %err, "schema extraction failed");
            return ExitCode::from(EXIT_SCHEMA);
        }
    };

    let outdir = PathBuf::from(&args.outdir);
    let sinks = match SinkSet::create(&outdir, &schema) {
        Ok(sinks) => Arc::new(sinks),
        Err(err) => {
            tracing::error!(error = %err, "output sink setup failed");
            return ExitCode::from(EXIT_SINK);
        }
    };

    // Keep a copy of the generated tracing artifact beside the output.
    let max_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let program = codegen::generate_collector_program(&schema, max_cpus, None);
    if let Err(err) = std::fs::write(outdir.join("collector_program.c"), program) {
        tracing::error!(error = %err, "writing tracing artifact failed");
        return ExitCode::from(EXIT_SINK);
    }

    let config = AttachConfig {
        postmaster_pid: args.pid,
        runtime_dir: PathBuf::from(&args.runtime_dir),
        read_timeout: Duration::from_millis(args.read_timeout_ms.max(1)),
    };
    let coordinator = match Coordinator::attach(Arc::clone(&schema), Arc::clone(&sinks), &config) {
        Ok(coordinator) => coordinator,
        Err(err) => {
            tracing::error!(pid = args.pid, error = %err, "attach failed");
            return ExitCode::from(EXIT_ATTACH);
        }
    };
    tracing::info!(pid = args.pid, outdir = %outdir.display(), "collector attached");

    let shutdown = Arc::new(AtomicBool::new(false));
    let runner_shutdown = Arc::clone(&shutdown);
    let mut runner = tokio::task::spawn_blocking(move || {
        let mut coordinator = coordinator;
        let result = coordinator.run(&runner_shutdown);
        coordinator.shutdown();
        result
    });

    let joined = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            shutdown.store(true, Ordering::Relaxed);
            (&mut runner).await
        }
        joined = &mut runner => joined,
    };
    let run_result = match joined {
        Ok(result) => result,
        Err(err) => Err(anyhow::anyhow!("coordinator task panicked: {err}")),
    };

    // Collectors are gone; drain and close the sinks.
    let sink_result = sinks.close_all();

    if let Err(err) = run_result {
        tracing::error!(error = %err, "collector session failed");
        return ExitCode::from(EXIT_ATTACH);
    }
    if let Err(err) = sink_result {
        tracing::error!(error = %err, "sink shutdown failed");
        return ExitCode::from(EXIT_SINK);
    }
    tracing::info!("collector shut down");
    ExitCode::SUCCESS
}
