//! Attach controller and record router.
//!
//! Discovers the target postmaster, connects to its probe socket, enables
//! the marker semaphores, and dispatches incoming marker events: lifecycle
//! markers flow through a dedicated ring and create or destroy per-backend
//! collectors; OU markers drive each backend's state machines. One
//! consumer thread drains each (backend, OU) ring into the shared per-OU
//! sink.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use sysinfo::{Pid, System};

use qtrace_collector::lifecycle::{LifecycleEvent, LifecycleEventKind, LIFECYCLE_MARKERS};
use qtrace_collector::machine::CollectorEngine;
use qtrace_collector::ring::{PopResult, RecordRing};
use qtrace_collector::schema::{decode_record, CollectorSchema};
use qtrace_collector::sources::SourceSet;
use qtrace_server::bus::{socket_path, BusFrame, BusRead, ProbeBusClient};

use crate::codegen;
use crate::sink::SinkSet;

const LIFECYCLE_RING_CAPACITY: usize = 256;
const CONSUMER_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct AttachConfig {
    pub postmaster_pid: u32,
    pub runtime_dir: PathBuf,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
enum OuOp {
    Begin,
    End,
    Features,
    Flush,
}

#[derive(Debug, Clone, Copy)]
enum MarkerRef {
    Ou { ou_index: u32, op: OuOp },
    Lifecycle(LifecycleEventKind),
}

struct BackendCollector {
    engine: CollectorEngine,
    consumers: Vec<JoinHandle<()>>,
}

/// Check that the pid looks like a live process before attaching.
pub fn verify_postmaster(pid: u32) -> anyhow::Result<()> {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid));
    if system.process(Pid::from_u32(pid)).is_none() {
        anyhow::bail!("no process with pid {pid}");
    }
    Ok(())
}

pub struct Coordinator {
    schema: Arc<CollectorSchema>,
    sinks: Arc<SinkSet>,
    client: ProbeBusClient,
    server_pid: u32,
    marker_refs: HashMap<u32, MarkerRef>,
    attach_names: Vec<String>,
    backends: HashMap<u32, BackendCollector>,
    lifecycle_ring: Arc<RecordRing>,
    read_timeout: Duration,
    unknown_backend_drops: u64,
}

impl Coordinator {
    /// Connect to the postmaster's probe socket, verify the marker catalog
    /// covers the schema, and enable all probes. Lifecycle markers attach
    /// first so fork replay for existing backends precedes any OU event.
    pub fn attach(
        schema: Arc<CollectorSchema>,
        sinks: Arc<SinkSet>,
        config: &AttachConfig,
    ) -> anyhow::Result<Self> {
        verify_postmaster(config.postmaster_pid)?;
        let socket = socket_path(&config.runtime_dir, config.postmaster_pid);
        let (mut client, server_pid, marker_names) =
            ProbeBusClient::connect(&socket).context("attach to probe socket")?;

        let mut name_refs: HashMap<String, MarkerRef> = HashMap::new();
        let mut ou_names: Vec<String> = Vec::new();
        for ou in &schema.ous {
            for (suffix, op) in [
                ("begin", OuOp::Begin),
                ("end", OuOp::End),
                ("features", OuOp::Features),
                ("flush", OuOp::Flush),
            ] {
                let name = format!("{}_{suffix}", ou.name);
                name_refs.insert(
                    name.clone(),
                    MarkerRef::Ou {
                        ou_index: ou.ou_index,
                        op,
                    },
                );
                ou_names.push(name);
            }
        }
        for (index, name) in LIFECYCLE_MARKERS.iter().enumerate() {
            let kind = LifecycleEventKind::from_i32(index as i32).expect("catalog kind");
            name_refs.insert((*name).to_string(), MarkerRef::Lifecycle(kind));
        }

        let mut marker_refs = HashMap::new();
        for (id, name) in marker_names.iter().enumerate() {
            if let Some(marker_ref) = name_refs.get(name) {
                marker_refs.insert(id as u32, *marker_ref);
            }
        }
        for expected in name_refs.keys() {
            if !marker_names.contains(expected) {
                anyhow::bail!("server does not register marker {expected}");
            }
        }

        let lifecycle: Vec<String> = LIFECYCLE_MARKERS.iter().map(|n| n.to_string()).collect();
        client.attach(lifecycle).context("attach lifecycle probes")?;
        client.attach(ou_names.clone()).context("attach OU probes")?;

        let mut attach_names: Vec<String> =
            LIFECYCLE_MARKERS.iter().map(|n| n.to_string()).collect();
        attach_names.extend(ou_names);

        tracing::info!(
            pid = config.postmaster_pid,
            server_pid,
            markers = attach_names.len(),
            "attached to postmaster"
        );

        Ok(Self {
            schema,
            sinks,
            client,
            server_pid,
            marker_refs,
            attach_names,
            backends: HashMap::new(),
            lifecycle_ring: Arc::new(RecordRing::new(LIFECYCLE_RING_CAPACITY)),
            read_timeout: config.read_timeout,
            unknown_backend_drops: 0,
        })
    }

    /// Event loop: dispatch marker frames until shutdown is requested or
    /// the server closes the socket.
    pub fn run(&mut self, shutdown: &AtomicBool) -> anyhow::Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            match self.client.read(Some(self.read_timeout))? {
                BusRead::TimedOut => continue,
                BusRead::Closed => {
                    tracing::info!("server closed the probe socket");
                    break;
                }
                BusRead::Frame(BusFrame::Marker {
                    backend_pid,
                    marker_id,
                    args,
                    payload,
                }) => self.dispatch(backend_pid, marker_id, &args, payload.as_deref()),
                BusRead::Frame(_) => {
                    tracing::warn!("unexpected control frame from server");
                }
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, backend_pid: u32, marker_id: u32, args: &[u64], payload: Option<&[u8]>) {
        let Some(marker_ref) = self.marker_refs.get(&marker_id).copied() else {
            return;
        };
        match marker_ref {
            MarkerRef::Lifecycle(kind) => {
                let event = LifecycleEvent {
                    kind,
                    pid: args.first().copied().unwrap_or(0) as i32,
                    socket_fd: if kind == LifecycleEventKind::ForkBackend {
                        args.get(1).copied().map(|fd| fd as i32).unwrap_or(-1)
                    } else {
                        -1
                    },
                };
                let mut buf = Vec::new();
                event.encode(&mut buf);
                self.lifecycle_ring.push(buf);
                self.drain_lifecycle();
            }
            MarkerRef::Ou { ou_index, op } => {
                let plan_node_id = args.first().copied().unwrap_or(0) as u32 as i32;
                if !self.backends.contains_key(&backend_pid) {
                    // Marker for a backend we never saw fork: dropped, and
                    // counted against the OU it was destined for.
                    self.sinks.add_drops(ou_index, 1);
                    self.unknown_backend_drops += 1;
                    return;
                }
                let Some(backend) = self.backends.get_mut(&backend_pid) else {
                    return;
                };
                match op {
                    OuOp::Begin => backend.engine.on_begin(ou_index, plan_node_id),
                    OuOp::End => backend.engine.on_end(ou_index, plan_node_id),
                    OuOp::Features => backend.engine.on_features(
                        ou_index,
                        plan_node_id,
                        payload.unwrap_or(&[]),
                    ),
                    OuOp::Flush => backend.engine.on_flush(ou_index, plan_node_id),
                }
            }
        }
    }

    fn drain_lifecycle(&mut self) {
        while let PopResult::Record(buf) = self.lifecycle_ring.pop_timeout(Duration::ZERO) {
            let Some(event) = LifecycleEvent::decode(&buf) else {
                continue;
            };
            match event.kind {
                LifecycleEventKind::ForkBackend | LifecycleEventKind::ForkBackground => {
                    self.create_collector(event.pid as u32, event.client_socket());
                }
                LifecycleEventKind::ReapBackend | LifecycleEventKind::ReapBackground => {
                    self.destroy_collector(event.pid as u32);
                }
            }
        }
    }

    fn create_collector(&mut self, pid: u32, client_socket_fd: Option<i32>) {
        if self.backends.contains_key(&pid) {
            return;
        }
        tracing::info!(pid, "postmaster forked, creating its collector");

        // The compiled tracing artifact for this backend. The in-process
        // engine enacts the same protocol the generated program describes.
        let max_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let program =
            codegen::generate_collector_program(&self.schema, max_cpus, client_socket_fd);
        tracing::debug!(pid, program_bytes = program.len(), "generated tracing program");

        let engine = CollectorEngine::new(
            Arc::clone(&self.schema),
            pid,
            SourceSet::software(self.server_pid),
        );
        let mut consumers = Vec::with_capacity(self.schema.ous.len());
        for ou in &self.schema.ous {
            let Some(ring) = engine.ring(ou.ou_index) else {
                continue;
            };
            let schema = Arc::clone(&self.schema);
            let sinks = Arc::clone(&self.sinks);
            let ou_index = ou.ou_index;
            let handle = std::thread::Builder::new()
                .name(format!("consume-{pid}-{}", ou.name))
                .spawn(move || consumer_loop(ring, schema, sinks, ou_index));
            match handle {
                Ok(handle) => consumers.push(handle),
                Err(err) => tracing::warn!(pid, error = %err, "consumer spawn failed"),
            }
        }
        self.backends.insert(pid, BackendCollector { engine, consumers });
    }

    fn destroy_collector(&mut self, pid: u32) {
        let Some(backend) = self.backends.remove(&pid) else {
            return;
        };
        tracing::info!(pid, "postmaster reaped, destroying its collector");
        backend.engine.close();
        for consumer in backend.consumers {
            let _ = consumer.join();
        }
        // Every discard channel lands in the exported per-OU drop counters:
        // resets and map overflows here, ring overflows in the consumer.
        let stats = backend.engine.stats().snapshot();
        for (ou_index, resets) in stats.resets.iter().enumerate() {
            self.sinks.add_drops(ou_index as u32, *resets);
        }
        for (ou_index, overflows) in stats.map_overflows.iter().enumerate() {
            self.sinks.add_drops(ou_index as u32, *overflows);
        }
    }

    /// Detach probes and tear down every collector. Called on both the
    /// graceful and the server-closed paths.
    pub fn shutdown(&mut self) {
        let pids: Vec<u32> = self.backends.keys().copied().collect();
        for pid in pids {
            self.destroy_collector(pid);
        }
        if let Err(err) = self.client.detach(self.attach_names.clone()) {
            tracing::debug!(error = %err, "detach after session end");
        }
        if self.unknown_backend_drops > 0 {
            // Breakdown only; these are already in the sink drop counters.
            tracing::warn!(
                dropped = self.unknown_backend_drops,
                "marker events for unknown backends"
            );
        }
    }
}

fn consumer_loop(
    ring: Arc<RecordRing>,
    schema: Arc<CollectorSchema>,
    sinks: Arc<SinkSet>,
    ou_index: u32,
) {
    loop {
        match ring.pop_timeout(CONSUMER_POLL) {
            PopResult::Record(record) => match decode_record(&schema, &record) {
                Some(decoded) => {
                    let Some(ou) = schema.ou(decoded.ou_index) else {
                        sinks.add_drops(ou_index, 1);
                        continue;
                    };
                    let mut columns: Vec<String> = decoded
                        .features
                        .iter()
                        .zip(&ou.features)
                        .filter(|(_, spec)| spec.kind.output_visible())
                        .map(|(value, _)| value.render())
                        .collect();
                    columns.extend(decoded.metrics.render_columns());
                    sinks.write(ou_index, columns.join(","));
                }
                None => sinks.add_drops(ou_index, 1),
            },
            PopResult::TimedOut => continue,
            PopResult::Closed => break,
        }
    }
    sinks.add_drops(ou_index, ring.dropped());
}
