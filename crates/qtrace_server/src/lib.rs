//! Instrumented-server side of the query-execution telemetry core.
//!
//! Three layers live here: the tracepoint fabric (markers, semaphores, the
//! sampling gate), the counter pipeline (executor frames, counter blocks,
//! the internal plans/stats tables, statistics spoofing), and the probe
//! transport a collector coordinator attaches through.

use std::sync::{Arc, RwLock};

pub mod bus;
pub mod catalog;
pub mod config;
pub mod executor;
pub mod hooks;
pub mod instrument;
pub mod marker;
pub mod node;
pub mod plan;
pub mod planner;
pub mod qss;
pub mod spoof;
pub mod tables;
pub mod workload;

use catalog::Catalog;
use config::Settings;
use hooks::HookTable;
use marker::TracepointFabric;

/// Process-wide server state shared by every backend.
pub struct ServerShared {
    pub settings: Arc<Settings>,
    pub catalog: Catalog,
    pub fabric: Arc<TracepointFabric>,
    pub hooks: RwLock<HookTable>,
    pub db_id: i32,
    pub postmaster_pid: u32,
}

impl ServerShared {
    pub fn new(db_id: i32, postmaster_pid: u32) -> Arc<Self> {
        Arc::new(Self {
            settings: Arc::new(Settings::default()),
            catalog: Catalog::default(),
            fabric: Arc::new(TracepointFabric::new(executor::server_marker_names())),
            hooks: RwLock::new(HookTable::default()),
            db_id,
            postmaster_pid,
        })
    }
}
