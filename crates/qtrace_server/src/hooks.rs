//! Executor hook capability table.
//!
//! The server exposes a small set of function-pointer slots; an extension
//! registers its implementations at module init and restores the prior
//! occupants at teardown, chaining to them where the protocol requires it.

use std::sync::Arc;

use crate::executor::{ExecutorContext, QueryDesc};
use crate::instrument::Instrumentation;
use crate::planner::{PlannerRoot, RelOptInfo};

pub type ExecutorStartHook =
    Arc<dyn Fn(&mut ExecutorContext, &mut QueryDesc, u32) -> anyhow::Result<()> + Send + Sync>;
pub type ExecutorEndHook =
    Arc<dyn Fn(&mut ExecutorContext, &mut QueryDesc) -> anyhow::Result<()> + Send + Sync>;
pub type AllocInstrumentationHook =
    Arc<dyn Fn(&mut ExecutorContext, &str) -> Option<Arc<Instrumentation>> + Send + Sync>;
pub type QssClearHook = Arc<dyn Fn(&mut ExecutorContext) + Send + Sync>;
pub type GetRelationInfoHook =
    Arc<dyn Fn(&PlannerRoot, u32, bool, &mut RelOptInfo) + Send + Sync>;
pub type ExplainOneQueryHook = Arc<dyn Fn(&QueryDesc) -> String + Send + Sync>;
pub type ExplainOneUtilityHook = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// The hook slots. Cloned wholesale by installers so prior occupants can be
/// preserved and restored.
#[derive(Default, Clone)]
pub struct HookTable {
    pub executor_start: Option<ExecutorStartHook>,
    pub executor_end: Option<ExecutorEndHook>,
    pub alloc_instrumentation: Option<AllocInstrumentationHook>,
    pub qss_clear: Option<QssClearHook>,
    pub get_relation_info: Option<GetRelationInfoHook>,
    pub explain_one_query: Option<ExplainOneQueryHook>,
    pub explain_one_utility: Option<ExplainOneUtilityHook>,
}
