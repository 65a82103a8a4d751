//! Plan-node model.
//!
//! The telemetry core only reads structural information from plan nodes; the
//! shapes here are the minimum the executor, the counter pipeline, and the
//! features markers need. The features wire layout of each node kind is
//! pinned by `ou_decls.h`, which the coordinator parses; the `encode_features`
//! implementation below must emit fields in exactly that order.

use bytes::BufMut;
use serde::Serialize;

/// Declarations handed to the coordinator for schema extraction.
pub const OU_DECLARATIONS: &str = include_str!("ou_decls.h");

/// Plan-node id reserved values. Real plan nodes are numbered from zero;
/// negative ids mark instrumentation that is not a plan node.
pub const INVALID_PLAN_ID: i32 = -1;
pub const REMOTE_RECEIVER_PLAN_ID: i32 = -2;
pub const INDEPENDENT_PLAN_ID: i32 = -3;
/// First id handed out by the per-frame descending allocator for
/// plan-independent instrumentation (triggers and friends).
pub const INDEPENDENT_INSTR_ID_START: i32 = INDEPENDENT_PLAN_ID - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CmdKind {
    Insert,
    Update,
    Delete,
}

impl CmdKind {
    pub fn as_i32(self) -> i32 {
        match self {
            CmdKind::Insert => 1,
            CmdKind::Update => 2,
            CmdKind::Delete => 3,
        }
    }
}

/// Every plan-node kind the executor knows how to run. One operating unit
/// per tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeTag {
    Agg,
    BitmapHeapScan,
    BitmapIndexScan,
    Hash,
    HashJoin,
    IndexOnlyScan,
    IndexScan,
    Limit,
    LockRows,
    ModifyTable,
    NestLoop,
    Result,
    SeqScan,
    Sort,
    SubPlan,
}

impl NodeTag {
    pub const ALL: [NodeTag; 15] = [
        NodeTag::Agg,
        NodeTag::BitmapHeapScan,
        NodeTag::BitmapIndexScan,
        NodeTag::Hash,
        NodeTag::HashJoin,
        NodeTag::IndexOnlyScan,
        NodeTag::IndexScan,
        NodeTag::Limit,
        NodeTag::LockRows,
        NodeTag::ModifyTable,
        NodeTag::NestLoop,
        NodeTag::Result,
        NodeTag::SeqScan,
        NodeTag::Sort,
        NodeTag::SubPlan,
    ];

    /// The executor function whose markers carry this node's telemetry.
    pub fn exec_function(self) -> &'static str {
        match self {
            NodeTag::Agg => "ExecAgg",
            NodeTag::BitmapHeapScan => "ExecBitmapHeapScan",
            NodeTag::BitmapIndexScan => "ExecBitmapIndexScan",
            NodeTag::Hash => "ExecHash",
            NodeTag::HashJoin => "ExecHashJoinImpl",
            NodeTag::IndexOnlyScan => "ExecIndexOnlyScan",
            NodeTag::IndexScan => "ExecIndexScan",
            NodeTag::Limit => "ExecLimit",
            NodeTag::LockRows => "ExecLockRows",
            NodeTag::ModifyTable => "ExecModifyTable",
            NodeTag::NestLoop => "ExecNestLoop",
            NodeTag::Result => "ExecResult",
            NodeTag::SeqScan => "ExecSeqScan",
            NodeTag::Sort => "ExecSort",
            NodeTag::SubPlan => "ExecSubPlan",
        }
    }

    /// Node name used in the stats table comment column. ModifyTable is
    /// spelled per operation at write time.
    pub fn node_name(self) -> &'static str {
        match self {
            NodeTag::Agg => "Agg",
            NodeTag::BitmapHeapScan => "BitmapHeapScan",
            NodeTag::BitmapIndexScan => "BitmapIndexScan",
            NodeTag::Hash => "Hash",
            NodeTag::HashJoin => "HashJoin",
            NodeTag::IndexOnlyScan => "IndexOnlyScan",
            NodeTag::IndexScan => "IndexScan",
            NodeTag::Limit => "Limit",
            NodeTag::LockRows => "LockRows",
            NodeTag::ModifyTable => "ModifyTable",
            NodeTag::NestLoop => "NestLoop",
            NodeTag::Result => "Result",
            NodeTag::SeqScan => "SeqScan",
            NodeTag::Sort => "Sort",
            NodeTag::SubPlan => "SubPlan",
        }
    }
}

/// Kind-specific plan fields, mirroring the structs in `ou_decls.h`.
#[derive(Debug, Clone, Serialize)]
pub enum NodeBody {
    SeqScan {
        scanrelid: u32,
    },
    IndexScan {
        scanrelid: u32,
        indexid: u32,
        indexqual_count: i32,
    },
    IndexOnlyScan {
        scanrelid: u32,
        indexid: u32,
        indexqual_count: i32,
    },
    BitmapIndexScan {
        scanrelid: u32,
        indexid: u32,
        indexqual_count: i32,
    },
    BitmapHeapScan {
        scanrelid: u32,
        bitmapqual_count: i32,
    },
    NestLoop {
        jointype: i32,
        joinqual_count: i32,
        nest_params_count: i32,
    },
    HashJoin {
        jointype: i32,
        joinqual_count: i32,
        hashclauses_count: i32,
    },
    Hash {
        rows_total: i64,
        skew_column: i16,
    },
    Agg {
        aggstrategy: i32,
        num_groups: i64,
    },
    Sort {
        num_cols: i32,
        bounded: bool,
    },
    Limit {
        limit_offset: i64,
        limit_count: i64,
    },
    ModifyTable {
        operation: CmdKind,
        nominal_relation: u32,
        result_relations_count: i32,
    },
    LockRows {
        row_marks_count: i32,
        epq_param: i32,
    },
    Result,
    SubPlan {
        plan_id: i32,
    },
}

impl NodeBody {
    pub fn tag(&self) -> NodeTag {
        match self {
            NodeBody::SeqScan { .. } => NodeTag::SeqScan,
            NodeBody::IndexScan { .. } => NodeTag::IndexScan,
            NodeBody::IndexOnlyScan { .. } => NodeTag::IndexOnlyScan,
            NodeBody::BitmapIndexScan { .. } => NodeTag::BitmapIndexScan,
            NodeBody::BitmapHeapScan { .. } => NodeTag::BitmapHeapScan,
            NodeBody::NestLoop { .. } => NodeTag::NestLoop,
            NodeBody::HashJoin { .. } => NodeTag::HashJoin,
            NodeBody::Hash { .. } => NodeTag::Hash,
            NodeBody::Agg { .. } => NodeTag::Agg,
            NodeBody::Sort { .. } => NodeTag::Sort,
            NodeBody::Limit { .. } => NodeTag::Limit,
            NodeBody::ModifyTable { .. } => NodeTag::ModifyTable,
            NodeBody::LockRows { .. } => NodeTag::LockRows,
            NodeBody::Result => NodeTag::Result,
            NodeBody::SubPlan { .. } => NodeTag::SubPlan,
        }
    }
}

/// One node of a plan tree. The tree is read-only to the telemetry core.
#[derive(Debug, Clone, Serialize)]
pub struct PlanNode {
    pub plan_node_id: i32,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub plan_rows: f64,
    pub plan_width: i32,
    pub parallel_aware: bool,
    pub qual_count: i32,
    pub body: NodeBody,
    pub lefttree: Option<Box<PlanNode>>,
    pub righttree: Option<Box<PlanNode>>,
}

/// Child plan-node id, or INVALID when the slot is empty.
pub fn child_plan_node_id(child: Option<&PlanNode>) -> i32 {
    child.map(|node| node.plan_node_id).unwrap_or(INVALID_PLAN_ID)
}

/// Opaque pointer-width token standing in for a plan-node address.
fn ptr_token(child: Option<&PlanNode>) -> u64 {
    match child {
        Some(node) => 0x7f00_0000_0000u64 | (u64::from(node.plan_node_id as u32) << 4),
        None => 0,
    }
}

impl PlanNode {
    pub fn tag(&self) -> NodeTag {
        self.body.tag()
    }

    pub fn left(&self) -> Option<&PlanNode> {
        self.lefttree.as_deref()
    }

    pub fn right(&self) -> Option<&PlanNode> {
        self.righttree.as_deref()
    }

    /// Visit this node and every descendant, parents first.
    pub fn walk(&self, visit: &mut impl FnMut(&PlanNode)) {
        visit(self);
        if let Some(left) = self.left() {
            left.walk(visit);
        }
        if let Some(right) = self.right() {
            right.walk(visit);
        }
    }

    /// Base `Plan` struct fields, in declaration order.
    fn encode_plan_base(&self, buf: &mut Vec<u8>) {
        buf.put_i32_ne(self.plan_node_id);
        buf.put_f64_ne(self.startup_cost);
        buf.put_f64_ne(self.total_cost);
        buf.put_f64_ne(self.plan_rows);
        buf.put_i32_ne(self.plan_width);
        buf.put_u8(u8::from(self.parallel_aware));
        buf.put_u64_ne(ptr_token(self.left()));
        buf.put_u64_ne(ptr_token(self.right()));
        buf.put_i32_ne(self.qual_count);
    }

    /// Pack the features payload for this node's features marker:
    /// `query_id` ‖ expanded node struct ‖ child ids ‖ statement start.
    /// Field order tracks `ou_decls.h`.
    pub fn encode_features(&self, query_id: i64, statement_start_ts: i64, buf: &mut Vec<u8>) {
        buf.put_i64_ne(query_id);
        self.encode_plan_base(buf);
        match &self.body {
            NodeBody::SeqScan { scanrelid } => {
                buf.put_u32_ne(*scanrelid);
            }
            NodeBody::IndexScan {
                scanrelid,
                indexid,
                indexqual_count,
            }
            | NodeBody::IndexOnlyScan {
                scanrelid,
                indexid,
                indexqual_count,
            }
            | NodeBody::BitmapIndexScan {
                scanrelid,
                indexid,
                indexqual_count,
            } => {
                buf.put_u32_ne(*scanrelid);
                buf.put_u32_ne(*indexid);
                buf.put_i32_ne(*indexqual_count);
            }
            NodeBody::BitmapHeapScan {
                scanrelid,
                bitmapqual_count,
            } => {
                buf.put_u32_ne(*scanrelid);
                buf.put_i32_ne(*bitmapqual_count);
            }
            NodeBody::NestLoop {
                jointype,
                joinqual_count,
                nest_params_count,
            } => {
                buf.put_i32_ne(*jointype);
                buf.put_i32_ne(*joinqual_count);
                buf.put_i32_ne(*nest_params_count);
            }
            NodeBody::HashJoin {
                jointype,
                joinqual_count,
                hashclauses_count,
            } => {
                buf.put_i32_ne(*jointype);
                buf.put_i32_ne(*joinqual_count);
                buf.put_i32_ne(*hashclauses_count);
            }
            NodeBody::Hash {
                rows_total,
                skew_column,
            } => {
                buf.put_i64_ne(*rows_total);
                buf.put_i16_ne(*skew_column);
            }
            NodeBody::Agg {
                aggstrategy,
                num_groups,
            } => {
                buf.put_i32_ne(*aggstrategy);
                buf.put_i64_ne(*num_groups);
            }
            NodeBody::Sort { num_cols, bounded } => {
                buf.put_i32_ne(*num_cols);
                buf.put_u8(u8::from(*bounded));
            }
            NodeBody::Limit {
                limit_offset,
                limit_count,
            } => {
                buf.put_i64_ne(*limit_offset);
                buf.put_i64_ne(*limit_count);
            }
            NodeBody::ModifyTable {
                operation,
                nominal_relation,
                result_relations_count,
            } => {
                buf.put_i32_ne(operation.as_i32());
                buf.put_u32_ne(*nominal_relation);
                buf.put_i32_ne(*result_relations_count);
            }
            NodeBody::LockRows {
                row_marks_count,
                epq_param,
            } => {
                buf.put_i32_ne(*row_marks_count);
                buf.put_i32_ne(*epq_param);
            }
            NodeBody::Result => {}
            NodeBody::SubPlan { plan_id } => {
                buf.put_i32_ne(*plan_id);
            }
        }
        buf.put_i32_ne(child_plan_node_id(self.left()));
        buf.put_i32_ne(child_plan_node_id(self.right()));
        buf.put_i64_ne(statement_start_ts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_scan(id: i32) -> PlanNode {
        PlanNode {
            plan_node_id: id,
            startup_cost: 0.0,
            total_cost: 10.0,
            plan_rows: 100.0,
            plan_width: 8,
            parallel_aware: false,
            qual_count: 1,
            body: NodeBody::SeqScan { scanrelid: 100 },
            lefttree: None,
            righttree: None,
        }
    }

    #[test]
    fn seq_scan_feature_payload_layout() {
        let node = seq_scan(7);
        let mut buf = Vec::new();
        node.encode_features(42, 1234, &mut buf);
        // query_id + Plan base (4+8+8+8+4+1+8+8+4) + scanrelid + children + ts.
        assert_eq!(buf.len(), 8 + 53 + 4 + 4 + 4 + 8);
        assert_eq!(i64::from_ne_bytes(buf[0..8].try_into().unwrap()), 42);
        assert_eq!(i32::from_ne_bytes(buf[8..12].try_into().unwrap()), 7);
    }

    #[test]
    fn child_ids_default_to_invalid() {
        let node = seq_scan(3);
        assert_eq!(child_plan_node_id(node.left()), INVALID_PLAN_ID);
        let mut buf = Vec::new();
        node.encode_features(1, 0, &mut buf);
        let child_off = buf.len() - 16;
        let left = i32::from_ne_bytes(buf[child_off..child_off + 4].try_into().unwrap());
        assert_eq!(left, INVALID_PLAN_ID);
    }

    #[test]
    fn independent_ids_start_below_reserved_range() {
        assert_eq!(INDEPENDENT_INSTR_ID_START, -4);
        assert!(INDEPENDENT_INSTR_ID_START < INDEPENDENT_PLAN_ID);
    }

    #[test]
    fn walk_is_parents_first() {
        let mut tree = seq_scan(0);
        tree.lefttree = Some(Box::new(seq_scan(1)));
        let mut seen = Vec::new();
        tree.walk(&mut |node| seen.push(node.plan_node_id));
        assert_eq!(seen, vec![0, 1]);
    }
}
