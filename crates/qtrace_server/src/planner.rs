//! A deliberately small planner.
//!
//! The telemetry core never plans queries itself, but spoofed statistics
//! have to flow through the same choke point the real planner uses:
//! relation info is fetched once per relation, the get-relation-info hook
//! gets to edit it, and every cost below derives from the edited numbers.

use crate::catalog::Catalog;
use crate::plan::{CmdKind, NodeBody, PlanNode};
use crate::ServerShared;

/// Planner context for one statement.
pub struct PlannerRoot {
    pub query_id: i64,
}

#[derive(Debug, Clone)]
pub struct IndexOptInfo {
    pub indexoid: u32,
    pub pages: i32,
    pub tuples: f64,
    pub tree_height: i32,
}

/// Per-relation planner input, pre-hook values taken from the catalog.
#[derive(Debug, Clone)]
pub struct RelOptInfo {
    pub relid: u32,
    pub pages: i32,
    pub tuples: f64,
    pub indexlist: Vec<IndexOptInfo>,
}

const CPU_TUPLE_COST: f64 = 0.01;
const INDEX_TUPLE_COST: f64 = 0.005;
const DEFAULT_SELECTIVITY: f64 = 0.1;

/// Fetch relation info from the catalog and run the hook chain over it.
pub fn get_relation_info(
    server: &ServerShared,
    root: &PlannerRoot,
    rel_oid: u32,
    inhparent: bool,
) -> RelOptInfo {
    let mut rel = rel_opt_from_catalog(&server.catalog, rel_oid);
    let hook = server
        .hooks
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get_relation_info
        .clone();
    if let Some(hook) = hook {
        hook(root, rel_oid, inhparent, &mut rel);
    }
    rel
}

fn rel_opt_from_catalog(catalog: &Catalog, rel_oid: u32) -> RelOptInfo {
    let Some(relation) = catalog.relation(rel_oid) else {
        return RelOptInfo {
            relid: rel_oid,
            pages: 1,
            tuples: 1.0,
            indexlist: Vec::new(),
        };
    };
    let indexlist = relation
        .indexes
        .iter()
        .filter_map(|oid| catalog.index(*oid))
        .map(|index| IndexOptInfo {
            indexoid: index.oid,
            pages: index.pages,
            tuples: index.tuples,
            tree_height: index.tree_height,
        })
        .collect();
    RelOptInfo {
        relid: relation.oid,
        pages: relation.pages,
        tuples: relation.tuples,
        indexlist,
    }
}

/// Assigns plan-node ids in build order, root first.
pub struct PlanBuilder {
    next_id: i32,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self { next_id: 0 }
    }

    fn node(
        &mut self,
        body: NodeBody,
        startup_cost: f64,
        total_cost: f64,
        plan_rows: f64,
        plan_width: i32,
        qual_count: i32,
    ) -> PlanNode {
        let id = self.next_id;
        self.next_id += 1;
        PlanNode {
            plan_node_id: id,
            startup_cost,
            total_cost,
            plan_rows: plan_rows.max(1.0),
            plan_width,
            parallel_aware: false,
            qual_count,
            body,
            lefttree: None,
            righttree: None,
        }
    }

    pub fn seq_scan(&mut self, rel: &RelOptInfo, qual_count: i32) -> PlanNode {
        let rows = if qual_count > 0 {
            rel.tuples * DEFAULT_SELECTIVITY
        } else {
            rel.tuples
        };
        self.node(
            NodeBody::SeqScan { scanrelid: rel.relid },
            0.0,
            f64::from(rel.pages) + CPU_TUPLE_COST * rel.tuples,
            rows,
            32,
            qual_count,
        )
    }

    pub fn index_scan(&mut self, rel: &RelOptInfo, index: &IndexOptInfo) -> PlanNode {
        let rows = rel.tuples * DEFAULT_SELECTIVITY;
        let startup = f64::from(index.tree_height);
        self.node(
            NodeBody::IndexScan {
                scanrelid: rel.relid,
                indexid: index.indexoid,
                indexqual_count: 1,
            },
            startup,
            startup + INDEX_TUPLE_COST * rows + f64::from(index.pages) * DEFAULT_SELECTIVITY,
            rows,
            32,
            0,
        )
    }

    pub fn index_only_scan(&mut self, rel: &RelOptInfo, index: &IndexOptInfo) -> PlanNode {
        let mut node = self.index_scan(rel, index);
        node.body = NodeBody::IndexOnlyScan {
            scanrelid: rel.relid,
            indexid: index.indexoid,
            indexqual_count: 1,
        };
        node.plan_width = 8;
        node
    }

    pub fn bitmap_index_scan(&mut self, rel: &RelOptInfo, index: &IndexOptInfo) -> PlanNode {
        let rows = rel.tuples * DEFAULT_SELECTIVITY;
        self.node(
            NodeBody::BitmapIndexScan {
                scanrelid: rel.relid,
                indexid: index.indexoid,
                indexqual_count: 1,
            },
            0.0,
            f64::from(index.tree_height) + INDEX_TUPLE_COST * rows,
            rows,
            0,
            0,
        )
    }

    pub fn bitmap_heap_scan(&mut self, rel: &RelOptInfo, index_scan: PlanNode) -> PlanNode {
        let rows = index_scan.plan_rows;
        let mut node = self.node(
            NodeBody::BitmapHeapScan {
                scanrelid: rel.relid,
                bitmapqual_count: 1,
            },
            index_scan.total_cost,
            index_scan.total_cost + f64::from(rel.pages) * DEFAULT_SELECTIVITY + CPU_TUPLE_COST * rows,
            rows,
            32,
            1,
        );
        node.lefttree = Some(Box::new(index_scan));
        node
    }

    pub fn nest_loop(&mut self, outer: PlanNode, inner: PlanNode) -> PlanNode {
        let rows = (outer.plan_rows * inner.plan_rows * DEFAULT_SELECTIVITY).max(1.0);
        let total = outer.total_cost + outer.plan_rows * inner.total_cost + CPU_TUPLE_COST * rows;
        let mut node = self.node(
            NodeBody::NestLoop {
                jointype: 0,
                joinqual_count: 1,
                nest_params_count: 1,
            },
            outer.startup_cost,
            total,
            rows,
            outer.plan_width + inner.plan_width,
            0,
        );
        node.lefttree = Some(Box::new(outer));
        node.righttree = Some(Box::new(inner));
        node
    }

    pub fn hash_join(&mut self, outer: PlanNode, hash: PlanNode) -> PlanNode {
        let rows = (outer.plan_rows * DEFAULT_SELECTIVITY).max(1.0);
        let total = outer.total_cost + hash.total_cost + CPU_TUPLE_COST * outer.plan_rows;
        let mut node = self.node(
            NodeBody::HashJoin {
                jointype: 0,
                joinqual_count: 0,
                hashclauses_count: 1,
            },
            hash.total_cost,
            total,
            rows,
            outer.plan_width * 2,
            0,
        );
        node.lefttree = Some(Box::new(outer));
        node.righttree = Some(Box::new(hash));
        node
    }

    pub fn hash(&mut self, input: PlanNode) -> PlanNode {
        let mut node = self.node(
            NodeBody::Hash {
                rows_total: input.plan_rows as i64,
                skew_column: 0,
            },
            input.total_cost,
            input.total_cost + CPU_TUPLE_COST * input.plan_rows,
            input.plan_rows,
            input.plan_width,
            0,
        );
        node.lefttree = Some(Box::new(input));
        node
    }

    pub fn agg(&mut self, input: PlanNode, num_groups: i64) -> PlanNode {
        let mut node = self.node(
            NodeBody::Agg {
                aggstrategy: 2,
                num_groups,
            },
            input.total_cost,
            input.total_cost + CPU_TUPLE_COST * input.plan_rows,
            num_groups as f64,
            8,
            0,
        );
        node.lefttree = Some(Box::new(input));
        node
    }

    pub fn sort(&mut self, input: PlanNode, num_cols: i32) -> PlanNode {
        let rows = input.plan_rows;
        let sort_cost = rows.max(2.0) * rows.max(2.0).log2() * CPU_TUPLE_COST;
        let mut node = self.node(
            NodeBody::Sort {
                num_cols,
                bounded: false,
            },
            input.total_cost + sort_cost,
            input.total_cost + sort_cost,
            rows,
            input.plan_width,
            0,
        );
        node.lefttree = Some(Box::new(input));
        node
    }

    pub fn limit(&mut self, input: PlanNode, count: i64) -> PlanNode {
        let rows = (count as f64).min(input.plan_rows);
        let mut node = self.node(
            NodeBody::Limit {
                limit_offset: 0,
                limit_count: count,
            },
            input.startup_cost,
            input.startup_cost + (input.total_cost - input.startup_cost) * rows / input.plan_rows,
            rows,
            input.plan_width,
            0,
        );
        node.lefttree = Some(Box::new(input));
        node
    }

    pub fn lock_rows(&mut self, input: PlanNode) -> PlanNode {
        let rows = input.plan_rows;
        let total = input.total_cost + CPU_TUPLE_COST * rows;
        let mut node = self.node(
            NodeBody::LockRows {
                row_marks_count: 1,
                epq_param: 0,
            },
            input.startup_cost,
            total,
            rows,
            input.plan_width,
            0,
        );
        node.lefttree = Some(Box::new(input));
        node
    }

    pub fn modify_table(&mut self, rel: &RelOptInfo, operation: CmdKind, input: PlanNode) -> PlanNode {
        let rows = input.plan_rows;
        let total = input.total_cost + CPU_TUPLE_COST * rows;
        let mut node = self.node(
            NodeBody::ModifyTable {
                operation,
                nominal_relation: rel.relid,
                result_relations_count: 1,
            },
            input.startup_cost,
            total,
            rows,
            0,
            0,
        );
        node.lefttree = Some(Box::new(input));
        node
    }

    pub fn result(&mut self, rows: f64, width: i32) -> PlanNode {
        self.node(NodeBody::Result, 0.0, CPU_TUPLE_COST * rows, rows, width, 0)
    }

    pub fn subplan(&mut self, input: PlanNode, plan_id: i32) -> PlanNode {
        let mut node = self.node(
            NodeBody::SubPlan { plan_id },
            input.startup_cost,
            input.total_cost,
            input.plan_rows,
            input.plan_width,
            0,
        );
        node.lefttree = Some(Box::new(input));
        node
    }
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}
