//! Synthetic workload driver.
//!
//! Rotates through plan shapes so every operating unit fires: scans, joins,
//! aggregates, sorts, DML, row locks, and a nested subplan. Plans are built
//! through the planner so spoofed statistics show up in recorded costs.

use crate::executor::QueryDesc;
use crate::plan::CmdKind;
use crate::planner::{get_relation_info, PlanBuilder, PlannerRoot};
use crate::ServerShared;

pub const ORDERS_OID: u32 = 100;
pub const ORDERS_PKEY_OID: u32 = 200;
pub const LINEITEM_OID: u32 = 101;
pub const LINEITEM_IDX_OID: u32 = 201;
pub const CUSTOMERS_OID: u32 = 102;

/// Number of distinct statement shapes in the rotation.
pub const STATEMENT_KINDS: u64 = 10;

/// Register the demo relations the workload runs against.
pub fn register_demo_catalog(server: &ServerShared) {
    server.catalog.register_table(ORDERS_OID, "orders", 128, 10_000.0);
    server
        .catalog
        .register_index(ORDERS_PKEY_OID, "orders_pkey", ORDERS_OID, 32, 10_000.0);
    server.catalog.register_table(LINEITEM_OID, "lineitem", 512, 60_000.0);
    server.catalog.register_index(
        LINEITEM_IDX_OID,
        "lineitem_order_idx",
        LINEITEM_OID,
        96,
        60_000.0,
    );
    server.catalog.register_table(CUSTOMERS_OID, "customers", 64, 5_000.0);
}

/// Build the `seq`-th statement of a backend's workload. Generation bumps
/// every hundred statements to model periodic replanning.
pub fn build_statement(server: &ServerShared, seq: u64) -> QueryDesc {
    let kind = seq % STATEMENT_KINDS;
    let query_id = 9_000 + kind as i64;
    let generation = 1 + (seq / 100) as i32;
    let root = PlannerRoot { query_id };
    let mut builder = PlanBuilder::new();

    let orders = get_relation_info(server, &root, ORDERS_OID, false);
    let lineitem = get_relation_info(server, &root, LINEITEM_OID, false);
    let customers = get_relation_info(server, &root, CUSTOMERS_OID, false);

    let (text, plan) = match kind {
        0 => (
            "select * from orders",
            builder.seq_scan(&orders, 0),
        ),
        1 => {
            let index = orders.indexlist.first().cloned().unwrap_or_else(|| {
                crate::planner::IndexOptInfo {
                    indexoid: ORDERS_PKEY_OID,
                    pages: 32,
                    tuples: orders.tuples,
                    tree_height: 2,
                }
            });
            (
                "select * from orders where o_id = $1",
                builder.index_scan(&orders, &index),
            )
        }
        2 => {
            let index = lineitem.indexlist.first().cloned().unwrap_or_else(|| {
                crate::planner::IndexOptInfo {
                    indexoid: LINEITEM_IDX_OID,
                    pages: 96,
                    tuples: lineitem.tuples,
                    tree_height: 2,
                }
            });
            (
                "select l_orderkey from lineitem where l_orderkey < $1",
                builder.index_only_scan(&lineitem, &index),
            )
        }
        3 => {
            let index = lineitem.indexlist.first().cloned().unwrap_or_else(|| {
                crate::planner::IndexOptInfo {
                    indexoid: LINEITEM_IDX_OID,
                    pages: 96,
                    tuples: lineitem.tuples,
                    tree_height: 2,
                }
            });
            let bitmap = builder.bitmap_index_scan(&lineitem, &index);
            (
                "select * from lineitem where l_qty between $1 and $2",
                builder.bitmap_heap_scan(&lineitem, bitmap),
            )
        }
        4 => {
            let outer = builder.seq_scan(&customers, 1);
            let index = orders.indexlist.first().cloned().unwrap_or_else(|| {
                crate::planner::IndexOptInfo {
                    indexoid: ORDERS_PKEY_OID,
                    pages: 32,
                    tuples: orders.tuples,
                    tree_height: 2,
                }
            });
            let inner = builder.index_scan(&orders, &index);
            (
                "select * from customers c join orders o on o.c_id = c.id",
                builder.nest_loop(outer, inner),
            )
        }
        5 => {
            let probe = builder.seq_scan(&orders, 0);
            let build_input = builder.seq_scan(&lineitem, 0);
            let hash = builder.hash(build_input);
            let join = builder.hash_join(probe, hash);
            (
                "select o_id, count(*) from orders join lineitem group by o_id",
                builder.agg(join, 64),
            )
        }
        6 => {
            let scan = builder.seq_scan(&lineitem, 1);
            let sort = builder.sort(scan, 2);
            (
                "select * from lineitem order by l_price limit 10",
                builder.limit(sort, 10),
            )
        }
        7 => {
            let input = builder.result(8.0, 32);
            (
                "insert into orders select ...",
                builder.modify_table(&orders, CmdKind::Insert, input),
            )
        }
        8 => {
            let scan = builder.seq_scan(&orders, 1);
            (
                "select * from orders where o_id = $1 for update",
                builder.lock_rows(scan),
            )
        }
        _ => {
            let inner = builder.seq_scan(&customers, 0);
            (
                "select (select count(*) from customers)",
                builder.subplan(inner, 1),
            )
        }
    };

    QueryDesc::new(query_id, generation, text, plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_statement_kind_builds() {
        let server = crate::ServerShared::new(1, 1000);
        register_demo_catalog(&server);
        for seq in 0..STATEMENT_KINDS {
            let query = build_statement(&server, seq);
            assert!(query.query_id >= 9_000);
            assert_eq!(query.generation, 1);
            let mut nodes = 0;
            query.plan.walk(&mut |_| nodes += 1);
            assert!(nodes >= 1);
        }
    }

    #[test]
    fn generation_bumps_with_replanning() {
        let server = crate::ServerShared::new(1, 1000);
        register_demo_catalog(&server);
        assert_eq!(build_statement(&server, 5).generation, 1);
        assert_eq!(build_statement(&server, 105).generation, 2);
    }
}
