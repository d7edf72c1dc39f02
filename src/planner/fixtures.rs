//! Shared catalog and leaf builders for the planner tests.

use crate::database::{ExpressionType, MemoryCatalog, NodeId, PartitionScheme, SysTable};
use crate::planner::{FromRelation, Leaf};

pub const COORDINATOR: NodeId = 0;
pub const NODES: [NodeId; 4] = [1, 2, 3, 4];
pub const SINGLE_NODE: NodeId = 3;

pub fn catalog() -> MemoryCatalog {
    MemoryCatalog::new(COORDINATOR, &NODES)
        .with_table(
            SysTable::new("orders", PartitionScheme::Hash, &NODES)
                .with_column("order_id", ExpressionType::bigint())
                .with_column("customer_id", ExpressionType::int())
                .with_column("region_id", ExpressionType::int())
                .with_column("status", ExpressionType::varchar(10))
                .with_column("amount", ExpressionType::numeric(12, 2))
                .partitioned_on("customer_id")
                .with_primary_key(&["order_id"]),
        )
        .with_table(
            SysTable::new("customers", PartitionScheme::Hash, &NODES)
                .with_column("customer_id", ExpressionType::int())
                .with_column("name", ExpressionType::varchar(40))
                .with_column("region_id", ExpressionType::int())
                .partitioned_on("customer_id")
                .with_primary_key(&["customer_id"]),
        )
        .with_table(
            SysTable::new("lookup_region", PartitionScheme::Lookup, &NODES)
                .with_column("region_id", ExpressionType::int())
                .with_column("name", ExpressionType::varchar(20))
                .with_primary_key(&["region_id"]),
        )
        .with_table(
            SysTable::new("single_t", PartitionScheme::One, &[SINGLE_NODE])
                .with_column("id", ExpressionType::int())
                .with_column("v", ExpressionType::text()),
        )
        .with_table(
            SysTable::new("robin_t", PartitionScheme::Robin, &NODES)
                .with_column("id", ExpressionType::int())
                .with_column("order_id", ExpressionType::bigint())
                .with_unique_index(&["id"]),
        )
        .with_table(
            SysTable::new("nokey_t", PartitionScheme::Robin, &NODES)
                .with_column("a", ExpressionType::int())
                .with_column("b", ExpressionType::text()),
        )
}

/// Leaf scanning `table` (aliased by its first letter) into `TMP<id>`,
/// projecting `columns` with their catalog types.
pub fn scan_leaf(id: usize, table: &str, columns: &[&str], nodes: &[NodeId]) -> Leaf {
    let alias = &table[..1];
    let catalog = catalog();
    let sys = crate::database::Catalog::table(&catalog, table);
    let mut leaf = Leaf::new(id, &format!("TMP{id}"))
        .with_table(table)
        .with_nodes(nodes)
        .with_from(FromRelation::new(table, alias));
    for c in columns {
        let ty = sys.as_ref().and_then(|t| t.column(c)).map(|col| col.ty).unwrap_or_else(ExpressionType::text);
        leaf.append_projection(c, format!("{alias}.{c}"), Some(ty), false)
            .expect("fixture projection");
    }
    leaf
}
