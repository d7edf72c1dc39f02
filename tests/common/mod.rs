#![allow(dead_code)]

use stepplan::database::{Catalog, ExpressionType, MemoryCatalog, NodeId, PartitionScheme, SysTable};
use stepplan::planner::{FromRelation, Leaf};

pub const COORDINATOR: NodeId = 0;
pub const NODES: [NodeId; 4] = [1, 2, 3, 4];

pub fn catalog() -> MemoryCatalog {
    MemoryCatalog::new(COORDINATOR, &NODES)
        .with_table(
            SysTable::new("orders", PartitionScheme::Hash, &NODES)
                .with_column("order_id", ExpressionType::bigint())
                .with_column("customer_id", ExpressionType::int())
                .with_column("region_id", ExpressionType::int())
                .with_column("amount", ExpressionType::numeric(12, 2))
                .partitioned_on("customer_id")
                .with_primary_key(&["order_id"]),
        )
        .with_table(
            SysTable::new("customers", PartitionScheme::Hash, &NODES)
                .with_column("customer_id", ExpressionType::int())
                .with_column("name", ExpressionType::varchar(40))
                .partitioned_on("customer_id")
                .with_primary_key(&["customer_id"]),
        )
        .with_table(
            SysTable::new("lookup_region", PartitionScheme::Lookup, &NODES)
                .with_column("region_id", ExpressionType::int())
                .with_column("name", ExpressionType::varchar(20)),
        )
        .with_table(
            SysTable::new("nokey_t", PartitionScheme::Robin, &NODES)
                .with_column("a", ExpressionType::int())
                .with_column("b", ExpressionType::text()),
        )
}

/// Leaf reading `table` (aliased by its first letter) on every node into
/// `TMP<id>`.
pub fn scan(id: usize, table: &str, columns: &[&str]) -> Leaf {
    let alias = &table[..1];
    let sys = catalog().table(table);
    let mut leaf = Leaf::new(id, &format!("TMP{id}"))
        .with_table(table)
        .with_nodes(&NODES)
        .with_from(FromRelation::new(table, alias));
    for c in columns {
        let ty = sys.as_ref().and_then(|t| t.column(c)).map(|col| col.ty);
        leaf.append_projection(c, format!("{alias}.{c}"), ty, false).unwrap();
    }
    leaf
}
