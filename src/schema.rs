//! The fixed set of local databases the point-of-sale app owns, with the
//! schema version each one is opened at.

use crate::storage::{DatabaseSchema, StoreSchema};
use serde::{Deserialize, Serialize};

pub const POS_DB: &str = "posDB";
pub const SALES_DB: &str = "salesDB";
pub const CREDIT_DB: &str = "creditDB";

/// Oldest POS schema this build can open.
pub const MIN_POS_SCHEMA_VERSION: u32 = 5;
/// POS schema that introduced product groups.
pub const CURRENT_POS_SCHEMA_VERSION: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaCatalog {
    databases: Vec<DatabaseSchema>,
}

impl SchemaCatalog {
    pub fn new(databases: Vec<DatabaseSchema>) -> Self {
        Self { databases }
    }

    /// Catalog of the point-of-sale databases with `posDB` at `pos_version`.
    ///
    /// Version 5 predates product groups; 6 and later carry
    /// `productGroups` and `productGroupRelations`.
    pub fn point_of_sale(pos_version: u32) -> Self {
        let mut pos_stores = vec![
            StoreSchema::auto_increment("products", "id"),
            StoreSchema::auto_increment("categories", "id"),
            StoreSchema::auto_increment("cashRegisterSessions", "id"),
            StoreSchema::auto_increment("cashTransactions", "id"),
            StoreSchema::keyed("settings", "key"),
        ];
        if pos_version >= CURRENT_POS_SCHEMA_VERSION {
            pos_stores.push(StoreSchema::auto_increment("productGroups", "id"));
            pos_stores.push(StoreSchema::keyless("productGroupRelations"));
        }

        Self::new(vec![
            DatabaseSchema {
                name: POS_DB.to_string(),
                version: pos_version,
                stores: pos_stores,
            },
            DatabaseSchema {
                name: SALES_DB.to_string(),
                version: 1,
                stores: vec![
                    StoreSchema::keyed("sales", "id"),
                    StoreSchema::keyed("suspendedSales", "id"),
                ],
            },
            DatabaseSchema {
                name: CREDIT_DB.to_string(),
                version: 1,
                stores: vec![
                    StoreSchema::auto_increment("customers", "id"),
                    StoreSchema::auto_increment("transactions", "id"),
                ],
            },
        ])
    }

    pub fn databases(&self) -> &[DatabaseSchema] {
        &self.databases
    }

    pub fn database(&self, name: &str) -> Option<&DatabaseSchema> {
        self.databases.iter().find(|db| db.name == name)
    }

    pub fn version_of(&self, name: &str) -> Option<u32> {
        self.database(name).map(|db| db.version)
    }

    pub fn names(&self) -> Vec<String> {
        self.databases.iter().map(|db| db.name.clone()).collect()
    }
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::point_of_sale(CURRENT_POS_SCHEMA_VERSION)
    }
}
