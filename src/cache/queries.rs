//! Backing Store Queries
//!
//! SQL for every query shape the engine issues, plus decoding of the rows
//! into occupied ordinals.
//!
//! Grouped shapes are fetched as flat `(parent, ordinal)` rows and grouped
//! here, so the statements stay portable across SQL dialects.

use std::collections::BTreeMap;

use tracing::warn;

use crate::domain::{EntityKind, Row};
use crate::error::Result;

/// Occupied category ordinals, ascending.
pub const OCCUPIED_CATEGORY_SLOTS: &str =
    r#"SELECT "index" FROM "productCategory" ORDER BY "index" ASC"#;

/// Occupied subcategory ordinals per category.
pub const OCCUPIED_SUBCATEGORY_SLOTS: &str =
    r#"SELECT "categoryID", "index" FROM "productSubCategory" GROUP BY 1, 2 ORDER BY 1, 2"#;

/// Every known subcategory.
pub const SUBCATEGORY_IDS: &str = r#"SELECT "id" FROM "productSubCategory""#;

/// Occupied product ordinals per subcategory.
pub const OCCUPIED_PRODUCT_SLOTS: &str =
    r#"SELECT "subCategoryID", "index" FROM "products" GROUP BY 1, 2 ORDER BY 1, 2"#;

/// Role of a user, looked up by email.
pub const ROLE_BY_USER: &str = r#"SELECT "role" FROM "users" WHERE "emailId" = $1"#;

const CATEGORY_EXISTS: &str = r#"SELECT "id" FROM "productCategory" WHERE "id" = $1"#;
const SUBCATEGORY_EXISTS: &str = r#"SELECT "id" FROM "productSubCategory" WHERE "id" = $1"#;
const PRODUCT_EXISTS: &str = r#"SELECT "id" FROM "products" WHERE "id" = $1"#;

/// Query answering a cache miss for `kind`.
pub fn lookup_query(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Role => ROLE_BY_USER,
        EntityKind::Category => CATEGORY_EXISTS,
        EntityKind::Subcategory => SUBCATEGORY_EXISTS,
        EntityKind::Product => PRODUCT_EXISTS,
    }
}

/// Reference schema for the tables the queries read.
pub const SCHEMA: [&str; 4] = [
    r#"CREATE TABLE IF NOT EXISTS "productCategory" ("id" TEXT PRIMARY KEY, "index" INTEGER NOT NULL)"#,
    r#"CREATE TABLE IF NOT EXISTS "productSubCategory" ("id" TEXT PRIMARY KEY, "categoryID" TEXT NOT NULL, "index" INTEGER NOT NULL)"#,
    r#"CREATE TABLE IF NOT EXISTS "products" ("id" TEXT PRIMARY KEY, "subCategoryID" TEXT NOT NULL, "index" INTEGER NOT NULL)"#,
    r#"CREATE TABLE IF NOT EXISTS "users" ("emailId" TEXT PRIMARY KEY, "role" TEXT NOT NULL)"#,
];

fn to_ordinal(value: i64) -> Option<u32> {
    match u32::try_from(value) {
        Ok(ordinal) if ordinal > 0 => Some(ordinal),
        _ => {
            warn!(value, "Ignoring invalid slot ordinal");
            None
        }
    }
}

/// Decode single-column ordinal rows, ascending and deduplicated.
pub fn decode_ordinals(rows: &[Row]) -> Result<Vec<u32>> {
    let mut ordinals = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(ordinal) = to_ordinal(row.integer(0)?) {
            ordinals.push(ordinal);
        }
    }
    ordinals.sort_unstable();
    ordinals.dedup();
    Ok(ordinals)
}

/// Decode `(parent, ordinal)` rows into per-parent ascending groups.
pub fn decode_grouped_ordinals(rows: &[Row]) -> Result<BTreeMap<String, Vec<u32>>> {
    let mut groups: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for row in rows {
        let parent = row.string(0)?;
        let ordinal = row.integer(1)?;
        let group = groups.entry(parent).or_default();
        if let Some(ordinal) = to_ordinal(ordinal) {
            group.push(ordinal);
        }
    }
    for group in groups.values_mut() {
        group.sort_unstable();
        group.dedup();
    }
    Ok(groups)
}

/// Decode single-column identifier rows.
pub fn decode_ids(rows: &[Row]) -> Result<Vec<String>> {
    rows.iter().map(|row| row.string(0)).collect()
}
