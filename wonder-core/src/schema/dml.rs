//! Parameterized INSERT/UPDATE/SELECT statement text for the tables
//! `ddl::generate_tables` produces. Root (section/branch) tables always
//! hold exactly one logical document, stored as the single row with
//! `rowid_pk = 1`; child tables hold one row per array element, linked by
//! `parent_rowid` and ordered by `item_index`.

use serde_json::Value as JsonValue;

pub const ROOT_ROW_ID: i64 = 1;

/// `INSERT OR IGNORE` the singleton root row, then `UPDATE` one column.
/// Returned as two statements because SQLite's `UPSERT` syntax varies by
/// version and this is unambiguous either way.
pub fn upsert_root_row(table: &str) -> String {
    format!("INSERT OR IGNORE INTO {table} (rowid_pk) VALUES ({ROOT_ROW_ID})")
}

pub fn update_scalar_column(table: &str, column: &str) -> String {
    format!("UPDATE {table} SET {column} = ? WHERE rowid_pk = {ROOT_ROW_ID}")
}

pub fn select_scalar_column(table: &str, column: &str) -> String {
    format!("SELECT {column} FROM {table} WHERE rowid_pk = {ROOT_ROW_ID}")
}

pub fn select_scalar_columns(table: &str, columns: &[String]) -> String {
    format!(
        "SELECT {} FROM {table} WHERE rowid_pk = {ROOT_ROW_ID}",
        columns.join(", ")
    )
}

/// Delete every row of a child table belonging to `parent_rowid` — the
/// first half of an atomic array replace (spec §4.1: "array assignments
/// replace the child table contents for that path atomically").
pub fn delete_child_rows(table: &str, parent_rowid: i64) -> String {
    format!("DELETE FROM {table} WHERE parent_rowid = {parent_rowid}")
}

pub fn insert_child_row(table: &str, columns: &[String]) -> (String, usize) {
    let mut cols = vec!["parent_rowid".to_string(), "item_index".to_string()];
    cols.extend(columns.iter().cloned());
    let placeholders: Vec<&str> = cols.iter().map(|_| "?").collect();
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        cols.join(", "),
        placeholders.join(", ")
    );
    (sql, cols.len())
}

pub fn select_child_rows(table: &str, parent_rowid: i64, columns: &[String]) -> String {
    let select_list = if columns.is_empty() {
        "rowid_pk".to_string()
    } else {
        format!("rowid_pk, {}", columns.join(", "))
    };
    format!(
        "SELECT {select_list} FROM {table} WHERE parent_rowid = {parent_rowid} ORDER BY item_index ASC"
    )
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

/// Coerce a scalar JSON value to the primitive form the store layer binds
/// (booleans become 0/1 integers per spec §4.1 mapping rules).
pub fn scalar_to_bindable(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Bool(b) => JsonValue::from(if *b { 1 } else { 0 }),
        other => other.clone(),
    }
}
