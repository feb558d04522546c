//! Schema-on-API-widening reconciliation.
//!
//! Before a sub-task's first batch touches a table, the synchronizer
//! compares the payload's observed shape against the declared schema on
//! record. New columns are added nullable at their widest-allowed type;
//! numeric conflicts widen Int to Float; anything the engine cannot widen
//! fails the sub-task with `WIDEN_TYPE_FAILED`. All DDL per table runs
//! under one async lock, and every action lands in the audit table.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{PlatformError, Result};
use crate::plugins::{ColumnType, Plugin};
use crate::store::MetaDb;

pub const ACTION_CREATE_TABLE: &str = "CREATE_TABLE";
pub const ACTION_ADD_COLUMN: &str = "ADD_COLUMN";
pub const ACTION_WIDEN_TYPE: &str = "WIDEN_TYPE";
pub const ACTION_WIDEN_TYPE_FAILED: &str = "WIDEN_TYPE_FAILED";

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchemaAuditEntry {
    pub table: String,
    pub column: String,
    pub action: String,
    pub old_type: Option<String>,
    pub new_type: Option<String>,
    pub at: String,
    pub reason: Option<String>,
}

pub struct SchemaSynchronizer {
    db: MetaDb,
    clock: Arc<dyn Clock>,
    table_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SchemaSynchronizer {
    pub fn new(db: MetaDb, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            table_locks: Mutex::new(HashMap::new()),
        }
    }

    fn table_lock(&self, table: &str) -> Arc<AsyncMutex<()>> {
        self.table_locks
            .lock()
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Reconcile the destination table with an observed payload sample.
    pub async fn reconcile(
        &self,
        plugin: &Plugin,
        sample: &[serde_json::Map<String, Value>],
    ) -> Result<()> {
        let lock = self.table_lock(&plugin.table);
        let _guard = lock.lock().await;

        let observed = infer_columns(sample);
        let mut declared = self.load_meta(&plugin.table)?;

        if declared.is_empty() {
            self.create_table(plugin, &observed)?;
            return Ok(());
        }

        for (column, observed_ty) in &observed {
            match declared.get(column) {
                None => {
                    self.add_column(&plugin.table, column, *observed_ty)?;
                    declared.insert(column.clone(), *observed_ty);
                }
                Some(decl_ty) if needs_widening(*decl_ty, *observed_ty) => {
                    match widen(*decl_ty, *observed_ty) {
                        Some(target) => {
                            self.widen_column(&plugin.table, column, *decl_ty, target)?;
                            declared.insert(column.clone(), target);
                        }
                        None => {
                            let reason = format!(
                                "cannot widen {} from {} to {}",
                                column,
                                decl_ty.as_str(),
                                observed_ty.as_str()
                            );
                            self.audit(
                                &plugin.table,
                                column,
                                ACTION_WIDEN_TYPE_FAILED,
                                Some(decl_ty.as_str()),
                                Some(observed_ty.as_str()),
                                Some(&reason),
                            )?;
                            warn!(table = %plugin.table, column, "WIDEN_TYPE_FAILED");
                            return Err(PlatformError::Schema(format!(
                                "WIDEN_TYPE_FAILED: {reason}"
                            )));
                        }
                    }
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn create_table(
        &self,
        plugin: &Plugin,
        observed: &HashMap<String, ColumnType>,
    ) -> Result<()> {
        // Declared columns first, in declaration order, then any observed
        // extras the declaration did not know about.
        let mut columns: Vec<(String, ColumnType, bool)> = plugin
            .schema
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.ty, c.nullable))
            .collect();
        for (name, ty) in observed {
            if plugin.schema.column(name).is_none() {
                columns.push((name.clone(), *ty, true));
            }
        }

        let mut ddl_cols: Vec<String> = columns
            .iter()
            .map(|(name, ty, nullable)| {
                if *nullable {
                    format!("{name} {}", ty.sql())
                } else {
                    format!("{name} {} NOT NULL", ty.sql())
                }
            })
            .collect();
        ddl_cols.push("_version INTEGER NOT NULL".to_string());

        let table = &plugin.table;
        let mut ddl = format!("CREATE TABLE IF NOT EXISTS {table} ({});", ddl_cols.join(", "));
        if !plugin.schema.order_key.is_empty() {
            ddl.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_key ON {table} ({}, _version DESC);",
                plugin.schema.order_key.join(", ")
            ));
        }
        if let Some(partition) = &plugin.schema.partition_key {
            ddl.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_part ON {table} ({partition});"
            ));
        }

        {
            let conn = self.db.conn();
            conn.execute_batch(&ddl)?;
            let mut stmt = conn.prepare_cached(
                "INSERT OR REPLACE INTO table_meta (table_name, column_name, decl_type, nullable)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (name, ty, nullable) in &columns {
                stmt.execute(rusqlite::params![table, name, ty.as_str(), *nullable as i64])?;
            }
        }
        self.audit(table, "*", ACTION_CREATE_TABLE, None, None, None)?;
        info!(table = %table, columns = columns.len(), "ods table created");
        Ok(())
    }

    fn add_column(&self, table: &str, column: &str, ty: ColumnType) -> Result<()> {
        {
            let conn = self.db.conn();
            conn.execute_batch(&format!(
                "ALTER TABLE {table} ADD COLUMN {column} {}",
                ty.sql()
            ))?;
            conn.execute(
                "INSERT OR REPLACE INTO table_meta (table_name, column_name, decl_type, nullable)
                 VALUES (?1, ?2, ?3, 1)",
                rusqlite::params![table, column, ty.as_str()],
            )?;
        }
        self.audit(
            table,
            column,
            ACTION_ADD_COLUMN,
            None,
            Some(ty.as_str()),
            Some("new column observed in payload"),
        )?;
        info!(table, column, ty = ty.as_str(), "column added");
        Ok(())
    }

    fn widen_column(
        &self,
        table: &str,
        column: &str,
        from: ColumnType,
        to: ColumnType,
    ) -> Result<()> {
        // Sqlite column affinity already accepts the wider values; the
        // declared type in the registry is the contract that changes.
        self.db.conn().execute(
            "UPDATE table_meta SET decl_type = ?1 WHERE table_name = ?2 AND column_name = ?3",
            rusqlite::params![to.as_str(), table, column],
        )?;
        self.audit(
            table,
            column,
            ACTION_WIDEN_TYPE,
            Some(from.as_str()),
            Some(to.as_str()),
            Some("payload exceeded declared type"),
        )?;
        info!(table, column, from = from.as_str(), to = to.as_str(), "column widened");
        Ok(())
    }

    fn load_meta(&self, table: &str) -> Result<HashMap<String, ColumnType>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT column_name, decl_type FROM table_meta WHERE table_name = ?1",
        )?;
        let rows = stmt.query_map([table], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut meta = HashMap::new();
        for row in rows {
            let (name, ty) = row?;
            if let Some(ty) = ColumnType::parse(&ty) {
                meta.insert(name, ty);
            }
        }
        Ok(meta)
    }

    fn audit(
        &self,
        table: &str,
        column: &str,
        action: &str,
        old_type: Option<&str>,
        new_type: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO schema_audit (table_name, column_name, action, old_type, new_type, at, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                table,
                column,
                action,
                old_type,
                new_type,
                self.clock.now().to_rfc3339(),
                reason
            ],
        )?;
        Ok(())
    }

    pub fn audit_entries(&self, table: &str) -> Result<Vec<SchemaAuditEntry>> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT table_name, column_name, action, old_type, new_type, at, reason
             FROM schema_audit WHERE table_name = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([table], |r| {
            Ok(SchemaAuditEntry {
                table: r.get(0)?,
                column: r.get(1)?,
                action: r.get(2)?,
                old_type: r.get(3)?,
                new_type: r.get(4)?,
                at: r.get(5)?,
                reason: r.get(6)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }
}

/// Widest type observed per column across the sample.
fn infer_columns(sample: &[serde_json::Map<String, Value>]) -> HashMap<String, ColumnType> {
    let mut observed: HashMap<String, ColumnType> = HashMap::new();
    for row in sample {
        for (name, value) in row {
            let Some(ty) = infer_type(value) else {
                continue;
            };
            observed
                .entry(name.clone())
                .and_modify(|current| *current = join_types(*current, ty))
                .or_insert(ty);
        }
    }
    observed
}

fn infer_type(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(ColumnType::Int),
        Value::Number(n) => {
            if n.as_i64().is_some() || n.as_u64().is_some() {
                Some(ColumnType::Int)
            } else {
                Some(ColumnType::Float)
            }
        }
        Value::String(_) | Value::Array(_) | Value::Object(_) => Some(ColumnType::Str),
    }
}

/// Join of two observations: mixed numerics widen to float, anything
/// ambiguous beyond that falls back to string.
fn join_types(a: ColumnType, b: ColumnType) -> ColumnType {
    use ColumnType::*;
    if a == b {
        return a;
    }
    match (a, b) {
        (Int, Float) | (Float, Int) => Float,
        (Date, Str) | (Str, Date) => Str,
        _ => Str,
    }
}

fn needs_widening(declared: ColumnType, observed: ColumnType) -> bool {
    use ColumnType::*;
    match (declared, observed) {
        // Float accepts Int, Str accepts anything, Date accepts its text form.
        (Float, Int) | (Str, _) | (Date, Str) | (Date, Date) => false,
        (a, b) if a == b => false,
        _ => true,
    }
}

/// The widening matrix this engine supports. `None` means the migration is
/// not expressible without a rewrite, which the loader refuses to do.
fn widen(declared: ColumnType, observed: ColumnType) -> Option<ColumnType> {
    use ColumnType::*;
    match (declared, observed) {
        (Int, Float) => Some(Float),
        // Retyping stored numerics as text would change their meaning.
        (Int, Str) | (Float, Str) => None,
        (Date, Int) | (Date, Float) => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::plugins::builtin::test_support::stub_plugin;
    use serde_json::json;

    fn sync() -> (SchemaSynchronizer, MetaDb) {
        let db = MetaDb::open_in_memory().unwrap();
        (
            SchemaSynchronizer::new(db.clone(), Arc::new(SystemClock)),
            db,
        )
    }

    fn sample_row(pairs: &[(&str, Value)]) -> Vec<serde_json::Map<String, Value>> {
        let mut m = serde_json::Map::new();
        for (k, v) in pairs {
            m.insert((*k).to_string(), v.clone());
        }
        vec![m]
    }

    #[tokio::test]
    async fn first_contact_creates_table_with_audit() {
        let (sync, db) = sync();
        let plugin = stub_plugin("bar");
        let sample = sample_row(&[
            ("ts_code", json!("000001.SZ")),
            ("trade_date", json!("20260109")),
            ("close", json!(10.5)),
        ]);

        sync.reconcile(&plugin, &sample).await.unwrap();

        let n: i64 = db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 'ods_bar'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);

        let audit = sync.audit_entries("ods_bar").unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, ACTION_CREATE_TABLE);
    }

    #[tokio::test]
    async fn new_column_added_nullable_with_widest_type() {
        let (sync, _db) = sync();
        let plugin = stub_plugin("bar");
        sync.reconcile(&plugin, &sample_row(&[("ts_code", json!("x"))]))
            .await
            .unwrap();

        let sample = sample_row(&[("ts_code", json!("x")), ("vwap", json!(3))]);
        sync.reconcile(&plugin, &sample).await.unwrap();

        let audit = sync.audit_entries("ods_bar").unwrap();
        let add = audit.iter().find(|e| e.action == ACTION_ADD_COLUMN).unwrap();
        assert_eq!(add.column, "vwap");
        assert_eq!(add.new_type.as_deref(), Some("int"));
    }

    #[tokio::test]
    async fn int_to_float_widens_once_and_is_idempotent() {
        let (sync, _db) = sync();
        let mut plugin = stub_plugin("bar");
        plugin.schema.columns.push(crate::plugins::ColumnDef::new(
            "volume",
            ColumnType::Int,
        ));

        sync.reconcile(&plugin, &sample_row(&[("volume", json!(10))]))
            .await
            .unwrap();
        sync.reconcile(&plugin, &sample_row(&[("volume", json!(10.5))]))
            .await
            .unwrap();
        // Same widening again: no-op, no fresh audit entry.
        sync.reconcile(&plugin, &sample_row(&[("volume", json!(11.5))]))
            .await
            .unwrap();

        let audit = sync.audit_entries("ods_bar").unwrap();
        let widens: Vec<_> = audit
            .iter()
            .filter(|e| e.action == ACTION_WIDEN_TYPE)
            .collect();
        assert_eq!(widens.len(), 1);
        assert_eq!(widens[0].old_type.as_deref(), Some("int"));
        assert_eq!(widens[0].new_type.as_deref(), Some("float"));
    }

    #[tokio::test]
    async fn disallowed_widening_fails_with_audit() {
        let (sync, _db) = sync();
        let plugin = stub_plugin("bar");
        sync.reconcile(&plugin, &sample_row(&[("close", json!(10.5))]))
            .await
            .unwrap();

        let err = sync
            .reconcile(&plugin, &sample_row(&[("close", json!("suspended"))]))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Schema(_)));
        assert!(err.to_string().contains("WIDEN_TYPE_FAILED"));

        let audit = sync.audit_entries("ods_bar").unwrap();
        assert!(audit.iter().any(|e| e.action == ACTION_WIDEN_TYPE_FAILED));
    }
}
