use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use dwh_core::{LoadError, Table, Value};
use tokio::sync::Mutex;

/// Relational warehouse driver seam.
///
/// Writes are transactional: nothing written through `bulk_write` is visible to
/// readers until `commit` succeeds.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn select_all(&self, table: &str) -> Result<Table, LoadError>;

    async fn columns(&self, table: &str) -> Result<Vec<String>, LoadError>;

    async fn last_key(&self, table: &str, key_column: &str) -> Result<i64, LoadError>;

    async fn bulk_write(&self, rows: &Table, table: &str) -> Result<(), LoadError>;

    async fn commit(&self) -> Result<(), LoadError>;
}

#[derive(Debug, Default)]
struct MemoryWarehouse {
    committed: BTreeMap<String, Table>,
    pending: Vec<(String, Table)>,
    failing_tables: BTreeSet<String>,
    commits: usize,
}

#[derive(Debug, Default)]
pub struct MemoryTableStore {
    state: Mutex<MemoryWarehouse>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, table: Table) -> Self {
        self.state
            .get_mut()
            .committed
            .insert(name.to_string(), table);
        self
    }

    pub fn failing_writes_to(mut self, name: &str) -> Self {
        self.state.get_mut().failing_tables.insert(name.to_string());
        self
    }

    pub async fn table(&self, name: &str) -> Option<Table> {
        self.state.lock().await.committed.get(name).cloned()
    }

    pub async fn commit_count(&self) -> usize {
        self.state.lock().await.commits
    }

    pub async fn pending_writes(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

fn unknown_table(table: &str) -> LoadError {
    LoadError::transport(
        format!("querying warehouse table {table}"),
        format!("relation \"{table}\" does not exist"),
    )
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn select_all(&self, table: &str) -> Result<Table, LoadError> {
        let state = self.state.lock().await;
        state
            .committed
            .get(table)
            .cloned()
            .ok_or_else(|| unknown_table(table))
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>, LoadError> {
        let state = self.state.lock().await;
        state
            .committed
            .get(table)
            .map(|t| t.columns().to_vec())
            .ok_or_else(|| unknown_table(table))
    }

    async fn last_key(&self, table: &str, key_column: &str) -> Result<i64, LoadError> {
        let state = self.state.lock().await;
        let snapshot = state
            .committed
            .get(table)
            .ok_or_else(|| unknown_table(table))?;
        Ok(snapshot.max_int(key_column)?.unwrap_or(0))
    }

    async fn bulk_write(&self, rows: &Table, table: &str) -> Result<(), LoadError> {
        let mut state = self.state.lock().await;
        if state.failing_tables.contains(table) {
            return Err(LoadError::transport(
                format!("writing {} rows to {table}", rows.len()),
                "connection reset by peer",
            ));
        }
        let target = state
            .committed
            .get(table)
            .ok_or_else(|| unknown_table(table))?;
        if let Some(extra) = rows.columns().iter().find(|c| !target.has_column(c)) {
            return Err(LoadError::SchemaMismatch {
                table: table.to_string(),
                detail: format!("column {extra} does not exist"),
            });
        }

        let mut aligned = Table::new(target.columns().to_vec());
        for row in rows.iter_rows() {
            let values = target
                .columns()
                .iter()
                .map(|c| row.get(c).clone())
                .collect::<Vec<Value>>();
            aligned.push_row(values)?;
        }
        state.pending.push((table.to_string(), aligned));
        Ok(())
    }

    async fn commit(&self) -> Result<(), LoadError> {
        let mut state = self.state.lock().await;
        let pending = std::mem::take(&mut state.pending);
        for (name, rows) in pending {
            if let Some(target) = state.committed.get_mut(&name) {
                for row in rows.into_rows() {
                    target.push_row(row)?;
                }
            }
        }
        state.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryTableStore {
        MemoryTableStore::new().with_table(
            "dim_city",
            Table::from_rows(
                ["city_id", "city"],
                vec![vec![Value::Int(4), Value::text("Kraków")]],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn writes_stay_invisible_until_commit() {
        let store = store();
        let rows = Table::from_rows(["city", "city_id"], vec![vec![Value::text("Gdańsk"), Value::Int(5)]])
            .unwrap();
        store.bulk_write(&rows, "dim_city").await.unwrap();
        assert_eq!(store.select_all("dim_city").await.unwrap().len(), 1);
        assert_eq!(store.last_key("dim_city", "city_id").await.unwrap(), 4);

        store.commit().await.unwrap();
        let snapshot = store.select_all("dim_city").await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.value(1, "city"), Some(&Value::text("Gdańsk")));
        assert_eq!(store.last_key("dim_city", "city_id").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn unknown_columns_and_tables_are_rejected() {
        let store = store();
        let rows = Table::from_rows(["zip"], vec![vec![Value::text("00-001")]]).unwrap();
        assert!(matches!(
            store.bulk_write(&rows, "dim_city").await,
            Err(LoadError::SchemaMismatch { .. })
        ));
        assert!(store.columns("dim_missing").await.is_err());
    }

    #[tokio::test]
    async fn empty_tables_report_zero_last_key() {
        let store = MemoryTableStore::new().with_table("fact_salary", Table::new(["salary_id"]));
        assert_eq!(store.last_key("fact_salary", "salary_id").await.unwrap(), 0);
    }
}
