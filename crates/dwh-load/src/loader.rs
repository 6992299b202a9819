use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use dwh_core::{canonical_member_list, KeyType, LoadError, Table, Value, LIST_DELIMITER};
use dwh_storage::{archive_table, ArchivedTable, ObjectStore, TableStore};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bridge::build_bridge;
use crate::config::LoaderConfig;
use crate::reconcile::build_dimension;
use crate::tracker::IncrementalTracker;

#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub run_id: Uuid,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
    pub fact_table: String,
    pub fact_rows: usize,
    pub new_rows: BTreeMap<String, usize>,
    pub archived: Vec<ArchivedTable>,
    pub processed_units: Vec<String>,
}

struct Snapshots {
    dimensions: Vec<Table>,
    bridges: Vec<(Table, Table)>,
}

struct Staged {
    table: String,
    rows: Table,
}

/// Loads one transformed batch into the star schema.
///
/// Dimensions resolve first, then bridges, then facts. Nothing is written until
/// every table is computed; the manifest is updated only after the warehouse
/// commit succeeds.
pub struct StarSchemaLoader {
    config: LoaderConfig,
    objects: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn TableStore>,
    tracker: IncrementalTracker,
    processed_units: Vec<String>,
}

impl StarSchemaLoader {
    pub fn new(
        config: LoaderConfig,
        objects: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn TableStore>,
        processed_units: Vec<String>,
    ) -> Self {
        let tracker = IncrementalTracker::new(objects.clone(), config.manifest.schema());
        Self {
            config,
            objects,
            warehouse,
            tracker,
            processed_units,
        }
    }

    pub async fn generate_facts_and_dims(
        &self,
        batch: Option<Table>,
    ) -> Result<Option<LoadReport>, LoadError> {
        let Some(batch) = batch else {
            return Ok(None);
        };
        if batch.is_empty() {
            warn!("the transformed batch is empty; no data was loaded to the warehouse");
            return Ok(None);
        }
        let run_id = Uuid::new_v4();
        self.load(batch, run_id)
            .instrument(info_span!("load_run", %run_id))
            .await
            .map(Some)
    }

    async fn load(&self, mut batch: Table, run_id: Uuid) -> Result<LoadReport, LoadError> {
        let started_at = Utc::now().naive_utc();
        info!(rows = batch.len(), "creating fact and dimension tables");
        self.tracker.verify(&self.config.manifest.key).await?;
        let snapshots = self.read_snapshots().await?;

        let mut staged = Vec::new();
        for (spec, mut snapshot) in self.config.dimensions.iter().zip(snapshots.dimensions) {
            snapshot.canonicalize_column(&spec.natural_key, spec.key_type)?;
            batch.canonicalize_column(&spec.natural_key, spec.key_type)?;
            let outcome =
                build_dimension(&batch, &snapshot, &spec.natural_key, &spec.surrogate_key)?;
            batch = batch.left_join(
                &outcome.enriched,
                &spec.natural_key,
                &[spec.surrogate_key.as_str()],
            )?;
            info!(
                table = %spec.dim_table,
                new_rows = outcome.new_rows.len(),
                "dimension reconciled"
            );
            staged.push(Staged {
                table: spec.dim_table.clone(),
                rows: outcome.new_rows,
            });
        }

        for (spec, (mut dim_snapshot, bridge_snapshot)) in
            self.config.bridges.iter().zip(snapshots.bridges)
        {
            dim_snapshot.canonicalize_column(&spec.natural_key, KeyType::Text)?;
            batch.map_column(&spec.natural_key, |v| canonical_member_list(v, LIST_DELIMITER))?;
            let outcome = build_bridge(
                &batch,
                &dim_snapshot,
                &bridge_snapshot,
                &spec.natural_key,
                &spec.surrogate_key,
                &spec.group_key,
            )?;
            batch = batch.left_join(
                &outcome.groups.enriched,
                &spec.natural_key,
                &[spec.group_key.as_str()],
            )?;
            info!(
                dim_table = %spec.dim_table,
                bridge_table = %spec.bridge_table,
                new_members = outcome.dimension.new_rows.len(),
                new_pairs = outcome.new_bridge_rows.len(),
                "bridge reconciled"
            );
            staged.push(Staged {
                table: spec.dim_table.clone(),
                rows: outcome.dimension.new_rows,
            });
            staged.push(Staged {
                table: spec.bridge_table.clone(),
                rows: outcome.new_bridge_rows,
            });
        }

        let fact = self.build_facts(batch).await?;
        let new_rows = staged
            .iter()
            .map(|s| (s.table.clone(), s.rows.len()))
            .collect::<BTreeMap<_, _>>();
        let fact_rows = fact.len();
        staged.retain(|s| !s.rows.is_empty());
        staged.push(Staged {
            table: self.config.fact.table.clone(),
            rows: fact,
        });

        let archived = self.persist(&staged).await?;
        self.tracker
            .record_units(&self.config.manifest.key, &self.processed_units)
            .await?;

        let finished_at = Utc::now().naive_utc();
        info!(
            fact_table = %self.config.fact.table,
            fact_rows,
            new_rows = ?new_rows,
            units = self.processed_units.len(),
            "job finished"
        );
        Ok(LoadReport {
            run_id,
            started_at,
            finished_at,
            fact_table: self.config.fact.table.clone(),
            fact_rows,
            new_rows,
            archived,
            processed_units: self.processed_units.clone(),
        })
    }

    async fn read_snapshots(&self) -> Result<Snapshots, LoadError> {
        let mut dimensions = Vec::with_capacity(self.config.dimensions.len());
        for spec in &self.config.dimensions {
            dimensions.push(self.warehouse.select_all(&spec.dim_table).await?);
        }
        let mut bridges = Vec::with_capacity(self.config.bridges.len());
        for spec in &self.config.bridges {
            let dim = self.warehouse.select_all(&spec.dim_table).await?;
            let bridge = self.warehouse.select_all(&spec.bridge_table).await?;
            bridges.push((dim, bridge));
        }
        Ok(Snapshots {
            dimensions,
            bridges,
        })
    }

    async fn build_facts(&self, batch: Table) -> Result<Table, LoadError> {
        let table = &self.config.fact.table;
        let columns = self.warehouse.columns(table).await?;
        let last_key = self.warehouse.last_key(table, &self.config.fact.key).await?;
        assign_fact_keys(batch, table, &self.config.fact.key, &columns, last_key)
    }

    async fn persist(&self, staged: &[Staged]) -> Result<Vec<ArchivedTable>, LoadError> {
        let archived_at = Utc::now().naive_utc();
        let archive = &self.config.archive;
        let mut archived = Vec::with_capacity(staged.len());
        for s in staged {
            archived.push(
                archive_table(
                    self.objects.as_ref(),
                    &archive.target_path,
                    archive.format,
                    &s.table,
                    &s.rows,
                    archived_at,
                )
                .await?,
            );
        }
        for s in staged {
            self.warehouse.bulk_write(&s.rows, &s.table).await?;
        }
        self.warehouse.commit().await?;
        Ok(archived)
    }
}

/// Numbers fact rows after `last_key` and shapes them to the fact table's columns.
///
/// `columns` is the fact table's column order; its first column must be `fact_key`.
pub fn assign_fact_keys(
    mut batch: Table,
    fact_table: &str,
    fact_key: &str,
    columns: &[String],
    last_key: i64,
) -> Result<Table, LoadError> {
    match columns.first() {
        Some(first) if first == fact_key => {}
        first => {
            error!(
                fact_table,
                fact_key,
                first_column = ?first,
                "fact table does not start with its key column"
            );
            return Err(LoadError::SchemaMismatch {
                table: fact_table.to_string(),
                detail: format!("first column is {first:?}, expected {fact_key}"),
            });
        }
    }

    let keys = (1..=batch.len() as i64)
        .map(|position| Value::Int(last_key + position))
        .collect();
    batch.set_column(fact_key, keys)?;

    let missing = columns
        .iter()
        .filter(|c| !batch.has_column(c))
        .cloned()
        .collect::<Vec<_>>();
    if !missing.is_empty() {
        error!(fact_table, missing = ?missing, "fact columns missing from the batch");
        return Err(LoadError::SchemaMismatch {
            table: fact_table.to_string(),
            detail: format!("batch lacks columns {missing:?}"),
        });
    }
    batch.select(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact_columns() -> Vec<String> {
        ["salary_id", "offer_id", "employer_id", "salary"]
            .map(String::from)
            .to_vec()
    }

    fn batch() -> Table {
        Table::from_rows(
            ["salary", "offer_id", "employer_id", "employer_name"],
            vec![
                vec![Value::Float(5000.0), Value::text("a"), Value::Int(1), Value::text("Acme")],
                vec![Value::Float(6000.0), Value::text("b"), Value::Int(2), Value::text("Beta")],
                vec![Value::Float(7000.0), Value::text("c"), Value::Int(1), Value::text("Acme")],
            ],
        )
        .unwrap()
    }

    #[test]
    fn fact_keys_continue_after_last_key_in_row_order() {
        let fact = assign_fact_keys(batch(), "fact_salary", "salary_id", &fact_columns(), 10).unwrap();
        assert_eq!(fact.columns(), fact_columns().as_slice());
        assert_eq!(
            fact.column("salary_id").unwrap(),
            vec![Value::Int(11), Value::Int(12), Value::Int(13)]
        );
        assert_eq!(fact.value(2, "offer_id"), Some(&Value::text("c")));
    }

    #[test]
    fn fact_table_must_start_with_its_key() {
        let mut columns = fact_columns();
        columns.rotate_left(1);
        let err = assign_fact_keys(batch(), "fact_salary", "salary_id", &columns, 0).unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));

        let err = assign_fact_keys(batch(), "fact_salary", "salary_id", &[], 0).unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));
    }

    #[test]
    fn missing_fact_columns_are_reported() {
        let mut columns = fact_columns();
        columns.push("location_group_key".to_string());
        let err = assign_fact_keys(batch(), "fact_salary", "salary_id", &columns, 0).unwrap_err();
        assert!(
            matches!(err, LoadError::SchemaMismatch { detail, .. } if detail.contains("location_group_key"))
        );
    }
}
