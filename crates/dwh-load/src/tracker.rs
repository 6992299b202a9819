use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use dwh_core::{LoadError, Table, Value};
use dwh_storage::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

pub const PROCESSED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSchema {
    pub unit_column: String,
    pub timestamp_column: String,
}

impl ManifestSchema {
    pub fn files() -> Self {
        Self {
            unit_column: "file_name".to_string(),
            timestamp_column: "datetime_of_processing".to_string(),
        }
    }

    pub fn dates() -> Self {
        Self {
            unit_column: "source_date".to_string(),
            timestamp_column: "datetime_of_processing".to_string(),
        }
    }

    pub fn columns(&self) -> Vec<String> {
        vec![self.unit_column.clone(), self.timestamp_column.clone()]
    }
}

impl Default for ManifestSchema {
    fn default() -> Self {
        Self::files()
    }
}

/// Durable record of processed work units kept as a table in the object store.
///
/// A missing manifest means nothing was processed yet.
#[derive(Clone)]
pub struct IncrementalTracker {
    store: Arc<dyn ObjectStore>,
    schema: ManifestSchema,
}

impl IncrementalTracker {
    pub fn new(store: Arc<dyn ObjectStore>, schema: ManifestSchema) -> Self {
        Self { store, schema }
    }

    pub fn schema(&self) -> &ManifestSchema {
        &self.schema
    }

    async fn load(&self, manifest_key: &str) -> Result<Option<Table>, LoadError> {
        let Some(manifest) = self.store.read(manifest_key).await? else {
            debug!(manifest_key, "no manifest yet");
            return Ok(None);
        };
        if manifest.columns().is_empty() {
            return Ok(None);
        }

        let expected = self.schema.columns();
        let mut found_sorted = manifest.columns().to_vec();
        let mut expected_sorted = expected.clone();
        found_sorted.sort();
        expected_sorted.sort();
        if found_sorted != expected_sorted {
            error!(
                manifest_key,
                found = ?manifest.columns(),
                expected = ?expected,
                "columns in manifest do not match the expected manifest columns"
            );
            return Err(LoadError::ManifestSchemaMismatch {
                key: manifest_key.to_string(),
                expected,
                found: manifest.columns().to_vec(),
            });
        }
        Ok(Some(manifest))
    }

    pub async fn verify(&self, manifest_key: &str) -> Result<(), LoadError> {
        self.load(manifest_key).await.map(|_| ())
    }

    pub async fn processed_units(&self, manifest_key: &str) -> Result<BTreeSet<String>, LoadError> {
        let Some(manifest) = self.load(manifest_key).await? else {
            return Ok(BTreeSet::new());
        };
        Ok(manifest
            .column(&self.schema.unit_column)?
            .iter()
            .filter(|unit| !unit.is_null())
            .map(Value::to_string)
            .collect())
    }

    pub async fn remaining_units<I, S>(
        &self,
        all_known_units: I,
        manifest_key: &str,
    ) -> Result<Vec<String>, LoadError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let known: BTreeSet<String> = all_known_units.into_iter().map(Into::into).collect();
        let processed = self.processed_units(manifest_key).await?;
        let remaining = known
            .into_iter()
            .filter(|unit| !processed.contains(unit))
            .collect::<Vec<_>>();
        info!(
            manifest_key,
            processed = processed.len(),
            remaining = remaining.len(),
            "computed remaining work units"
        );
        Ok(remaining)
    }

    /// Calendar days in `[start, end)` missing from the manifest, sorted ascending.
    pub async fn remaining_dates(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        manifest_key: &str,
    ) -> Result<Vec<NaiveDate>, LoadError> {
        if end <= start {
            error!(%start, %end, "end date cannot be less than or equal to start date");
            return Err(LoadError::InvalidDateRange { start, end });
        }
        let processed = self
            .processed_units(manifest_key)
            .await?
            .into_iter()
            .map(|unit| {
                let parsed = Value::text(&unit).as_date();
                parsed.ok_or_else(|| {
                    error!(manifest_key, unit = %unit, "manifest holds an unparseable date");
                    LoadError::InvalidValue {
                        column: self.schema.unit_column.clone(),
                        value: unit,
                    }
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        let remaining = start
            .iter_days()
            .take_while(|day| *day < end)
            .filter(|day| !processed.contains(day))
            .collect::<Vec<_>>();
        if remaining.is_empty() {
            info!(
                %start,
                %end,
                "all dates in the range have already been processed; remove them from the manifest to process them again"
            );
        }
        Ok(remaining)
    }

    pub async fn record_units(
        &self,
        manifest_key: &str,
        processed_units: &[String],
    ) -> Result<(), LoadError> {
        self.record_units_at(manifest_key, processed_units, Utc::now().naive_utc())
            .await
    }

    pub async fn record_units_at(
        &self,
        manifest_key: &str,
        processed_units: &[String],
        processed_at: NaiveDateTime,
    ) -> Result<(), LoadError> {
        let stamp = processed_at.format(PROCESSED_AT_FORMAT).to_string();
        let mut manifest = self
            .load(manifest_key)
            .await?
            .unwrap_or_else(|| Table::new(self.schema.columns()));

        let mut appended = Table::new(self.schema.columns());
        for unit in processed_units {
            appended.push_row(vec![Value::text(unit), Value::text(&stamp)])?;
        }
        manifest.concat(appended)?;

        self.store.write(manifest_key, &manifest).await?;
        info!(
            manifest_key,
            recorded = processed_units.len(),
            total = manifest.len(),
            "manifest updated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dwh_storage::{LocalObjectStore, MemoryObjectStore};
    use tempfile::tempdir;

    const MANIFEST: &str = "meta/transform_meta.csv";

    fn tracker(store: Arc<dyn ObjectStore>) -> IncrementalTracker {
        IncrementalTracker::new(store, ManifestSchema::files())
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[tokio::test]
    async fn missing_manifest_leaves_everything_remaining_in_ascending_order() {
        let tracker = tracker(Arc::new(MemoryObjectStore::new()));
        let remaining = tracker
            .remaining_units(["scraped/b.csv", "scraped/a.csv"], MANIFEST)
            .await
            .unwrap();
        assert_eq!(remaining, vec!["scraped/a.csv", "scraped/b.csv"]);
    }

    #[tokio::test]
    async fn recorded_units_are_excluded_across_tracker_instances() {
        let dir = tempdir().expect("tempdir");
        let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(dir.path()));
        let at = day(5).and_hms_opt(10, 30, 0).unwrap();

        tracker(store.clone())
            .record_units_at(MANIFEST, &["scraped/a.csv".to_string()], at)
            .await
            .unwrap();
        tracker(store.clone())
            .record_units(MANIFEST, &["scraped/b.csv".to_string()])
            .await
            .unwrap();

        let fresh = tracker(store.clone());
        let remaining = fresh
            .remaining_units(["scraped/a.csv", "scraped/b.csv", "scraped/c.csv"], MANIFEST)
            .await
            .unwrap();
        assert_eq!(remaining, vec!["scraped/c.csv"]);

        let manifest = store.read(MANIFEST).await.unwrap().expect("manifest");
        assert_eq!(manifest.columns(), ["file_name", "datetime_of_processing"]);
        assert_eq!(
            manifest.value(0, "datetime_of_processing"),
            Some(&Value::text("2024-01-05 10:30:00"))
        );
    }

    #[tokio::test]
    async fn foreign_manifest_columns_are_rejected() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let foreign =
            Table::from_rows(["a", "b"], vec![vec![Value::text("x"), Value::text("y")]]).unwrap();
        store.write(MANIFEST, &foreign).await.unwrap();

        let tracker = tracker(store.clone());
        let err = tracker
            .remaining_units(["scraped/a.csv"], MANIFEST)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::ManifestSchemaMismatch { .. }));
        assert!(tracker
            .record_units(MANIFEST, &["scraped/a.csv".to_string()])
            .await
            .is_err());
        assert_eq!(store.read(MANIFEST).await.unwrap(), Some(foreign));
    }

    #[tokio::test]
    async fn column_order_of_the_manifest_does_not_matter() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let swapped = Table::from_rows(
            ["datetime_of_processing", "file_name"],
            vec![vec![Value::text("2024-01-01 00:00:00"), Value::text("a.csv")]],
        )
        .unwrap();
        store.write(MANIFEST, &swapped).await.unwrap();

        let remaining = tracker(store)
            .remaining_units(["a.csv", "b.csv"], MANIFEST)
            .await
            .unwrap();
        assert_eq!(remaining, vec!["b.csv"]);
    }

    #[tokio::test]
    async fn remaining_dates_skip_processed_days() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let tracker = IncrementalTracker::new(store, ManifestSchema::dates());
        tracker
            .record_units(MANIFEST, &["2024-01-02".to_string(), "2024-01-04".to_string()])
            .await
            .unwrap();

        let remaining = tracker.remaining_dates(day(1), day(5), MANIFEST).await.unwrap();
        assert_eq!(remaining, vec![day(1), day(3)]);

        let done = tracker.remaining_dates(day(2), day(3), MANIFEST).await.unwrap();
        assert!(done.is_empty());
    }

    #[tokio::test]
    async fn unparseable_manifest_dates_fail_instead_of_being_reprocessed() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let tracker = IncrementalTracker::new(store, ManifestSchema::dates());
        tracker
            .record_units(MANIFEST, &["2024/01/02".to_string()])
            .await
            .unwrap();

        let err = tracker.remaining_dates(day(1), day(4), MANIFEST).await.unwrap_err();
        assert!(matches!(
            err,
            LoadError::InvalidValue { ref column, ref value }
                if column == "source_date" && value == "2024/01/02"
        ));
    }

    #[tokio::test]
    async fn inverted_date_range_is_rejected() {
        let tracker = IncrementalTracker::new(Arc::new(MemoryObjectStore::new()), ManifestSchema::dates());
        for end in [day(3), day(2)] {
            let err = tracker.remaining_dates(day(3), end, MANIFEST).await.unwrap_err();
            assert!(matches!(err, LoadError::InvalidDateRange { .. }));
        }
    }
}
