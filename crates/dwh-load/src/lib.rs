//! Incremental star-schema loading: work tracking, surrogate-key reconciliation,
//! bridge construction and the load orchestration tying them together.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use dwh_core::LoadError;
use dwh_storage::{LocalObjectStore, ObjectStore, PgTableStore, TableStore};
use dwh_transform::{load_batch, Transformer};

mod bridge;
mod config;
mod loader;
mod reconcile;
mod tracker;

pub use bridge::{build_bridge, BridgeOutcome};
pub use config::{ArchiveConfig, EnvConfig, FactConfig, LoaderConfig, ManifestConfig};
pub use loader::{assign_fact_keys, LoadReport, StarSchemaLoader};
pub use reconcile::{build_dimension, DimensionOutcome};
pub use tracker::{IncrementalTracker, ManifestSchema, PROCESSED_AT_FORMAT};

pub const DATE_MANIFEST_KEY: &str = "meta/scrape_meta.csv";

/// Loads every input file not yet in the manifest.
///
/// Returns `None` when no files are pending or the cleaned batch is empty.
pub async fn run_once(
    config: &LoaderConfig,
    objects: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn TableStore>,
) -> Result<Option<LoadReport>, LoadError> {
    let pending = pending_units(config, objects.clone()).await?;
    let batch = load_batch(objects.as_ref(), &pending).await?;
    let batch = match (batch, &config.transform) {
        (Some(batch), Some(rules)) => Some(Transformer::new(rules.clone()).transform(batch)?),
        (batch, _) => batch,
    };
    StarSchemaLoader::new(config.clone(), objects, warehouse, pending)
        .generate_facts_and_dims(batch)
        .await
}

pub async fn pending_units(
    config: &LoaderConfig,
    objects: Arc<dyn ObjectStore>,
) -> Result<Vec<String>, LoadError> {
    let known = objects.list(&config.source_prefix).await?;
    IncrementalTracker::new(objects, config.manifest.schema())
        .remaining_units(known, &config.manifest.key)
        .await
}

pub async fn run_once_from_env() -> Result<Option<LoadReport>> {
    let env = EnvConfig::from_env();
    let config = LoaderConfig::load(&env.config_path).await?;
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&env.store_root));
    let warehouse: Arc<dyn TableStore> = Arc::new(
        PgTableStore::connect(&env.database_url)
            .await
            .context("connecting to warehouse")?,
    );
    Ok(run_once(&config, objects, warehouse).await?)
}

pub async fn pending_units_from_env() -> Result<Vec<String>> {
    let env = EnvConfig::from_env();
    let config = LoaderConfig::load(&env.config_path).await?;
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&env.store_root));
    Ok(pending_units(&config, objects).await?)
}

pub async fn pending_dates_from_env(
    start: NaiveDate,
    end: NaiveDate,
    manifest_key: Option<String>,
) -> Result<Vec<NaiveDate>> {
    let env = EnvConfig::from_env();
    let objects: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&env.store_root));
    let key = manifest_key.unwrap_or_else(|| DATE_MANIFEST_KEY.to_string());
    Ok(IncrementalTracker::new(objects, ManifestSchema::dates())
        .remaining_dates(start, end, &key)
        .await?)
}
