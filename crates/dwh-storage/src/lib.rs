//! Object storage of tabular files and the warehouse table-store seam.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use dwh_core::{LoadError, Table};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

mod codec;
mod object;
mod postgres;
mod warehouse;

pub use object::{LocalObjectStore, MemoryObjectStore};
pub use postgres::PgTableStore;
pub use warehouse::{MemoryTableStore, TableStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableFormat {
    Csv,
    #[default]
    Parquet,
}

impl TableFormat {
    pub fn from_key(key: &str) -> Result<Self, LoadError> {
        let extension = key
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.contains('/'))
            .unwrap_or_default();
        match extension {
            "csv" => Ok(TableFormat::Csv),
            "parquet" => Ok(TableFormat::Parquet),
            other => Err(LoadError::UnsupportedFormat {
                key: key.to_string(),
                extension: other.to_string(),
            }),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::Parquet => "parquet",
        }
    }

    pub fn encode(&self, key: &str, table: &Table) -> Result<Vec<u8>, LoadError> {
        match self {
            TableFormat::Csv => codec::encode_csv(key, table),
            TableFormat::Parquet => codec::encode_parquet(key, table),
        }
    }

    pub fn decode(&self, key: &str, bytes: &[u8]) -> Result<Table, LoadError> {
        match self {
            TableFormat::Csv => codec::decode_csv(key, bytes),
            TableFormat::Parquet => codec::decode_parquet(key, bytes),
        }
    }
}

/// Byte-level object storage addressed by slash-separated keys.
///
/// `read`/`write` add the tabular codec on top, chosen from the key suffix.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, LoadError>;

    async fn put_bytes(&self, key: &str, bytes: Vec<u8>) -> Result<(), LoadError>;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, LoadError>;

    async fn read(&self, key: &str) -> Result<Option<Table>, LoadError> {
        let format = TableFormat::from_key(key)?;
        match self.get_bytes(key).await? {
            Some(bytes) => format.decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, table: &Table) -> Result<(), LoadError> {
        let format = TableFormat::from_key(key)?;
        let bytes = format.encode(key, table)?;
        self.put_bytes(key, bytes).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchivedTable {
    pub table: String,
    pub key: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `{target_path}{table}/{table}_{YYYYMMDD_HHMMSS}.{ext}`
pub fn archive_key(
    target_path: &str,
    table_name: &str,
    format: TableFormat,
    at: NaiveDateTime,
) -> String {
    let stamp = at.format("%Y%m%d_%H%M%S");
    format!(
        "{target_path}{table_name}/{table_name}_{stamp}.{}",
        format.extension()
    )
}

pub async fn archive_table(
    store: &dyn ObjectStore,
    target_path: &str,
    format: TableFormat,
    table_name: &str,
    table: &Table,
    at: NaiveDateTime,
) -> Result<ArchivedTable, LoadError> {
    let key = archive_key(target_path, table_name, format, at);
    let bytes = format.encode(&key, table)?;
    let archived = ArchivedTable {
        table: table_name.to_string(),
        key: key.clone(),
        rows: table.len(),
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    };
    store.put_bytes(&key, bytes).await?;
    tracing::debug!(table = table_name, key = %archived.key, rows = archived.rows, "archived table");
    Ok(archived)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn format_follows_key_suffix() {
        assert_eq!(TableFormat::from_key("meta/a.csv").unwrap(), TableFormat::Csv);
        assert_eq!(
            TableFormat::from_key("dwh/x/x_1.parquet").unwrap(),
            TableFormat::Parquet
        );
        assert!(matches!(
            TableFormat::from_key("scraped/offers.json"),
            Err(LoadError::UnsupportedFormat { extension, .. }) if extension == "json"
        ));
        assert!(matches!(
            TableFormat::from_key("scraped.d/offers"),
            Err(LoadError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn archive_keys_embed_table_and_timestamp() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap();
        assert_eq!(
            archive_key("dwh/", "dim_employer", TableFormat::Parquet, at),
            "dwh/dim_employer/dim_employer_20240309_070501.parquet"
        );
    }

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
