use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use dwh_core::{LoadError, Table, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Postgres, QueryBuilder, Row, Transaction, TypeInfo};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::TableStore;

/// Postgres bind-parameter ceiling is 65535 per statement.
const MAX_BIND_PARAMS: usize = 60_000;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Postgres-compatible warehouse.
///
/// Reads go through the pool; writes share one lazily opened transaction until `commit`.
pub struct PgTableStore {
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgTableStore {
    pub async fn connect(database_url: &str) -> Result<Self, LoadError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await
            .map_err(|e| LoadError::transport("connecting to warehouse", e))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            tx: Mutex::new(None),
        }
    }

    async fn column_types(&self, table: &str) -> Result<Vec<(String, String)>, LoadError> {
        let (schema, name) = match table.rsplit_once('.') {
            Some((schema, name)) => (Some(schema), name),
            None => (None, table),
        };
        let columns: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name::text, data_type::text FROM information_schema.columns \
             WHERE table_name = $1 AND ($2::text IS NULL OR table_schema = $2) \
             ORDER BY ordinal_position",
        )
        .bind(name)
        .bind(schema)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LoadError::transport(format!("listing columns of {table}"), e))?;

        if columns.is_empty() {
            return Err(LoadError::transport(
                format!("listing columns of {table}"),
                format!("relation \"{table}\" does not exist"),
            ));
        }
        Ok(columns)
    }
}

fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Select-list entry for one column; types without a native decoding are cast on the server.
fn select_expr(column: &str, data_type: &str) -> String {
    let quoted = quote_ident(column);
    match data_type {
        "boolean" | "smallint" | "integer" | "bigint" | "real" | "double precision" | "date"
        | "timestamp without time zone" | "timestamp with time zone" | "text"
        | "character varying" | "character" => quoted,
        "numeric" => format!("{quoted}::double precision AS {quoted}"),
        _ => format!("{quoted}::text AS {quoted}"),
    }
}

fn decode_cell(row: &PgRow, idx: usize) -> Result<Value, sqlx::Error> {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(idx)?.map(Value::Bool),
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(|v| Value::Int(v.into())),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(|v| Value::Int(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(Value::Int),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(|v| Value::Float(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(Value::Float),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(idx)?.map(Value::Date),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|ts| Value::Text(ts.format(TIMESTAMP_FORMAT).to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(|ts| Value::Text(ts.naive_utc().format(TIMESTAMP_FORMAT).to_string())),
        _ => row.try_get::<Option<String>, _>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or_default())
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn select_all(&self, table: &str) -> Result<Table, LoadError> {
        let typed = self.column_types(table).await?;
        let select_list = typed
            .iter()
            .map(|(column, data_type)| select_expr(column, data_type))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {select_list} FROM {}", quote_ident(table));
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LoadError::transport(format!("selecting {table}"), e))?;

        let mut snapshot = Table::new(typed.into_iter().map(|(column, _)| column));
        for row in &rows {
            let values = (0..row.len())
                .map(|idx| decode_cell(row, idx))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| LoadError::transport(format!("decoding {table}"), e))?;
            snapshot.push_row(values)?;
        }
        debug!(table, rows = snapshot.len(), "loaded warehouse snapshot");
        Ok(snapshot)
    }

    async fn columns(&self, table: &str) -> Result<Vec<String>, LoadError> {
        Ok(self
            .column_types(table)
            .await?
            .into_iter()
            .map(|(column, _)| column)
            .collect())
    }

    async fn last_key(&self, table: &str, key_column: &str) -> Result<i64, LoadError> {
        let sql = format!(
            "SELECT MAX({})::bigint FROM {}",
            quote_ident(key_column),
            quote_ident(table)
        );
        let last: Option<i64> = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LoadError::transport(format!("reading last key of {table}"), e))?;
        Ok(last.unwrap_or(0))
    }

    async fn bulk_write(&self, rows: &Table, table: &str) -> Result<(), LoadError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut guard = self.tx.lock().await;
        if guard.is_none() {
            let tx = self
                .pool
                .begin()
                .await
                .map_err(|e| LoadError::transport("opening warehouse transaction", e))?;
            *guard = Some(tx);
        }
        let tx = guard.as_mut().ok_or_else(|| {
            LoadError::transport("opening warehouse transaction", "no open transaction")
        })?;

        let column_list = rows
            .columns()
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let chunk_size = (MAX_BIND_PARAMS / rows.columns().len().max(1)).max(1);

        for chunk in rows.rows().chunks(chunk_size) {
            let mut builder: QueryBuilder<'_, Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({column_list}) ", quote_ident(table)));
            builder.push_values(chunk, |mut b, row| {
                for value in row {
                    match value {
                        Value::Null => {
                            b.push("NULL");
                        }
                        Value::Bool(v) => {
                            b.push_bind(*v);
                        }
                        Value::Int(v) => {
                            b.push_bind(*v);
                        }
                        Value::Float(v) => {
                            b.push_bind(*v);
                        }
                        Value::Text(v) => {
                            b.push_bind(v.clone());
                        }
                        Value::Date(v) => {
                            b.push_bind(*v);
                        }
                    }
                }
            });
            builder
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|e| LoadError::transport(format!("writing rows to {table}"), e))?;
        }
        info!(table, rows = rows.len(), "staged warehouse rows");
        Ok(())
    }

    async fn commit(&self) -> Result<(), LoadError> {
        let Some(tx) = self.tx.lock().await.take() else {
            return Ok(());
        };
        tx.commit()
            .await
            .map_err(|e| LoadError::transport("committing warehouse transaction", e))
    }
}
