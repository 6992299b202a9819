//! Batch assembly from scraped input files and record cleaning ahead of loading.

use std::collections::BTreeMap;

use chrono::Datelike;
use dwh_core::{LoadError, Table, Value};
use dwh_storage::ObjectStore;
use serde::Deserialize;
use tracing::{error, info};

pub const REMOTE_WORK: &str = "praca zdalna";
pub const MOBILE_WORK: &str = "praca mobilna";
pub const FULL_TIME: &str = "pełny etat";

const HOURLY_TO_MONTHLY: f64 = 8.0 * 20.0;
const MONTHLY_SALARY_FLOOR: f64 = 1000.0;
const CONTRACT_DELIMITER: &str = ", ";

/// Reads every input file and concatenates them into one batch.
///
/// All files must share the first file's column count and names. Returns `None`
/// when there is nothing to read.
pub async fn load_batch(
    store: &dyn ObjectStore,
    keys: &[String],
) -> Result<Option<Table>, LoadError> {
    if keys.is_empty() {
        info!(
            "All data files have already been transformed. Remove their names from the manifest to run them again."
        );
        return Ok(None);
    }

    let mut frames = Vec::with_capacity(keys.len());
    for key in keys {
        let frame = store
            .read(key)
            .await?
            .ok_or_else(|| LoadError::NotFound(key.clone()))?;
        frames.push((key, frame));
    }

    let mut frames = frames.into_iter();
    let Some((first_key, mut batch)) = frames.next() else {
        return Ok(None);
    };
    for (key, frame) in frames {
        if frame.columns().len() != batch.columns().len() {
            error!(first = %first_key, other = %key, "input files have different number of columns");
            return Err(LoadError::MalformedInputSchema(format!(
                "{key} has {} columns, {first_key} has {}",
                frame.columns().len(),
                batch.columns().len()
            )));
        }
        if let Some(missing) = batch.columns().iter().find(|c| !frame.has_column(c)) {
            error!(first = %first_key, other = %key, "input files have different column names");
            return Err(LoadError::MalformedInputSchema(format!(
                "{key} lacks column {missing} present in {first_key}"
            )));
        }
        batch.concat(frame)?;
    }
    info!(files = keys.len(), rows = batch.len(), "assembled input batch");
    Ok(Some(batch))
}

fn default_max_locations() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformRules {
    #[serde(default)]
    pub source_renames: BTreeMap<String, String>,
    #[serde(default)]
    pub target_renames: BTreeMap<String, String>,
    #[serde(default = "default_max_locations")]
    pub max_locations: usize,
}

impl Default for TransformRules {
    fn default() -> Self {
        Self {
            source_renames: BTreeMap::new(),
            target_renames: BTreeMap::new(),
            max_locations: default_max_locations(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Transformer {
    rules: TransformRules,
}

impl Transformer {
    pub fn new(rules: TransformRules) -> Self {
        Self { rules }
    }

    pub fn transform(&self, mut table: Table) -> Result<Table, LoadError> {
        let input_rows = table.len();
        table.rename_columns(&self.rules.source_renames);

        table.map_column("offer_id", |v| match v {
            Value::Null => Value::Null,
            other => Value::Text(other.to_string()),
        })?;
        trim_text(&mut table)?;
        keep_full_time_with_category(&mut table)?;

        expand_dates(&mut table)?;
        clean_employer(&mut table)?;
        normalize_locations(&mut table, self.rules.max_locations)?;
        normalize_salaries(&mut table)?;
        let mut table = explode_contracts(&table)?;

        table.rename_columns(&self.rules.target_renames);
        info!(input_rows, output_rows = table.len(), "transformed batch");
        Ok(table)
    }
}

fn text_of(value: &Value) -> String {
    if value.is_null() {
        String::new()
    } else {
        value.to_string()
    }
}

/// One row per contract type, splitting on exactly `", "`; a null list stays one null row.
fn explode_contracts(table: &Table) -> Result<Table, LoadError> {
    let idx = table.column_index("contract_type")?;
    let mut rows = Vec::with_capacity(table.len());
    for row in table.rows() {
        let contracts = match &row[idx] {
            Value::Null => vec![Value::Null],
            other => other
                .to_string()
                .split(CONTRACT_DELIMITER)
                .map(Value::text)
                .collect(),
        };
        for contract in contracts {
            let mut out = row.clone();
            out[idx] = contract;
            rows.push(out);
        }
    }
    Table::from_rows(table.columns().iter().cloned(), rows)
}

fn trim_text(table: &mut Table) -> Result<(), LoadError> {
    let columns = table.columns().to_vec();
    for column in columns {
        table.map_column(&column, |v| match v {
            Value::Text(s) => Value::Text(s.trim().to_string()),
            other => other.clone(),
        })?;
    }
    Ok(())
}

/// Offers without full-time employment are dropped; a missing schedule counts as full time.
fn keep_full_time_with_category(table: &mut Table) -> Result<(), LoadError> {
    table.column_index("work_schedule")?;
    table.column_index("category_id")?;
    table.retain(|row| {
        let schedule = row.get("work_schedule");
        let full_time = schedule.is_null() || schedule.to_string().contains(FULL_TIME);
        full_time && !row.get("category_id").is_null()
    });
    Ok(())
}

fn expand_dates(table: &mut Table) -> Result<(), LoadError> {
    table.try_map_column("published_date", |v| {
        v.as_date().map(Value::Date).ok_or_else(|| LoadError::InvalidValue {
            column: "published_date".to_string(),
            value: v.to_string(),
        })
    })?;
    let dates = table
        .column("published_date")?
        .iter()
        .map(Value::as_date)
        .collect::<Vec<_>>();
    let position = table.column_index("published_date")? + 1;
    let parts: [(&str, fn(chrono::NaiveDate) -> i64); 4] = [
        ("year", |d| d.year().into()),
        ("quarter", |d| (d.month0() / 3 + 1).into()),
        ("month", |d| d.month().into()),
        ("day", |d| d.day().into()),
    ];
    for (offset, (name, part)) in parts.iter().enumerate() {
        let values = dates.iter().map(|d| d.map(part).into()).collect();
        table.insert_column(position + offset, name, values)?;
    }
    Ok(())
}

fn clean_employer(table: &mut Table) -> Result<(), LoadError> {
    for column in ["employer_name", "employer_address", "employer_tax_id"] {
        table.column_index(column)?;
    }
    table.retain(|row| {
        !row.get("employer_name").is_null()
            && !row.get("employer_address").is_null()
            && !row.get("employer_tax_id").is_null()
    });
    table.map_column("employer_address", |v| {
        Value::Text(text_of(v).replace('\n', ", "))
    })?;
    // Scraped tax ids carry a five character label before the number.
    table.map_column("employer_tax_id", |v| {
        Value::Text(text_of(v).chars().skip(5).collect())
    })?;
    table.retain(|row| text_of(row.get("employer_tax_id")).chars().count() <= 10);
    Ok(())
}

fn offers(mode: &str, kind: &str) -> bool {
    mode.contains(kind)
}

/// Normalizes `location` into a `", "`-joined list of cities and remote/mobile markers.
///
/// Rows listing more than `max_locations` cities are dropped unless the offer allows
/// remote or mobile work, in which case the location collapses to that mode.
fn normalize_locations(table: &mut Table, max_locations: usize) -> Result<(), LoadError> {
    let location_idx = table.column_index("location")?;
    let mode_idx = table.column_index("work_mode")?;
    let columns = table.columns().to_vec();

    let mut cleaned = Table::new(columns);
    for row in table.rows() {
        let mode = text_of(&row[mode_idx]);
        let raw = match mode.as_str() {
            REMOTE_WORK | MOBILE_WORK => mode.clone(),
            _ => text_of(&row[location_idx]),
        };
        let city = raw.rsplit(", ").next().unwrap_or_default();
        let mut locations = city
            .split('|')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();

        if locations.len() > max_locations {
            if offers(&mode, REMOTE_WORK) {
                locations = vec![REMOTE_WORK.to_string()];
            } else if offers(&mode, MOBILE_WORK) {
                locations = vec![MOBILE_WORK.to_string()];
            } else {
                continue;
            }
        }

        let hybrid = mode != REMOTE_WORK && mode != MOBILE_WORK;
        for extra in [REMOTE_WORK, MOBILE_WORK] {
            if hybrid && offers(&mode, extra) && !locations.iter().any(|l| l == extra) {
                locations.push(extra.to_string());
            }
        }

        let mut out = row.clone();
        out[location_idx] = if locations.is_empty() {
            Value::Null
        } else {
            Value::Text(locations.join(", "))
        };
        cleaned.push_row(out)?;
    }
    *table = cleaned;
    Ok(())
}

fn parse_salary(column: &str, value: &Value) -> Result<f64, LoadError> {
    if let Some(amount) = value.as_f64() {
        return Ok(amount);
    }
    let cleaned = text_of(value)
        .trim_end_matches([' ', 'z', 'ł', '–'])
        .replace('\u{a0}', "")
        .replace(' ', "")
        .replace(',', ".");
    cleaned
        .parse::<f64>()
        .map_err(|_| LoadError::InvalidValue {
            column: column.to_string(),
            value: value.to_string(),
        })
}

/// Converts salaries to monthly amounts and drops offers whose salary type contradicts the amount.
fn normalize_salaries(table: &mut Table) -> Result<(), LoadError> {
    let min_idx = table.column_index("min_salary")?;
    let max_idx = table.column_index("max_salary")?;
    let type_idx = table.column_index("salary_type")?;
    let columns = table.columns().to_vec();

    let mut cleaned = Table::new(columns);
    for row in table.rows() {
        let mut max = parse_salary("max_salary", &row[max_idx])?;
        let mut min = if row[min_idx].is_null() {
            max
        } else {
            parse_salary("min_salary", &row[min_idx])?
        };
        let salary_type = text_of(&row[type_idx]);
        let monthly = salary_type.contains("mies.");
        let hourly = salary_type.contains("godz.");
        if (monthly && min < MONTHLY_SALARY_FLOOR) || (hourly && min >= MONTHLY_SALARY_FLOOR) {
            continue;
        }
        if hourly {
            min *= HOURLY_TO_MONTHLY;
            max *= HOURLY_TO_MONTHLY;
        }

        let mut out = row.clone();
        out[min_idx] = Value::Float(min);
        out[max_idx] = Value::Float(max);
        cleaned.push_row(out)?;
    }
    *table = cleaned;
    Ok(())
}
