use std::collections::HashMap;

use dwh_core::{LoadError, Table, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionOutcome {
    pub enriched: Table,
    /// Members absent from the snapshot; the only rows to write back.
    pub new_rows: Table,
}

/// Diffs dimension members of `batch` against `persisted`.
///
/// Columns are taken from the batch only when the snapshot schema has them, and
/// never the surrogate key itself. New members get keys above the snapshot's
/// largest key in first-seen order. Natural keys must already be canonical on
/// both sides.
pub fn build_dimension(
    batch: &Table,
    persisted: &Table,
    natural_key: &str,
    surrogate_key: &str,
) -> Result<DimensionOutcome, LoadError> {
    batch.column_index(natural_key)?;
    let persisted_nk = persisted.column_index(natural_key)?;
    let persisted_sk = persisted.column_index(surrogate_key)?;

    let attributes = persisted
        .columns()
        .iter()
        .filter(|c| c.as_str() != surrogate_key)
        .collect::<Vec<_>>();
    let mut members = batch.project_to(&attributes).drop_duplicates(&[natural_key])?;

    let mut known: HashMap<&Value, i64> = HashMap::new();
    for row in persisted.rows() {
        let key = &row[persisted_sk];
        let key = key.as_i64().ok_or_else(|| LoadError::InvalidKey {
            column: surrogate_key.to_string(),
            value: key.to_string(),
        })?;
        known.entry(&row[persisted_nk]).or_insert(key);
    }

    let mut next_key = persisted.max_int(surrogate_key)?.unwrap_or(0);
    let keys = members
        .column(natural_key)?
        .iter()
        .map(|nk| match known.get(nk) {
            Some(&key) => Value::Int(key),
            None => {
                next_key += 1;
                Value::Int(next_key)
            }
        })
        .collect();
    members.set_column(surrogate_key, keys)?;

    let enriched = members.project_to(persisted.columns());
    let new_rows = enriched.anti_join(persisted, &[natural_key])?;
    Ok(DimensionOutcome { enriched, new_rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn employers(rows: &[(&str, &str)]) -> Table {
        Table::from_rows(
            ["employer_name", "employer_city", "offer_id"],
            rows.iter()
                .enumerate()
                .map(|(i, (name, city))| {
                    vec![Value::text(*name), Value::text(*city), Value::Int(i as i64)]
                })
                .collect(),
        )
        .unwrap()
    }

    fn snapshot(rows: Vec<Vec<Value>>) -> Table {
        Table::from_rows(["employer_id", "employer_name", "employer_city"], rows).unwrap()
    }

    #[test]
    fn empty_snapshot_assigns_keys_from_one_in_first_seen_order() {
        let batch = employers(&[("Beta", "Gdańsk"), ("Acme", "Kraków"), ("Beta", "Sopot")]);
        let outcome =
            build_dimension(&batch, &snapshot(Vec::new()), "employer_name", "employer_id").unwrap();

        assert_eq!(
            outcome.enriched.columns(),
            ["employer_id", "employer_name", "employer_city"]
        );
        assert_eq!(
            outcome.enriched.rows(),
            [
                vec![Value::Int(1), Value::text("Beta"), Value::text("Gdańsk")],
                vec![Value::Int(2), Value::text("Acme"), Value::text("Kraków")],
            ]
        );
        assert_eq!(outcome.new_rows, outcome.enriched);
    }

    #[test]
    fn existing_members_inherit_keys_and_new_ones_continue_after_the_maximum() {
        let persisted = snapshot(vec![
            vec![Value::Int(7), Value::text("Acme"), Value::text("Kraków")],
            vec![Value::Int(3), Value::text("Beta"), Value::text("Gdańsk")],
        ]);
        let batch = employers(&[("Gamma", "Łódź"), ("Acme", "Kraków"), ("Delta", "Opole")]);
        let outcome = build_dimension(&batch, &persisted, "employer_name", "employer_id").unwrap();

        assert_eq!(
            outcome.enriched.column("employer_id").unwrap(),
            vec![Value::Int(8), Value::Int(7), Value::Int(9)]
        );
        assert_eq!(
            outcome.new_rows.column("employer_name").unwrap(),
            vec![Value::text("Gamma"), Value::text("Delta")]
        );
        let keys = outcome.new_rows.column("employer_id").unwrap();
        assert!(keys.iter().all(|k| k.as_i64().unwrap() > 7));
        assert_eq!(keys.iter().collect::<HashSet<_>>().len(), keys.len());
    }

    #[test]
    fn rerunning_against_the_enriched_output_finds_nothing_new() {
        let batch = employers(&[("Acme", "Kraków"), ("Beta", "Gdańsk")]);
        let first =
            build_dimension(&batch, &snapshot(Vec::new()), "employer_name", "employer_id").unwrap();
        let second = build_dimension(&batch, &first.enriched, "employer_name", "employer_id").unwrap();

        assert!(second.new_rows.is_empty());
        assert_eq!(second.enriched, first.enriched);
    }

    #[test]
    fn batch_columns_outside_the_snapshot_schema_are_dropped() {
        let persisted = Table::new(["employer_id", "employer_name"]);
        let outcome = build_dimension(
            &employers(&[("Acme", "Kraków")]),
            &persisted,
            "employer_name",
            "employer_id",
        )
        .unwrap();
        assert_eq!(outcome.enriched.columns(), ["employer_id", "employer_name"]);
    }

    #[test]
    fn surrogate_key_in_the_batch_is_ignored() {
        let batch = Table::from_rows(
            ["employer_id", "employer_name"],
            vec![vec![Value::Int(99), Value::text("Acme")]],
        )
        .unwrap();
        let outcome = build_dimension(
            &batch,
            &Table::new(["employer_id", "employer_name"]),
            "employer_name",
            "employer_id",
        )
        .unwrap();
        assert_eq!(outcome.enriched.value(0, "employer_id"), Some(&Value::Int(1)));
    }

    #[test]
    fn empty_batch_yields_empty_outputs() {
        let persisted = snapshot(vec![vec![
            Value::Int(1),
            Value::text("Acme"),
            Value::text("Kraków"),
        ]]);
        let outcome =
            build_dimension(&employers(&[]), &persisted, "employer_name", "employer_id").unwrap();
        assert!(outcome.enriched.is_empty());
        assert!(outcome.new_rows.is_empty());
    }

    #[test]
    fn missing_key_columns_and_bad_persisted_keys_are_reported() {
        let batch = employers(&[("Acme", "Kraków")]);
        assert!(matches!(
            build_dimension(&batch, &snapshot(Vec::new()), "tax_id", "employer_id"),
            Err(LoadError::MissingColumn { .. })
        ));

        let persisted = snapshot(vec![vec![
            Value::text("one"),
            Value::text("Beta"),
            Value::text("Gdańsk"),
        ]]);
        assert!(matches!(
            build_dimension(&batch, &persisted, "employer_name", "employer_id"),
            Err(LoadError::InvalidKey { .. })
        ));
    }
}
