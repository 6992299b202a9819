use std::collections::{BTreeMap, HashMap, HashSet};

use crate::{KeyType, LoadError, Record, Value};

pub const LIST_DELIMITER: &str = ", ";

static NULL: Value = Value::Null;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl<'a> RowRef<'a> {
    pub fn get(&self, column: &str) -> &'a Value {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
            .unwrap_or(&NULL)
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn from_rows<I, S>(columns: I, rows: Vec<Vec<Value>>) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn from_records<I, S>(columns: I, records: &[Record]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new(columns);
        for record in records {
            let row = table
                .columns
                .iter()
                .map(|c| record.get(c).cloned().unwrap_or_default())
                .collect();
            table.rows.push(row);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn column_index(&self, column: &str) -> Result<usize, LoadError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| LoadError::MissingColumn {
                column: column.to_string(),
                available: self.columns.clone(),
            })
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), LoadError> {
        if row.len() != self.columns.len() {
            return Err(LoadError::RowArity {
                expected: self.columns.len(),
                found: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn row(&self, index: usize) -> Option<RowRef<'_>> {
        self.rows.get(index).map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn record(&self, index: usize) -> Option<Record> {
        self.rows.get(index).map(|values| {
            self.columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect()
        })
    }

    pub fn value(&self, index: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(index).and_then(|row| row.get(idx))
    }

    pub fn column(&self, column: &str) -> Result<Vec<Value>, LoadError> {
        let idx = self.column_index(column)?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    pub fn select<S: AsRef<str>>(&self, columns: &[S]) -> Result<Table, LoadError> {
        let indices = columns
            .iter()
            .map(|c| self.column_index(c.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Table {
            columns: columns.iter().map(|c| c.as_ref().to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
                .collect(),
        })
    }

    pub fn project_to<S: AsRef<str>>(&self, schema: &[S]) -> Table {
        let present = schema
            .iter()
            .map(AsRef::as_ref)
            .filter(|c| self.has_column(c))
            .collect::<Vec<_>>();
        self.select(&present).unwrap_or_default()
    }

    fn key_indices(&self, keys: &[&str]) -> Result<Vec<usize>, LoadError> {
        keys.iter().map(|k| self.column_index(k)).collect()
    }

    pub fn drop_duplicates(&self, keys: &[&str]) -> Result<Table, LoadError> {
        let indices = self.key_indices(keys)?;
        let mut seen = HashSet::new();
        let rows = self
            .rows
            .iter()
            .filter(|row| seen.insert(key_of(row, &indices)))
            .cloned()
            .collect();
        Ok(Table {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Hash left join on one key column.
    ///
    /// Copies `take` columns from the first matching right row (null when unmatched).
    /// A taken column that already exists on the left is overwritten in place.
    pub fn left_join(&self, right: &Table, on: &str, take: &[&str]) -> Result<Table, LoadError> {
        let left_key = self.column_index(on)?;
        let right_key = right.column_index(on)?;
        let take_indices = take
            .iter()
            .map(|c| right.column_index(c))
            .collect::<Result<Vec<_>, _>>()?;

        let mut lookup: HashMap<&Value, &Vec<Value>> = HashMap::new();
        for row in &right.rows {
            lookup.entry(&row[right_key]).or_insert(row);
        }

        let mut joined = self.clone();
        for (col, &right_idx) in take.iter().zip(&take_indices) {
            let values = self
                .rows
                .iter()
                .map(|row| {
                    lookup
                        .get(&row[left_key])
                        .map(|matched| matched[right_idx].clone())
                        .unwrap_or_default()
                })
                .collect();
            joined.set_column(col, values)?;
        }
        Ok(joined)
    }

    pub fn anti_join(&self, right: &Table, on: &[&str]) -> Result<Table, LoadError> {
        let left_indices = self.key_indices(on)?;
        let right_indices = right.key_indices(on)?;
        let existing: HashSet<Vec<Value>> = right
            .rows
            .iter()
            .map(|row| key_of(row, &right_indices))
            .collect();
        let rows = self
            .rows
            .iter()
            .filter(|row| !existing.contains(&key_of(row, &left_indices)))
            .cloned()
            .collect();
        Ok(Table {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// One output row per list member of `column`, members in their listed order.
    ///
    /// Null or empty lists keep a single row with a null member.
    pub fn explode(&self, column: &str, delimiter: &str) -> Result<Table, LoadError> {
        let idx = self.column_index(column)?;
        let mut rows = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let members = split_members(&row[idx], delimiter);
            if members.is_empty() {
                let mut out = row.clone();
                out[idx] = Value::Null;
                rows.push(out);
                continue;
            }
            for member in members {
                let mut out = row.clone();
                out[idx] = Value::Text(member);
                rows.push(out);
            }
        }
        Ok(Table {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Group-by `group` aggregating `column` into a sorted delimiter-joined list.
    ///
    /// Groups appear in first-seen order; null members are skipped.
    pub fn collapse(&self, group: &str, column: &str, delimiter: &str) -> Result<Table, LoadError> {
        let group_idx = self.column_index(group)?;
        let column_idx = self.column_index(column)?;
        let mut order = Vec::new();
        let mut members: HashMap<Value, Vec<String>> = HashMap::new();
        for row in &self.rows {
            let key = row[group_idx].clone();
            let entry = members.entry(key.clone()).or_insert_with(|| {
                order.push(key);
                Vec::new()
            });
            if !row[column_idx].is_null() {
                entry.push(row[column_idx].to_string());
            }
        }

        let mut table = Table::new([group, column]);
        for key in order {
            let mut list = members.remove(&key).unwrap_or_default();
            list.sort();
            list.dedup();
            let joined = if list.is_empty() {
                Value::Null
            } else {
                Value::Text(list.join(delimiter))
            };
            table.rows.push(vec![key, joined]);
        }
        Ok(table)
    }

    pub fn set_column(&mut self, column: &str, values: Vec<Value>) -> Result<(), LoadError> {
        if values.len() != self.rows.len() {
            return Err(LoadError::RowArity {
                expected: self.rows.len(),
                found: values.len(),
            });
        }
        match self.columns.iter().position(|c| c == column) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(column.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
        Ok(())
    }

    pub fn insert_column(
        &mut self,
        index: usize,
        column: &str,
        values: Vec<Value>,
    ) -> Result<(), LoadError> {
        if values.len() != self.rows.len() {
            return Err(LoadError::RowArity {
                expected: self.rows.len(),
                found: values.len(),
            });
        }
        let index = index.min(self.columns.len());
        self.columns.insert(index, column.to_string());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.insert(index, value);
        }
        Ok(())
    }

    pub fn rename_columns(&mut self, renames: &BTreeMap<String, String>) {
        for column in &mut self.columns {
            if let Some(renamed) = renames.get(column) {
                *column = renamed.clone();
            }
        }
    }

    pub fn map_column(
        &mut self,
        column: &str,
        mut f: impl FnMut(&Value) -> Value,
    ) -> Result<(), LoadError> {
        self.try_map_column(column, |v| Ok(f(v)))
    }

    pub fn try_map_column(
        &mut self,
        column: &str,
        mut f: impl FnMut(&Value) -> Result<Value, LoadError>,
    ) -> Result<(), LoadError> {
        let idx = self.column_index(column)?;
        for row in &mut self.rows {
            row[idx] = f(&row[idx])?;
        }
        Ok(())
    }

    pub fn canonicalize_column(&mut self, column: &str, key_type: KeyType) -> Result<(), LoadError> {
        self.try_map_column(column, |v| key_type.canonicalize(column, v))
    }

    pub fn retain(&mut self, mut keep: impl FnMut(RowRef<'_>) -> bool) {
        let columns = &self.columns;
        self.rows.retain(|values| keep(RowRef { columns, values }));
    }

    pub fn concat(&mut self, other: Table) -> Result<(), LoadError> {
        let mut mine = self.columns.clone();
        let mut theirs = other.columns.clone();
        mine.sort();
        theirs.sort();
        if mine != theirs {
            return Err(LoadError::MalformedInputSchema(format!(
                "column names {:?} differ from {:?}",
                other.columns, self.columns
            )));
        }
        let aligned = other.select(&self.columns)?;
        self.rows.extend(aligned.rows);
        Ok(())
    }

    pub fn max_int(&self, column: &str) -> Result<Option<i64>, LoadError> {
        let idx = self.column_index(column)?;
        let mut max = None;
        for row in &self.rows {
            let value = &row[idx];
            if value.is_null() {
                continue;
            }
            let key = value.as_i64().ok_or_else(|| LoadError::InvalidKey {
                column: column.to_string(),
                value: value.to_string(),
            })?;
            max = Some(max.map_or(key, |m: i64| m.max(key)));
        }
        Ok(max)
    }
}

fn key_of(row: &[Value], indices: &[usize]) -> Vec<Value> {
    indices.iter().map(|&i| row[i].clone()).collect()
}

/// Splits a delimiter-joined list cell into trimmed, non-empty members.
///
/// Splitting uses the delimiter without surrounding whitespace, so `a,b` and `a, b` agree.
pub fn split_members(value: &Value, delimiter: &str) -> Vec<String> {
    if value.is_null() {
        return Vec::new();
    }
    let separator = match delimiter.trim() {
        "" => delimiter,
        trimmed => trimmed,
    };
    value
        .to_string()
        .split(separator)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}

pub fn canonical_member_list(value: &Value, delimiter: &str) -> Value {
    let mut members = split_members(value, delimiter);
    members.sort();
    members.dedup();
    if members.is_empty() {
        Value::Null
    } else {
        Value::Text(members.join(delimiter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(v: &str) -> Value {
        Value::text(v)
    }

    #[test]
    fn drop_duplicates_keeps_first_occurrence_in_order() {
        let table = Table::from_rows(
            ["name", "city"],
            vec![
                vec![t("b"), t("x")],
                vec![t("a"), t("y")],
                vec![t("b"), t("z")],
            ],
        )
        .unwrap();
        let deduped = table.drop_duplicates(&["name"]).unwrap();
        assert_eq!(deduped.column("name").unwrap(), vec![t("b"), t("a")]);
        assert_eq!(deduped.column("city").unwrap(), vec![t("x"), t("y")]);
    }

    #[test]
    fn left_join_fills_unmatched_with_null_and_overwrites_existing_columns() {
        let left = Table::from_rows(
            ["k", "id"],
            vec![vec![t("a"), Value::Null], vec![t("c"), Value::Null]],
        )
        .unwrap();
        let right = Table::from_rows(
            ["id", "k"],
            vec![vec![Value::Int(1), t("a")], vec![Value::Int(2), t("b")]],
        )
        .unwrap();
        let joined = left.left_join(&right, "k", &["id"]).unwrap();
        assert_eq!(joined.columns(), ["k", "id"]);
        assert_eq!(joined.column("id").unwrap(), vec![Value::Int(1), Value::Null]);
    }

    #[test]
    fn anti_join_compares_key_tuples() {
        let left = Table::from_rows(
            ["g", "s"],
            vec![
                vec![Value::Int(1), Value::Int(1)],
                vec![Value::Int(1), Value::Int(2)],
            ],
        )
        .unwrap();
        let right = Table::from_rows(["g", "s"], vec![vec![Value::Int(1), Value::Int(1)]]).unwrap();
        let fresh = left.anti_join(&right, &["g", "s"]).unwrap();
        assert_eq!(fresh.rows(), &[vec![Value::Int(1), Value::Int(2)]]);
    }

    #[test]
    fn explode_then_collapse_yields_sorted_lists() {
        let table = Table::from_rows(["g", "m"], vec![vec![Value::Int(7), t("b, a")]]).unwrap();
        let exploded = table.explode("m", LIST_DELIMITER).unwrap();
        assert_eq!(exploded.column("m").unwrap(), vec![t("b"), t("a")]);
        let collapsed = exploded.collapse("g", "m", LIST_DELIMITER).unwrap();
        assert_eq!(collapsed.rows(), &[vec![Value::Int(7), t("a, b")]]);
    }

    #[test]
    fn member_lists_canonicalize_regardless_of_spacing_and_order() {
        assert_eq!(canonical_member_list(&t("002,001, 002"), LIST_DELIMITER), t("001, 002"));
        assert_eq!(canonical_member_list(&t(" "), LIST_DELIMITER), Value::Null);
        assert_eq!(canonical_member_list(&Value::Null, LIST_DELIMITER), Value::Null);
    }

    #[test]
    fn concat_aligns_by_name_and_rejects_different_columns() {
        let mut first = Table::from_rows(["a", "b"], vec![vec![Value::Int(1), Value::Int(2)]]).unwrap();
        let second = Table::from_rows(["b", "a"], vec![vec![Value::Int(4), Value::Int(3)]]).unwrap();
        first.concat(second).unwrap();
        assert_eq!(first.column("a").unwrap(), vec![Value::Int(1), Value::Int(3)]);

        let other = Table::from_rows(["a", "c"], vec![]).unwrap();
        assert!(matches!(
            first.concat(other),
            Err(LoadError::MalformedInputSchema(_))
        ));
    }

    #[test]
    fn max_int_rejects_non_integer_keys() {
        let table = Table::from_rows(["id"], vec![vec![Value::Int(3)], vec![t("x")]]).unwrap();
        assert!(matches!(table.max_int("id"), Err(LoadError::InvalidKey { .. })));
        let empty = Table::new(["id"]);
        assert_eq!(empty.max_int("id").unwrap(), None);
    }
}
