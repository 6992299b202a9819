use dwh_core::{canonical_member_list, LoadError, Table, LIST_DELIMITER};

use crate::reconcile::{build_dimension, DimensionOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeOutcome {
    pub dimension: DimensionOutcome,
    pub groups: DimensionOutcome,
    pub new_bridge_rows: Table,
}

/// Resolves the list column `natural_key` of `batch` into member keys and group keys.
///
/// Lists are compared in canonical form (trimmed, sorted, de-duplicated), so the
/// same set of members always lands in the same group. Natural keys of
/// `persisted_dim` must already be text.
pub fn build_bridge(
    batch: &Table,
    persisted_dim: &Table,
    persisted_bridge: &Table,
    natural_key: &str,
    surrogate_key: &str,
    group_key: &str,
) -> Result<BridgeOutcome, LoadError> {
    persisted_bridge.column_index(group_key)?;
    persisted_bridge.column_index(surrogate_key)?;

    let mut lists = batch.clone();
    lists.map_column(natural_key, |v| canonical_member_list(v, LIST_DELIMITER))?;
    lists.retain(|row| !row.get(natural_key).is_null());

    let members = lists.explode(natural_key, LIST_DELIMITER)?;
    let dimension = build_dimension(&members, persisted_dim, natural_key, surrogate_key)?;

    let existing_groups = persisted_bridge
        .select(&[group_key, surrogate_key])?
        .left_join(persisted_dim, surrogate_key, &[natural_key])?
        .collapse(group_key, natural_key, LIST_DELIMITER)?;
    let groups = build_dimension(
        &lists.select(&[natural_key])?,
        &existing_groups,
        natural_key,
        group_key,
    )?;

    let new_bridge_rows = groups
        .enriched
        .explode(natural_key, LIST_DELIMITER)?
        .left_join(&dimension.enriched, natural_key, &[surrogate_key])?
        .select(&[group_key, surrogate_key])?
        .drop_duplicates(&[group_key, surrogate_key])?
        .anti_join(persisted_bridge, &[group_key, surrogate_key])?
        .project_to(persisted_bridge.columns());

    Ok(BridgeOutcome {
        dimension,
        groups,
        new_bridge_rows,
    })
}
