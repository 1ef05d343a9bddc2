use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::filter::BigId;
use crate::query::tables::{FeatureTable, StoreTable};
use crate::query::{EntriesQuery, Operation};

/// Whether a table (optionally schema-qualified) is visible on the search path.
pub async fn table_exists(client: &Client, table: &str) -> StoreResult<bool> {
    let sql = "SELECT to_regclass($1) IS NOT NULL";
    let row = client
        .query_one(sql, &[&table])
        .await
        .map_err(|e| StoreError::execution(&e, sql))?;
    row.try_get(0).map_err(|e| StoreError::execution(&e, sql))
}

/// First column of the first row as a 64-bit integer. `None` when the query
/// returns no row or a NULL.
pub async fn query_long(client: &Client, sql: &str) -> StoreResult<Option<i64>> {
    let rows = client
        .query(sql, &[])
        .await
        .map_err(|e| StoreError::execution(&e, sql))?;
    match rows.first() {
        Some(row) => row.try_get(0).map_err(|e| StoreError::execution(&e, sql)),
        None => Ok(None),
    }
}

/// Create the table when missing and return the last id in use.
pub async fn init_store(client: &Client, table: &dyn StoreTable) -> StoreResult<BigId> {
    if !table_exists(client, table.name()).await? {
        for sql in table.create_statements() {
            debug!(sql = %sql, "creating store table");
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| StoreError::execution(&e, &sql))?;
        }
        info!(table = table.name(), entity = %table.entity(), "store table created");
    }
    let last = query_long(client, &table.select_last_id()).await?;
    Ok(BigId::new(last.unwrap_or(0)))
}

pub async fn count_entries(client: &Client, query: &EntriesQuery) -> StoreResult<i64> {
    Ok(query_long(client, &query.to_count_query()).await?.unwrap_or(0))
}

/// Run a compiled remove query; returns the number of deleted rows.
pub async fn remove_entries(client: &Client, query: &EntriesQuery) -> StoreResult<u64> {
    if query.operation() != Operation::Remove {
        return Err(StoreError::Unsupported(format!(
            "{} query cannot be used to remove entries",
            query.operation()
        )));
    }
    let sql = query.to_query();
    let removed = client
        .execute(sql.as_str(), &[])
        .await
        .map_err(|e| StoreError::execution(&e, &sql))?;
    info!(table = query.table(), removed, "entries removed");
    Ok(removed)
}

/// Row count of a whole store table.
pub async fn table_size(client: &Client, table: &dyn StoreTable) -> StoreResult<i64> {
    Ok(query_long(client, &table.count()).await?.unwrap_or(0))
}

/// Delete every entry, keeping the table.
pub async fn clear_store(client: &Client, table: &dyn StoreTable) -> StoreResult<()> {
    let sql = table.clear();
    client
        .batch_execute(&sql)
        .await
        .map_err(|e| StoreError::execution(&e, &sql))?;
    warn!(table = table.name(), "store table cleared");
    Ok(())
}

pub async fn drop_store(client: &Client, table: &dyn StoreTable) -> StoreResult<()> {
    let sql = table.drop_table();
    client
        .batch_execute(&sql)
        .await
        .map_err(|e| StoreError::execution(&e, &sql))?;
    warn!(table = table.name(), "store table dropped");
    Ok(())
}

/// Bounding box of a feature table, `None` when it holds no geometry.
pub async fn feature_extent(client: &Client, table: &FeatureTable) -> StoreResult<Option<String>> {
    let sql = table.extent();
    let row = client
        .query_one(sql.as_str(), &[])
        .await
        .map_err(|e| StoreError::execution(&e, &sql))?;
    row.try_get(0).map_err(|e| StoreError::execution(&e, &sql))
}

/// Aggregates over the observations matched by a statistics query.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ObsStats {
    pub total: i64,
    pub phenomenon_time: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub result_time: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Bin start and observation count; empty bins are omitted.
    pub counts_by_time: Vec<(DateTime<Utc>, i64)>,
}

/// Run the summary query and, with a bin size, the histogram query of an
/// [`EntriesQueryBuilder::stats`](crate::query::EntriesQueryBuilder::stats)
/// query.
pub async fn obs_stats(
    client: &Client,
    query: &EntriesQuery,
    bin_secs: Option<u64>,
) -> StoreResult<ObsStats> {
    let sql = query.to_summary_query()?;
    debug!(sql = %sql, "observation statistics");
    let row = client
        .query_one(sql.as_str(), &[])
        .await
        .map_err(|e| StoreError::execution(&e, &sql))?;
    let get_time = |col: &str| -> StoreResult<Option<DateTime<Utc>>> {
        row.try_get(col).map_err(|e| StoreError::execution(&e, &sql))
    };
    let mut stats = ObsStats {
        total: row.try_get("count").map_err(|e| StoreError::execution(&e, &sql))?,
        phenomenon_time: get_time("phenomenon_begin")?.zip(get_time("phenomenon_end")?),
        result_time: get_time("result_begin")?.zip(get_time("result_end")?),
        counts_by_time: Vec::new(),
    };

    let Some(bin_secs) = bin_secs else {
        return Ok(stats);
    };
    let sql = query.to_histogram_query(bin_secs)?;
    let rows = client
        .query(sql.as_str(), &[])
        .await
        .map_err(|e| StoreError::execution(&e, &sql))?;
    for row in rows {
        let start: i64 = row
            .try_get("interval_alias")
            .map_err(|e| StoreError::execution(&e, &sql))?;
        let count: i64 = row.try_get("count").map_err(|e| StoreError::execution(&e, &sql))?;
        match DateTime::from_timestamp(start, 0) {
            Some(at) => stats.counts_by_time.push((at, count)),
            None => warn!(start, "histogram bin outside the representable time range"),
        }
    }
    Ok(stats)
}
