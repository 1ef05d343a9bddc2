//! Single-session writer.
//!
//! One dedicated auto-commit connection, kept apart from the pool. Each
//! worker prepares its own statement once and reuses it for every row.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::{Client, Statement};

use super::connection::{create_client, ConnectionConfig};
use crate::error::{StoreError, StoreResult};
use crate::filter::BigId;
use crate::query::compiler::quote_literal;
use crate::query::tables::{ObsTable, StoreTable};

#[derive(Clone)]
pub struct SingleSessionWriter {
    client: Arc<Client>,
}

impl SingleSessionWriter {
    pub async fn connect(config: &ConnectionConfig) -> StoreResult<Self> {
        Ok(Self::from_client(create_client(config).await?))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }

    /// Prepare `sql` for one worker.
    pub async fn worker(&self, sql: &str) -> StoreResult<WorkerStatement> {
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| StoreError::execution(&e, sql))?;
        Ok(WorkerStatement {
            client: Arc::clone(&self.client),
            statement,
            sql: sql.to_string(),
        })
    }

    pub async fn obs_worker(&self, table: &ObsTable) -> StoreResult<WorkerStatement> {
        self.worker(&table.insert()).await
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }
}

/// A statement prepared on the writer's session.
pub struct WorkerStatement {
    client: Arc<Client>,
    statement: Statement,
    sql: String,
}

impl WorkerStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub async fn execute(&self, params: &[&(dyn ToSql + Sync)]) -> StoreResult<u64> {
        self.client
            .execute(&self.statement, params)
            .await
            .map_err(|e| StoreError::execution(&e, &self.sql))
    }

    /// Run a statement returning the id of the written row.
    pub async fn execute_returning_id(&self, params: &[&(dyn ToSql + Sync)]) -> StoreResult<BigId> {
        let row = self
            .client
            .query_one(&self.statement, params)
            .await
            .map_err(|e| StoreError::execution(&e, &self.sql))?;
        let id: i64 = row
            .try_get(0)
            .map_err(|e| StoreError::execution(&e, &self.sql))?;
        Ok(BigId::new(id))
    }

    /// Insert one observation; the statement must come from
    /// [`ObsTable::insert`].
    pub async fn insert_obs(&self, obs: &ObsRecord) -> StoreResult<BigId> {
        let datastream_id = obs.datastream_id.id();
        let foi_id = obs.foi_column();
        let result_time = obs.effective_result_time();
        let result = Json(&obs.result);
        self.execute_returning_id(&[
            &datastream_id,
            &foi_id,
            &obs.phenomenon_time,
            &result_time,
            &result,
        ])
        .await
    }
}

/// One observation row as written by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsRecord {
    pub datastream_id: BigId,
    #[serde(default)]
    pub foi_id: BigId,
    pub phenomenon_time: DateTime<Utc>,
    #[serde(default)]
    pub result_time: Option<DateTime<Utc>>,
    pub result: serde_json::Value,
}

impl ObsRecord {
    /// The none sentinel is stored as NULL.
    pub fn foi_column(&self) -> Option<i64> {
        (!self.foi_id.is_none()).then(|| self.foi_id.id())
    }

    /// Result time defaults to the phenomenon time.
    pub fn effective_result_time(&self) -> DateTime<Utc> {
        self.result_time.unwrap_or(self.phenomenon_time)
    }

    /// Self-contained INSERT text for batched submission, values inlined.
    pub fn insert_statement(&self, table: &ObsTable) -> String {
        let foi = self
            .foi_column()
            .map_or_else(|| "NULL".to_string(), |id| id.to_string());
        format!(
            "INSERT INTO {} (datastreamid, foiid, phenomenonTime, resultTime, result) \
             VALUES ({}, {}, {}, {}, {})",
            table.name(),
            self.datastream_id,
            foi,
            quote_literal(&self.phenomenon_time.to_rfc3339()),
            quote_literal(&self.effective_result_time().to_rfc3339()),
            quote_literal(&self.result.to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> ObsRecord {
        ObsRecord {
            datastream_id: BigId::new(3),
            foi_id: BigId::NONE,
            phenomenon_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            result_time: None,
            result: serde_json::json!({ "temp": 21.5 }),
        }
    }

    #[test]
    fn test_none_foi_stored_as_null() {
        assert_eq!(record().foi_column(), None);
        let with_foi = ObsRecord {
            foi_id: BigId::new(9),
            ..record()
        };
        assert_eq!(with_foi.foi_column(), Some(9));
    }

    #[test]
    fn test_result_time_defaults_to_phenomenon_time() {
        let obs = record();
        assert_eq!(obs.effective_result_time(), obs.phenomenon_time);
        let later = Utc.with_ymd_and_hms(2024, 5, 1, 12, 5, 0).unwrap();
        let obs = ObsRecord {
            result_time: Some(later),
            ..obs
        };
        assert_eq!(obs.effective_result_time(), later);
    }

    #[test]
    fn test_insert_statement() {
        let sql = record().insert_statement(&ObsTable::new("obs"));
        assert_eq!(
            sql,
            "INSERT INTO obs (datastreamid, foiid, phenomenonTime, resultTime, result) \
             VALUES (3, NULL, '2024-05-01T12:00:00+00:00', '2024-05-01T12:00:00+00:00', '{\"temp\":21.5}')"
        );
    }

    #[test]
    fn test_deserialize_record() {
        let line = r#"{"datastream_id":3,"phenomenon_time":"2024-05-01T12:00:00Z","result":{"temp":21.5}}"#;
        let obs: ObsRecord = serde_json::from_str(line).unwrap();
        assert_eq!(obs, record());
    }
}
