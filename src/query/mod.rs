//! Filter query compilation.
//!
//! ```text
//! filter value (ObsFilter, DataStreamFilter, ...)
//!       ↓
//! FilterCompiler  (per entity, per operation)
//!       ↓
//! QueryGenerator  (joins, conditions, distinct, order)
//!       ↓
//! SELECT / DELETE / COUNT / statistics text
//! ```
pub mod compiler;
mod datastream;
pub mod entries;
mod feature;
pub mod generator;
mod obs;
mod system;
pub mod tables;

pub use compiler::{Entity, Filter, FilterCompiler, LinkFilter, Operation, TableBindings};
pub use entries::{EntriesQuery, EntriesQueryBuilder};
pub use obs::StatsScope;
pub use generator::{Join, QueryGenerator};

use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser as SqlParser;

use crate::error::{StoreError, StoreResult};

/// Parse generated SQL with the PostgreSQL dialect and make sure it holds
/// exactly one statement.
pub fn check_syntax(sql: &str) -> StoreResult<()> {
    let dialect = PostgreSqlDialect {};
    let statements = SqlParser::parse_sql(&dialect, sql)
        .map_err(|e| StoreError::Validation(format!("SQL parse error: {}", e)))?;
    if statements.len() != 1 {
        return Err(StoreError::Validation(format!(
            "expected 1 statement, found {}",
            statements.len()
        )));
    }
    Ok(())
}
