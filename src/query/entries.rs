//! Entries query builder.
//!
//! Collects the base table, the tables of linked stores, typed sub-filters
//! and the projection, then compiles everything in one go at [`build`].
//!
//! [`build`]: EntriesQueryBuilder::build
use tracing::debug;

use super::compiler::{Entity, FilterCompiler, LinkFilter, Operation, TableBindings};
use super::generator::QueryGenerator;
use super::obs::{lower_stats_scope, StatsScope};
use crate::error::{StoreError, StoreResult};
use crate::filter::{DataStreamFilter, FoiFilter, ObsFilter, SystemFilter};

#[derive(Debug, Clone)]
pub struct EntriesQueryBuilder {
    op: Operation,
    entity: Entity,
    table: Option<String>,
    bindings: TableBindings,
    obs_filter: Option<ObsFilter>,
    datastream_filter: Option<DataStreamFilter>,
    foi_filter: Option<FoiFilter>,
    system_filter: Option<SystemFilter>,
    fields: Vec<String>,
    limit: Option<u64>,
    stats: Option<StatsScope>,
}

impl EntriesQueryBuilder {
    fn new(op: Operation, entity: Entity) -> Self {
        Self {
            op,
            entity,
            table: None,
            bindings: TableBindings::new(),
            obs_filter: None,
            datastream_filter: None,
            foi_filter: None,
            system_filter: None,
            fields: Vec::new(),
            limit: None,
            stats: None,
        }
    }

    pub fn select(entity: Entity) -> Self {
        Self::new(Operation::Select, entity)
    }

    pub fn remove(entity: Entity) -> Self {
        Self::new(Operation::Remove, entity)
    }

    /// Observations of one data stream or feature of interest, for
    /// [`EntriesQuery::to_histogram_query`] and
    /// [`EntriesQuery::to_summary_query`].
    pub fn stats(scope: StatsScope) -> Self {
        Self {
            stats: Some(scope),
            ..Self::new(Operation::Select, Entity::Observation)
        }
    }

    /// Table holding the entries. Falls back to the binding for the base
    /// entity when unset.
    pub fn table_name(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn link_to(mut self, entity: Entity, table: impl Into<String>) -> Self {
        self.bindings.set(entity, table);
        self
    }

    pub fn with_bindings(mut self, bindings: TableBindings) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn with_obs_filter(mut self, filter: ObsFilter) -> Self {
        self.obs_filter = Some(filter);
        self
    }

    pub fn with_datastream_filter(mut self, filter: DataStreamFilter) -> Self {
        self.datastream_filter = Some(filter);
        self
    }

    pub fn with_foi_filter(mut self, filter: FoiFilter) -> Self {
        self.foi_filter = Some(filter);
        self
    }

    pub fn with_system_filter(mut self, filter: SystemFilter) -> Self {
        self.system_filter = Some(filter);
        self
    }

    /// Columns to project; empty selects `table.*`.
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(self) -> StoreResult<EntriesQuery> {
        let fallback = self.bindings.get(self.entity).map(String::from);
        let Some(table) = self.table.or(fallback) else {
            return Err(StoreError::Configuration(format!(
                "no table name given for {} entries",
                self.entity
            )));
        };
        let mut bindings = self.bindings;
        bindings.set(self.entity, table.clone());

        let compiler = FilterCompiler::on_table(self.op, self.entity, &table, &bindings);
        let mut generator = QueryGenerator::new();
        // same-entity filters compile on the base table, others link to it
        if let Some(f) = &self.obs_filter {
            f.link_from(&compiler, &mut generator)?;
        }
        if let Some(f) = &self.datastream_filter {
            f.link_from(&compiler, &mut generator)?;
        }
        if let Some(f) = &self.foi_filter {
            f.link_from(&compiler, &mut generator)?;
        }
        if let Some(f) = &self.system_filter {
            f.link_from(&compiler, &mut generator)?;
        }
        if let Some(scope) = self.stats {
            lower_stats_scope(&compiler, scope, &mut generator);
        }

        let limit = match self.entity {
            Entity::Observation => self
                .limit
                .or_else(|| self.obs_filter.as_ref().and_then(|f| f.limit)),
            _ => self.limit,
        };

        let query = EntriesQuery {
            op: self.op,
            entity: self.entity,
            table,
            generator,
            fields: self.fields,
            limit,
        };
        debug!(entity = %self.entity, op = %self.op, sql = %query.to_query(), "compiled entries query");
        Ok(query)
    }
}

/// A compiled entries query, ready to render.
#[derive(Debug, Clone)]
pub struct EntriesQuery {
    op: Operation,
    entity: Entity,
    table: String,
    generator: QueryGenerator,
    fields: Vec<String>,
    limit: Option<u64>,
}

impl EntriesQuery {
    pub fn to_query(&self) -> String {
        self.generator
            .render_with(&self.table, self.op, &self.fields, self.limit)
    }

    pub fn to_count_query(&self) -> String {
        self.generator.render_count(&self.table)
    }

    /// Observation counts per time bin of `bin_secs` seconds, one row per
    /// non-empty bin: `interval_alias` (bin start, epoch seconds) and
    /// `count`.
    pub fn to_histogram_query(&self, bin_secs: u64) -> StoreResult<String> {
        if bin_secs == 0 {
            return Err(StoreError::Validation(
                "histogram bin size must be positive".to_string(),
            ));
        }
        let entries = self.stats_source()?;
        Ok(format!(
            "SELECT (floor(extract(epoch FROM entries.phenomenonTime) / {b}) * {b})::bigint \
             AS interval_alias, COUNT(*) AS count FROM ({entries}) AS entries \
             GROUP BY interval_alias ORDER BY interval_alias",
            b = bin_secs
        ))
    }

    /// Total count and the phenomenon / result time spans of the matching
    /// observations, as a single row.
    pub fn to_summary_query(&self) -> StoreResult<String> {
        let entries = self.stats_source()?;
        Ok(format!(
            "SELECT COUNT(*) AS count, \
             MIN(entries.phenomenonTime) AS phenomenon_begin, \
             MAX(entries.phenomenonTime) AS phenomenon_end, \
             MIN(entries.resultTime) AS result_begin, \
             MAX(entries.resultTime) AS result_end \
             FROM ({entries}) AS entries"
        ))
    }

    /// Time columns of the matching observations, limit dropped.
    fn stats_source(&self) -> StoreResult<String> {
        if self.entity != Entity::Observation || self.op != Operation::Select {
            return Err(StoreError::Unsupported(format!(
                "statistics are only computed over selected observations, not {} {} entries",
                self.op, self.entity
            )));
        }
        let fields = [
            format!("{}.phenomenonTime", self.table),
            format!("{}.resultTime", self.table),
        ];
        Ok(self
            .generator
            .render_with(&self.table, self.op, &fields, None))
    }

    pub fn generator(&self) -> &QueryGenerator {
        &self.generator
    }

    pub fn operation(&self) -> Operation {
        self.op
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}
