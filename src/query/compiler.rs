//! Filter -> query fragment compiler.
//!
//! A [`FilterCompiler`] is tagged with the operation (select or remove) and
//! the entity it compiles for, and knows which physical table backs every
//! linked entity. Compiling a filter appends fragments to one shared
//! [`QueryGenerator`]; sub-filters on linked entities either compile against a
//! local foreign key column or join the linked table and recurse into a child
//! compiler scoped to it.
use serde::{Deserialize, Serialize};
use std::fmt;

use super::generator::QueryGenerator;
use crate::error::{StoreError, StoreResult};
use crate::filter::{
    BigId, DataStreamFilter, FoiFilter, FullTextFilter, LocationFilter, ObsFilter, SystemFilter,
    TemporalFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Select,
    Remove,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Select => write!(f, "select"),
            Operation::Remove => write!(f, "remove"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Observation,
    DataStream,
    Foi,
    System,
}

impl Entity {
    /// Store name used in error messages ("No linked foi store").
    pub fn store_name(&self) -> &'static str {
        match self {
            Entity::Observation => "observation",
            Entity::DataStream => "datastream",
            Entity::Foi => "foi",
            Entity::System => "system",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.store_name())
    }
}

/// Physical table backing each entity role. A missing entry means the
/// datastore has no linked store for that entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableBindings {
    pub obs: Option<String>,
    pub datastream: Option<String>,
    pub foi: Option<String>,
    pub system: Option<String>,
}

impl TableBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity: Entity, table: impl Into<String>) -> Self {
        self.set(entity, table);
        self
    }

    pub fn set(&mut self, entity: Entity, table: impl Into<String>) {
        let slot = match entity {
            Entity::Observation => &mut self.obs,
            Entity::DataStream => &mut self.datastream,
            Entity::Foi => &mut self.foi,
            Entity::System => &mut self.system,
        };
        *slot = Some(table.into());
    }

    pub fn get(&self, entity: Entity) -> Option<&str> {
        match entity {
            Entity::Observation => self.obs.as_deref(),
            Entity::DataStream => self.datastream.as_deref(),
            Entity::Foi => self.foi.as_deref(),
            Entity::System => self.system.as_deref(),
        }
    }
}

/// A filter value that can be lowered into query fragments.
pub trait Filter {
    const ENTITY: Entity;

    /// Append this filter's fragments, compiled by `compiler` on its table.
    fn lower(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()>;
}

impl Filter for ObsFilter {
    const ENTITY: Entity = Entity::Observation;

    fn lower(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()> {
        super::obs::lower(compiler, self, gen)
    }
}

impl Filter for DataStreamFilter {
    const ENTITY: Entity = Entity::DataStream;

    fn lower(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()> {
        super::datastream::lower(compiler, self, gen)
    }
}

impl Filter for FoiFilter {
    const ENTITY: Entity = Entity::Foi;

    fn lower(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()> {
        super::feature::lower_foi(compiler, self, gen)
    }
}

impl Filter for SystemFilter {
    const ENTITY: Entity = Entity::System;

    fn lower(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()> {
        super::system::lower(compiler, self, gen)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FilterCompiler<'a> {
    op: Operation,
    entity: Entity,
    table: &'a str,
    bindings: &'a TableBindings,
}

impl<'a> FilterCompiler<'a> {
    /// Compiler for `entity` on the table bound to it.
    pub fn new(op: Operation, entity: Entity, bindings: &'a TableBindings) -> StoreResult<Self> {
        let table = bindings
            .get(entity)
            .ok_or_else(|| StoreError::no_linked_store(entity.store_name()))?;
        Ok(Self::on_table(op, entity, table, bindings))
    }

    /// Compiler for `entity` on an explicit table.
    pub fn on_table(
        op: Operation,
        entity: Entity,
        table: &'a str,
        bindings: &'a TableBindings,
    ) -> Self {
        Self {
            op,
            entity,
            table,
            bindings,
        }
    }

    pub fn operation(&self) -> Operation {
        self.op
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn table(&self) -> &'a str {
        self.table
    }

    pub fn bindings(&self) -> &'a TableBindings {
        self.bindings
    }

    pub fn compile<F: Filter>(&self, filter: &F, gen: &mut QueryGenerator) -> StoreResult<()> {
        if F::ENTITY != self.entity {
            return Err(StoreError::Unsupported(format!(
                "cannot compile a {} filter with a {} compiler",
                F::ENTITY,
                self.entity
            )));
        }
        filter.lower(self, gen)
    }

    /// Compile into a fresh generator.
    pub fn compile_new<F: Filter>(&self, filter: &F) -> StoreResult<QueryGenerator> {
        let mut gen = QueryGenerator::new();
        self.compile(filter, &mut gen)?;
        Ok(gen)
    }

    /// Attach a filter on another entity to this compiler's entity, through
    /// the same link logic used for embedded sub-filters.
    pub fn link<F: LinkFilter>(&self, filter: &F, gen: &mut QueryGenerator) -> StoreResult<()> {
        filter.link_from(self, gen)
    }

    /// Child compiler for a linked entity, or `None` when no store is linked.
    pub(crate) fn linked(&self, entity: Entity) -> Option<FilterCompiler<'a>> {
        self.bindings
            .get(entity)
            .map(|table| Self::on_table(self.op, entity, table, self.bindings))
    }

    pub(crate) fn require_linked(&self, entity: Entity) -> StoreResult<FilterCompiler<'a>> {
        self.linked(entity)
            .ok_or_else(|| StoreError::no_linked_store(entity.store_name()))
    }

    /// Fully qualified column of this compiler's table.
    pub(crate) fn col(&self, column: &str) -> String {
        format!("{}.{}", self.table, column)
    }

    /// Latest-value windowing: one row per partition, most recent first.
    pub(crate) fn latest(
        &self,
        field: &str,
        partition: &[String],
        time_desc: String,
        gen: &mut QueryGenerator,
    ) -> StoreResult<()> {
        if self.op == Operation::Remove {
            return Err(StoreError::Unsupported(format!(
                "latest {} filter cannot be used to remove {} entries",
                field, self.entity
            )));
        }
        for col in partition {
            gen.add_distinct(col.clone());
        }
        for col in partition {
            gen.add_order_by(col.clone());
        }
        gen.add_order_by(format!("{} DESC", time_desc));
        Ok(())
    }
}

/// Filters that can be attached to a compiler of a different entity.
pub trait LinkFilter {
    fn link_from(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator)
        -> StoreResult<()>;
}

impl LinkFilter for DataStreamFilter {
    fn link_from(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()> {
        match compiler.entity() {
            Entity::Observation => super::obs::link_datastream(compiler, self, gen),
            Entity::System => super::system::link_datastream(compiler, self, gen),
            Entity::DataStream => compiler.compile(self, gen),
            Entity::Foi => Err(unsupported_link(Entity::DataStream, Entity::Foi)),
        }
    }
}

impl LinkFilter for FoiFilter {
    fn link_from(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()> {
        match compiler.entity() {
            Entity::Observation => super::obs::link_foi(compiler, self, gen),
            Entity::Foi => compiler.compile(self, gen),
            other => Err(unsupported_link(Entity::Foi, other)),
        }
    }
}

impl LinkFilter for SystemFilter {
    fn link_from(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()> {
        match compiler.entity() {
            Entity::DataStream => super::datastream::link_system(compiler, self, gen),
            // observations reach systems through their data stream
            Entity::Observation => {
                let ds = DataStreamFilter::new().with_system(self.clone());
                super::obs::link_datastream(compiler, &ds, gen)
            }
            Entity::System => compiler.compile(self, gen),
            Entity::Foi => Err(unsupported_link(Entity::System, Entity::Foi)),
        }
    }
}

impl LinkFilter for ObsFilter {
    fn link_from(&self, compiler: &FilterCompiler<'_>, gen: &mut QueryGenerator) -> StoreResult<()> {
        match compiler.entity() {
            Entity::Observation => compiler.compile(self, gen),
            other => {
                compiler.require_linked(Entity::Observation)?;
                Err(unsupported_link(Entity::Observation, other))
            }
        }
    }
}

pub(crate) fn unsupported_link(from: Entity, to: Entity) -> StoreError {
    StoreError::Unsupported(format!("{} filter cannot be applied to {} entries", from, to))
}

// ---------------------------------------------------------------------------
// Shared fragment builders
// ---------------------------------------------------------------------------

/// Quote a text literal, doubling embedded single quotes.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `col IS NULL` for the none sentinel, otherwise `col IN (...)` in input order.
pub(crate) fn id_set_condition(column: &str, ids: &[BigId]) -> String {
    if ids.iter().any(BigId::is_none) {
        return format!("{} IS NULL", column);
    }
    let mut items: Vec<String> = ids.iter().map(ToString::to_string).collect();
    if items.is_empty() {
        // IN (NULL) never matches, keeping empty sets valid SQL
        items.push("NULL".to_string());
    }
    format!("{} IN ({})", column, items.join(","))
}

/// Unique id match; ids containing `*` are wildcards and use `ILIKE`.
pub(crate) fn unique_id_condition(expr: &str, uids: &[String]) -> String {
    let terms: Vec<String> = uids
        .iter()
        .map(|uid| {
            if uid.contains('*') {
                format!("{} ILIKE {}", expr, quote_literal(&uid.replace('*', "%")))
            } else {
                format!("{} = {}", expr, quote_literal(uid))
            }
        })
        .collect();
    if terms.is_empty() {
        return format!("{} IN (NULL)", expr);
    }
    format!("({})", terms.join(" OR "))
}

pub(crate) fn text_in_condition(expr: &str, values: &[String]) -> String {
    let items: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
    if items.is_empty() {
        return format!("{} IN (NULL)", expr);
    }
    format!("{} IN ({})", expr, items.join(","))
}

pub(crate) fn full_text_condition(expr: &str, filter: &FullTextFilter) -> String {
    let pattern = format!("({})", filter.keywords.join("|"));
    format!("{} ~* {}", expr, quote_literal(&pattern))
}

pub(crate) fn location_condition(geometry: &str, filter: &LocationFilter) -> String {
    format!(
        "ST_Intersects({}, ST_GeomFromText({}, {}))",
        geometry,
        quote_literal(&filter.wkt),
        filter.srid
    )
}

/// Closed-interval containment of a timestamp column.
pub(crate) fn instant_range_condition(
    column: &str,
    filter: &TemporalFilter,
) -> StoreResult<Option<String>> {
    Ok(filter.bounds()?.map(|(min, max)| {
        format!("tstzrange('{}','{}','[]') @> {}", min, max, column)
    }))
}

/// Comparison of a stored `[begin, end)` validity period with the filter range.
pub(crate) fn period_range_condition(
    begin: &str,
    end: &str,
    filter: &TemporalFilter,
) -> StoreResult<Option<String>> {
    Ok(filter.bounds()?.map(|(min, max)| {
        format!(
            "tstzrange({}, {}) {} '[{},{}]'::tstzrange",
            begin,
            end,
            filter.op().sql_operator(),
            min,
            max
        )
    }))
}

/// Validity period that includes the current time; an open end is still valid.
pub(crate) fn period_current_condition(begin: &str, end: &str) -> String {
    format!(
        "({begin} IS NOT NULL AND {begin} <= now() AND ({end} IS NULL OR {end} >= now()))"
    )
}
