//! Observation filter lowering.
use super::compiler::{id_set_condition, instant_range_condition, FilterCompiler};
use super::generator::{Join, QueryGenerator};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::filter::{BigId, DataStreamFilter, FoiFilter, ObsFilter, TemporalFilter};
use crate::query::Entity;

/// The series an observation statistics query aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsScope {
    DataStream(BigId),
    Foi(BigId),
}

/// Pin the compiled filter to one data stream or feature of interest.
pub(super) fn lower_stats_scope(
    compiler: &FilterCompiler<'_>,
    scope: StatsScope,
    gen: &mut QueryGenerator,
) {
    let (column, id) = match scope {
        StatsScope::DataStream(id) => ("datastreamid", id),
        StatsScope::Foi(id) => ("foiid", id),
    };
    gen.add_condition(id_set_condition(&compiler.col(column), &[id]));
}

pub(super) fn lower(
    compiler: &FilterCompiler<'_>,
    filter: &ObsFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    if let Some(ids) = &filter.internal_ids {
        gen.add_condition(id_set_condition(&compiler.col("id"), ids));
    }
    if let Some(ds) = &filter.datastream {
        link_datastream(compiler, ds, gen)?;
    }
    if let Some(time) = &filter.phenomenon_time {
        lower_time(compiler, "phenomenonTime", time, gen)?;
    }
    if let Some(time) = &filter.result_time {
        lower_time(compiler, "resultTime", time, gen)?;
    }
    if let Some(foi) = &filter.foi {
        link_foi(compiler, foi, gen)?;
    }
    Ok(())
}

fn lower_time(
    compiler: &FilterCompiler<'_>,
    field: &str,
    time: &TemporalFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    let column = compiler.col(field);
    match time {
        TemporalFilter::Latest => {
            let partition = [compiler.col("datastreamid")];
            compiler.latest(field, &partition, column, gen)
        }
        TemporalFilter::Current => Err(StoreError::Unsupported(format!(
            "current time filter is not defined for observation {}",
            field
        ))),
        TemporalFilter::Range { .. } => {
            if let Some(cond) = instant_range_condition(&column, time)? {
                gen.add_condition(cond);
            }
            Ok(())
        }
    }
}

/// Restrict observations by their data stream.
///
/// An identifier-only filter is matched on `datastreamid` without touching
/// the data stream table.
pub(super) fn link_datastream(
    compiler: &FilterCompiler<'_>,
    filter: &DataStreamFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    if let Some(ids) = filter.only_internal_ids() {
        gen.add_condition(id_set_condition(&compiler.col("datastreamid"), ids));
        return Ok(());
    }

    let ds = compiler.require_linked(Entity::DataStream)?;
    gen.add_join(Join::new(
        ds.table(),
        format!("{} = {}", compiler.col("datastreamid"), ds.col("id")),
    ));
    ds.compile(filter, gen)
}

/// Restrict observations by their feature of interest.
pub(super) fn link_foi(
    compiler: &FilterCompiler<'_>,
    filter: &FoiFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    let foi_column = compiler.col("foiid");

    let Some(foi) = compiler.linked(Entity::Foi) else {
        if filter.unique_ids.is_some() || filter.needs_linked_table() {
            return Err(StoreError::no_linked_store(Entity::Foi.store_name()));
        }
        if let Some(ids) = &filter.internal_ids {
            gen.add_condition(id_set_condition(&foi_column, ids));
        }
        return Ok(());
    };

    if let Some(ids) = filter.only_internal_ids() {
        gen.add_condition(id_set_condition(&foi_column, ids));
        return Ok(());
    }

    gen.add_join(Join::new(
        foi.table(),
        format!("{} = {}", foi_column, foi.col("id")),
    ));
    foi.compile(filter, gen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{BigId, FullTextFilter, RangeOp, SystemFilter};
    use crate::query::{Operation, TableBindings};

    fn full_bindings() -> TableBindings {
        TableBindings::new()
            .with(Entity::Observation, "obs")
            .with(Entity::DataStream, "ds")
            .with(Entity::Foi, "foi")
            .with(Entity::System, "sys")
    }

    fn compile(op: Operation, bindings: &TableBindings, filter: &ObsFilter) -> StoreResult<String> {
        let compiler = FilterCompiler::new(op, Entity::Observation, bindings)?;
        let gen = compiler.compile_new(filter)?;
        Ok(gen.render("obs", op))
    }

    #[test]
    fn test_empty_filter_adds_nothing() {
        let b = full_bindings();
        for op in [Operation::Select, Operation::Remove] {
            let compiler = FilterCompiler::new(op, Entity::Observation, &b).unwrap();
            assert!(compiler.compile_new(&ObsFilter::new()).unwrap().is_empty());
        }
    }

    #[test]
    fn test_stats_scope_pins_series() {
        let b = full_bindings();
        let compiler = FilterCompiler::new(Operation::Select, Entity::Observation, &b).unwrap();

        let mut gen = QueryGenerator::new();
        lower_stats_scope(&compiler, StatsScope::DataStream(BigId::new(4)), &mut gen);
        assert_eq!(gen.conditions(), ["obs.datastreamid IN (4)"]);

        let mut gen = QueryGenerator::new();
        lower_stats_scope(&compiler, StatsScope::Foi(BigId::NONE), &mut gen);
        assert_eq!(gen.conditions(), ["obs.foiid IS NULL"]);
    }

    #[test]
    fn test_internal_ids_keep_order() {
        let filter = ObsFilter::new().with_internal_ids([3, 7, 9].map(BigId::new));
        let sql = compile(Operation::Select, &full_bindings(), &filter).unwrap();
        assert_eq!(sql, "SELECT obs.* FROM obs WHERE obs.id IN (3,7,9)");
    }

    #[test]
    fn test_none_foi_is_null() {
        let filter = ObsFilter::new().with_foi(FoiFilter::new().with_internal_ids([BigId::NONE]));
        let sql = compile(Operation::Select, &full_bindings(), &filter).unwrap();
        assert!(sql.contains("obs.foiid IS NULL"));
        assert!(!sql.contains(" IN ("));
        assert!(!sql.contains("JOIN"));
    }

    #[test]
    fn test_datastream_ids_use_local_column() {
        let filter = ObsFilter::new()
            .with_datastream(DataStreamFilter::new().with_internal_ids([BigId::new(12)]));
        let sql = compile(Operation::Select, &TableBindings::new().with(Entity::Observation, "obs"), &filter)
            .unwrap();
        assert_eq!(sql, "SELECT obs.* FROM obs WHERE obs.datastreamid IN (12)");
    }

    #[test]
    fn test_datastream_join_select_and_remove() {
        let filter = ObsFilter::new()
            .with_datastream(DataStreamFilter::new().with_output_names(["weather"]));
        let b = full_bindings();

        let select = compile(Operation::Select, &b, &filter).unwrap();
        assert_eq!(
            select,
            "SELECT obs.* FROM obs INNER JOIN ds ON obs.datastreamid = ds.id \
             WHERE (ds.data->>'outputName') IN ('weather')"
        );

        let remove = compile(Operation::Remove, &b, &filter).unwrap();
        assert_eq!(
            remove,
            "DELETE FROM obs USING ds WHERE obs.datastreamid = ds.id \
             AND (ds.data->>'outputName') IN ('weather')"
        );
        assert!(!remove.contains("INNER JOIN"));
    }

    #[test]
    fn test_datastream_join_without_binding() {
        let filter = ObsFilter::new()
            .with_datastream(DataStreamFilter::new().with_full_text(FullTextFilter::new(["temp"])));
        let b = TableBindings::new().with(Entity::Observation, "obs");
        let err = compile(Operation::Select, &b, &filter).unwrap_err();
        assert_eq!(err.to_string(), "configuration error: No linked datastream store");
    }

    #[test]
    fn test_latest_phenomenon_time() {
        let filter = ObsFilter::new().with_phenomenon_time(TemporalFilter::latest());
        let sql = compile(Operation::Select, &full_bindings(), &filter).unwrap();
        assert_eq!(
            sql,
            "SELECT DISTINCT ON (obs.datastreamid) obs.* FROM obs \
             ORDER BY obs.datastreamid, obs.phenomenonTime DESC"
        );
        assert!(!sql.contains("tstzrange"));
    }

    #[test]
    fn test_latest_result_time_orders_by_result_time() {
        let filter = ObsFilter::new().with_result_time(TemporalFilter::latest());
        let sql = compile(Operation::Select, &full_bindings(), &filter).unwrap();
        assert!(sql.ends_with("ORDER BY obs.datastreamid, obs.resultTime DESC"));
    }

    #[test]
    fn test_latest_rejected_for_remove() {
        let filter = ObsFilter::new().with_phenomenon_time(TemporalFilter::latest());
        let err = compile(Operation::Remove, &full_bindings(), &filter).unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn test_phenomenon_time_range() {
        let filter = ObsFilter::new().with_phenomenon_time(
            TemporalFilter::range("2024-01-01T00:00:00Z", "now").with_op(RangeOp::Contains),
        );
        let sql = compile(Operation::Remove, &full_bindings(), &filter).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM obs WHERE tstzrange('2024-01-01T00:00:00Z','now','[]') @> obs.phenomenonTime"
        );
    }

    #[test]
    fn test_current_time_unsupported() {
        let filter = ObsFilter::new().with_result_time(TemporalFilter::current());
        let err = compile(Operation::Select, &full_bindings(), &filter).unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn test_invalid_range_reported() {
        let filter = ObsFilter::new()
            .with_result_time(TemporalFilter::range("2024-02-01T00:00:00Z", "2024-01-01T00:00:00Z"));
        let err = compile(Operation::Select, &full_bindings(), &filter).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[test]
    fn test_foi_unique_ids_without_binding() {
        let filter = ObsFilter::new().with_foi(FoiFilter::new().with_unique_ids(["urn:foi:1"]));
        let b = TableBindings::new().with(Entity::Observation, "obs");
        let err = compile(Operation::Select, &b, &filter).unwrap_err();
        assert_eq!(err.to_string(), "configuration error: No linked foi store");
    }

    #[test]
    fn test_foi_ids_without_binding_use_local_column() {
        let filter = ObsFilter::new().with_foi(FoiFilter::new().with_internal_ids([BigId::new(4)]));
        let b = TableBindings::new().with(Entity::Observation, "obs");
        let sql = compile(Operation::Select, &b, &filter).unwrap();
        assert_eq!(sql, "SELECT obs.* FROM obs WHERE obs.foiid IN (4)");
    }

    #[test]
    fn test_foi_unique_ids_join() {
        let filter = ObsFilter::new().with_foi(FoiFilter::new().with_unique_ids(["urn:foi:1"]));
        let sql = compile(Operation::Select, &full_bindings(), &filter).unwrap();
        assert_eq!(
            sql,
            "SELECT obs.* FROM obs INNER JOIN foi ON obs.foiid = foi.id \
             WHERE ((foi.data->'properties'->>'uid') = 'urn:foi:1')"
        );
    }

    #[test]
    fn test_system_through_datastream() {
        let filter = ObsFilter::new().with_datastream(
            DataStreamFilter::new().with_system(SystemFilter::new().with_internal_ids([BigId::new(2)])),
        );
        let sql = compile(Operation::Select, &full_bindings(), &filter).unwrap();
        assert_eq!(
            sql,
            "SELECT obs.* FROM obs INNER JOIN ds ON obs.datastreamid = ds.id \
             WHERE (ds.data->'system@id'->'internalID'->>'id')::bigint IN (2)"
        );
    }

    #[test]
    fn test_system_members_join_chain() {
        let filter = ObsFilter::new().with_datastream(DataStreamFilter::new().with_system(
            SystemFilter::new().with_internal_ids([BigId::new(2)]).including_members(),
        ));
        let sql = compile(Operation::Remove, &full_bindings(), &filter).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM obs USING ds, sys WHERE obs.datastreamid = ds.id \
             AND (ds.data->'system@id'->'internalID'->>'id')::bigint = sys.id \
             AND (sys.id IN (2) OR sys.parentid IN (2))"
        );
    }

    #[test]
    fn test_compile_is_idempotent() {
        let filter = ObsFilter::new()
            .with_datastream(DataStreamFilter::new().with_output_names(["a", "b"]))
            .with_phenomenon_time(TemporalFilter::range("-infinity", "infinity"));
        let b = full_bindings();
        let first = compile(Operation::Select, &b, &filter).unwrap();
        let second = compile(Operation::Select, &b, &filter).unwrap();
        assert_eq!(first, second);
    }
}
