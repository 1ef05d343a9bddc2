//! Lowering for feature tables (features of interest and systems).
//!
//! Both share one layout: `id`, `parentid`, `geometry` and a GeoJSON-like
//! `data` document whose `properties` hold the uid, description and the
//! `[begin, end]` validity period.
use super::compiler::{
    full_text_condition, id_set_condition, location_condition, period_current_condition,
    period_range_condition, unique_id_condition, FilterCompiler,
};
use super::generator::QueryGenerator;
use crate::error::{StoreError, StoreResult};
use crate::filter::{BigId, FoiFilter, FullTextFilter, LocationFilter, TemporalFilter};

pub(super) fn uid_expr(compiler: &FilterCompiler<'_>) -> String {
    format!("({}->'properties'->>'uid')", compiler.col("data"))
}

fn description_expr(compiler: &FilterCompiler<'_>) -> String {
    format!("({}->'properties'->>'description')", compiler.col("data"))
}

fn valid_time_bound(compiler: &FilterCompiler<'_>, index: u8) -> String {
    format!(
        "({}->'properties'->'validTime'->>{})::timestamptz",
        compiler.col("data"),
        index
    )
}

/// Predicates common to every feature table.
pub(super) struct FeatureFields<'f> {
    pub unique_ids: Option<&'f [String]>,
    pub valid_time: Option<&'f TemporalFilter>,
    pub full_text: Option<&'f FullTextFilter>,
    pub location: Option<&'f LocationFilter>,
    /// Identifier-only parent constraint, already reduced to its id set.
    pub parent_ids: Option<&'f [BigId]>,
}

pub(super) fn lower_fields(
    compiler: &FilterCompiler<'_>,
    fields: &FeatureFields<'_>,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    if let Some(uids) = fields.unique_ids {
        gen.add_condition(unique_id_condition(&uid_expr(compiler), uids));
    }
    if let Some(time) = fields.valid_time {
        lower_valid_time(compiler, time, gen)?;
    }
    if let Some(ft) = fields.full_text {
        gen.add_condition(full_text_condition(&description_expr(compiler), ft));
    }
    if let Some(loc) = fields.location {
        gen.add_condition(location_condition(&compiler.col("geometry"), loc));
    }
    if let Some(ids) = fields.parent_ids {
        gen.add_condition(id_set_condition(&compiler.col("parentid"), ids));
    }
    Ok(())
}

fn lower_valid_time(
    compiler: &FilterCompiler<'_>,
    time: &TemporalFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    let begin = valid_time_bound(compiler, 0);
    let end = valid_time_bound(compiler, 1);
    match time {
        TemporalFilter::Latest => {
            // every version of a feature shares its id
            compiler.latest("validTime", &[compiler.col("id")], begin, gen)
        }
        TemporalFilter::Current => {
            gen.add_condition(period_current_condition(&begin, &end));
            Ok(())
        }
        TemporalFilter::Range { .. } => {
            if let Some(cond) = period_range_condition(&begin, &end, time)? {
                gen.add_condition(cond);
            }
            Ok(())
        }
    }
}

/// Reduce a parent filter to its id set; only identifier matching is
/// supported on the parent link.
pub(super) fn parent_ids<'f>(
    only_ids: Option<&'f [BigId]>,
    present: bool,
    entity: &str,
) -> StoreResult<Option<&'f [BigId]>> {
    match (present, only_ids) {
        (false, _) => Ok(None),
        (true, Some(ids)) => Ok(Some(ids)),
        (true, None) => Err(StoreError::Unsupported(format!(
            "parent {} filter only supports internal ids",
            entity
        ))),
    }
}

pub(super) fn lower_foi(
    compiler: &FilterCompiler<'_>,
    filter: &FoiFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    let parent = filter.parent.as_deref();
    let fields = FeatureFields {
        unique_ids: filter.unique_ids.as_deref(),
        valid_time: filter.valid_time.as_ref(),
        full_text: filter.full_text.as_ref(),
        location: filter.location.as_ref(),
        parent_ids: parent_ids(
            parent.and_then(FoiFilter::only_internal_ids),
            parent.is_some(),
            "foi",
        )?,
    };

    if let Some(ids) = &filter.internal_ids {
        gen.add_condition(id_set_condition(&compiler.col("id"), ids));
    }
    lower_fields(compiler, &fields, gen)?;
    if let Some(obs) = &filter.observation {
        compiler.link(obs.as_ref(), gen)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::ObsFilter;
    use crate::query::{Entity, Operation, TableBindings};

    fn compile(op: Operation, filter: &FoiFilter) -> StoreResult<String> {
        let b = TableBindings::new().with(Entity::Foi, "foi");
        let compiler = FilterCompiler::new(op, Entity::Foi, &b)?;
        Ok(compiler.compile_new(filter)?.render("foi", op))
    }

    #[test]
    fn test_empty_filter_adds_nothing() {
        let b = TableBindings::new().with(Entity::Foi, "foi");
        for op in [Operation::Select, Operation::Remove] {
            let compiler = FilterCompiler::new(op, Entity::Foi, &b).unwrap();
            assert!(compiler.compile_new(&FoiFilter::new()).unwrap().is_empty());
            assert!(!compile(op, &FoiFilter::new()).unwrap().contains("WHERE"));
        }
    }

    #[test]
    fn test_ids_and_unique_ids() {
        let filter = FoiFilter::new()
            .with_internal_ids([BigId::new(1), BigId::new(2)])
            .with_unique_ids(["urn:foi:station1"]);
        assert_eq!(
            compile(Operation::Select, &filter).unwrap(),
            "SELECT foi.* FROM foi WHERE foi.id IN (1,2) \
             AND ((foi.data->'properties'->>'uid') = 'urn:foi:station1')"
        );
    }

    #[test]
    fn test_location_and_full_text() {
        let filter = FoiFilter::new()
            .with_location(LocationFilter::intersects("POLYGON((0 0,1 0,1 1,0 0))"))
            .with_full_text(FullTextFilter::new(["river"]));
        let sql = compile(Operation::Remove, &filter).unwrap();
        assert_eq!(
            sql,
            "DELETE FROM foi WHERE (foi.data->'properties'->>'description') ~* '(river)' \
             AND ST_Intersects(foi.geometry, ST_GeomFromText('POLYGON((0 0,1 0,1 1,0 0))', 4326))"
        );
    }

    #[test]
    fn test_latest_valid_time_per_feature() {
        let filter = FoiFilter::new().with_valid_time(TemporalFilter::latest());
        assert_eq!(
            compile(Operation::Select, &filter).unwrap(),
            "SELECT DISTINCT ON (foi.id) foi.* FROM foi \
             ORDER BY foi.id, (foi.data->'properties'->'validTime'->>0)::timestamptz DESC"
        );
        assert!(compile(Operation::Remove, &filter).is_err());
    }

    #[test]
    fn test_valid_time_range() {
        let filter = FoiFilter::new().with_valid_time(TemporalFilter::range("-infinity", "now"));
        let sql = compile(Operation::Select, &filter).unwrap();
        assert!(sql.ends_with("&& '[-infinity,now]'::tstzrange"));
    }

    #[test]
    fn test_parent_ids() {
        let filter = FoiFilter::new().with_parent(FoiFilter::new().with_internal_ids([BigId::new(8)]));
        assert_eq!(
            compile(Operation::Select, &filter).unwrap(),
            "SELECT foi.* FROM foi WHERE foi.parentid IN (8)"
        );

        let nested = FoiFilter::new().with_parent(FoiFilter::new().with_unique_ids(["urn:x"]));
        let err = compile(Operation::Select, &nested).unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }

    #[test]
    fn test_observation_subfilter_needs_binding() {
        let filter = FoiFilter::new().with_observation(ObsFilter::new());
        let err = compile(Operation::Select, &filter).unwrap_err();
        assert_eq!(err.to_string(), "configuration error: No linked observation store");
    }
}
