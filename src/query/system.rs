//! System filter lowering.
use super::compiler::{id_set_condition, unsupported_link, FilterCompiler};
use super::feature::{lower_fields, parent_ids, FeatureFields};
use super::generator::QueryGenerator;
use crate::error::StoreResult;
use crate::filter::{DataStreamFilter, SystemFilter};
use crate::query::Entity;

pub(super) fn lower(
    compiler: &FilterCompiler<'_>,
    filter: &SystemFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    let parent = filter.parent.as_deref();
    let fields = FeatureFields {
        unique_ids: filter.unique_ids.as_deref(),
        valid_time: filter.valid_time.as_ref(),
        full_text: filter.full_text.as_ref(),
        location: filter.location.as_ref(),
        parent_ids: parent_ids(
            parent.and_then(SystemFilter::only_internal_ids),
            parent.is_some(),
            "system",
        )?,
    };

    if let Some(ids) = &filter.internal_ids {
        let own = id_set_condition(&compiler.col("id"), ids);
        if filter.include_members {
            let members = id_set_condition(&compiler.col("parentid"), ids);
            gen.add_condition(format!("({} OR {})", own, members));
        } else {
            gen.add_condition(own);
        }
    }
    lower_fields(compiler, &fields, gen)?;
    if let Some(ds) = &filter.datastream {
        link_datastream(compiler, ds, gen)?;
    }
    Ok(())
}

/// Systems selected by the data streams they own.
pub(super) fn link_datastream(
    compiler: &FilterCompiler<'_>,
    _filter: &DataStreamFilter,
    _gen: &mut QueryGenerator,
) -> StoreResult<()> {
    compiler.require_linked(Entity::DataStream)?;
    Err(unsupported_link(Entity::DataStream, Entity::System))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::filter::{BigId, LocationFilter, TemporalFilter};
    use crate::query::{Operation, TableBindings};

    fn compile(bindings: &TableBindings, filter: &SystemFilter) -> StoreResult<String> {
        let compiler = FilterCompiler::new(Operation::Select, Entity::System, bindings)?;
        Ok(compiler.compile_new(filter)?.render("sys", Operation::Select))
    }

    fn bindings() -> TableBindings {
        TableBindings::new().with(Entity::System, "sys")
    }

    #[test]
    fn test_empty_filter_adds_nothing() {
        let b = bindings();
        for op in [Operation::Select, Operation::Remove] {
            let compiler = FilterCompiler::new(op, Entity::System, &b).unwrap();
            assert!(compiler.compile_new(&SystemFilter::new()).unwrap().is_empty());
        }
    }

    #[test]
    fn test_internal_ids() {
        let filter = SystemFilter::new().with_internal_ids([BigId::new(4), BigId::new(1)]);
        assert_eq!(
            compile(&bindings(), &filter).unwrap(),
            "SELECT sys.* FROM sys WHERE sys.id IN (4,1)"
        );
    }

    #[test]
    fn test_include_members() {
        let filter = SystemFilter::new()
            .with_internal_ids([BigId::new(4)])
            .including_members();
        assert_eq!(
            compile(&bindings(), &filter).unwrap(),
            "SELECT sys.* FROM sys WHERE (sys.id IN (4) OR sys.parentid IN (4))"
        );
    }

    #[test]
    fn test_feature_fields() {
        let filter = SystemFilter::new()
            .with_unique_ids(["urn:osh:sys:1"])
            .with_valid_time(TemporalFilter::current())
            .with_location(LocationFilter::intersects("POINT(3 4)"));
        let sql = compile(&bindings(), &filter).unwrap();
        assert!(sql.contains("((sys.data->'properties'->>'uid') = 'urn:osh:sys:1')"));
        assert!(sql.contains("(sys.data->'properties'->'validTime'->>0)::timestamptz <= now()"));
        assert!(sql.contains("ST_Intersects(sys.geometry"));
    }

    #[test]
    fn test_parent_ids() {
        let filter = SystemFilter::new()
            .with_parent(SystemFilter::new().with_internal_ids([BigId::new(10)]));
        assert_eq!(
            compile(&bindings(), &filter).unwrap(),
            "SELECT sys.* FROM sys WHERE sys.parentid IN (10)"
        );
    }

    #[test]
    fn test_datastream_subfilter() {
        let filter = SystemFilter::new().with_datastream(DataStreamFilter::new());
        let err = compile(&bindings(), &filter).unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));

        let b = bindings().with(Entity::DataStream, "ds");
        let err = compile(&b, &filter).unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(_)));
    }
}
