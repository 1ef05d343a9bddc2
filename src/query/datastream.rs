//! Data stream filter lowering.
//!
//! Data stream rows keep their whole description in a `data` JSONB column;
//! every predicate here is a JSON path expression over it.
use super::compiler::{
    full_text_condition, id_set_condition, period_current_condition, period_range_condition,
    quote_literal, text_in_condition, unique_id_condition, FilterCompiler,
};
use super::generator::{Join, QueryGenerator};
use crate::error::StoreResult;
use crate::filter::{DataStreamFilter, SystemFilter, TemporalFilter};
use crate::query::Entity;

fn system_id_expr(data: &str) -> String {
    format!("({}->'system@id'->'internalID'->>'id')::bigint", data)
}

pub(super) fn lower(
    compiler: &FilterCompiler<'_>,
    filter: &DataStreamFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    let data = compiler.col("data");

    if let Some(ids) = &filter.internal_ids {
        gen.add_condition(id_set_condition(&compiler.col("id"), ids));
    }
    if let Some(ft) = &filter.full_text {
        let expr = format!("({}->'recordSchema'->>'description')", data);
        gen.add_condition(full_text_condition(&expr, ft));
    }
    if let Some(time) = &filter.valid_time {
        lower_valid_time(compiler, time, gen)?;
    }
    if let Some(names) = &filter.output_names {
        let expr = format!("({}->>'outputName')", data);
        gen.add_condition(text_in_condition(&expr, names));
    }
    if let Some(props) = &filter.observed_properties {
        gen.add_condition(observed_properties_condition(&data, props));
    }
    if let Some(system) = &filter.system {
        link_system(compiler, system, gen)?;
    }
    if let Some(obs) = &filter.observation {
        compiler.link(obs.as_ref(), gen)?;
    }
    Ok(())
}

fn lower_valid_time(
    compiler: &FilterCompiler<'_>,
    time: &TemporalFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    let data = compiler.col("data");
    let begin = format!("({}->'validTime'->>'begin')::timestamptz", data);
    let end = format!("({}->'validTime'->>'end')::timestamptz", data);

    match time {
        TemporalFilter::Latest => {
            let partition = [format!("({}->>'name')", data), system_id_expr(&data)];
            compiler.latest("validTime", &partition, end, gen)?;
            gen.add_condition(format!("{}->'validTime'->'begin' IS NOT NULL", data));
        }
        TemporalFilter::Current => {
            gen.add_condition(period_current_condition(&begin, &end));
        }
        TemporalFilter::Range { .. } => {
            if let Some(cond) = period_range_condition(&begin, &end, time)? {
                gen.add_condition(format!("{}->'validTime'->'begin' IS NOT NULL", data));
                gen.add_condition(cond);
            }
        }
    }
    Ok(())
}

/// Match any of the property URIs anywhere in the record structure.
fn observed_properties_condition(data: &str, props: &[String]) -> String {
    if props.is_empty() {
        return "FALSE".to_string();
    }
    let terms: Vec<String> = props
        .iter()
        .map(|p| format!("@ == \"{}\"", p.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect();
    let path = format!("$.** ? ({})", terms.join(" || "));
    format!("jsonb_path_exists({}, {})", data, quote_literal(&path))
}

/// Restrict data streams by their parent system.
///
/// Identifier predicates are matched against the system reference embedded
/// in the data stream record; anything else joins the system table.
pub(super) fn link_system(
    compiler: &FilterCompiler<'_>,
    filter: &SystemFilter,
    gen: &mut QueryGenerator,
) -> StoreResult<()> {
    let data = compiler.col("data");

    if filter.needs_linked_table() {
        let sys = compiler.require_linked(Entity::System)?;
        gen.add_join(Join::new(
            sys.table(),
            format!("{} = {}", system_id_expr(&data), sys.col("id")),
        ));
        return sys.compile(filter, gen);
    }

    if let Some(uids) = &filter.unique_ids {
        let expr = format!("({}->'system@id'->>'uniqueID')", data);
        gen.add_condition(unique_id_condition(&expr, uids));
    }
    if let Some(ids) = &filter.internal_ids {
        gen.add_condition(id_set_condition(&system_id_expr(&data), ids));
    }
    Ok(())
}
