//! Benchmarks for filter compilation.
//!
//! Covers building entries queries from typed filters of growing depth,
//! rendering them to SQL and the count wrapper.
//!
//! Run with: `cargo bench`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pgobs::filter::{
    BigId, DataStreamFilter, FoiFilter, FullTextFilter, LocationFilter, ObsFilter, SystemFilter,
    TemporalFilter,
};
use pgobs::query::{Entity, EntriesQueryBuilder, TableBindings};
use std::hint::black_box;

fn bindings() -> TableBindings {
    TableBindings::new()
        .with(Entity::Observation, "obs")
        .with(Entity::DataStream, "datastreams")
        .with(Entity::Foi, "fois")
        .with(Entity::System, "systems")
}

fn cases() -> Vec<(&'static str, EntriesQueryBuilder)> {
    vec![
        (
            "obs_ids",
            EntriesQueryBuilder::select(Entity::Observation)
                .with_obs_filter(ObsFilter::new().with_internal_ids((1..=100).map(BigId::new))),
        ),
        (
            "obs_time_range",
            EntriesQueryBuilder::select(Entity::Observation).with_obs_filter(
                ObsFilter::new()
                    .with_phenomenon_time(TemporalFilter::range(
                        "2024-01-01T00:00:00Z",
                        "2024-02-01T00:00:00Z",
                    ))
                    .with_limit(1000),
            ),
        ),
        (
            "obs_latest_by_output",
            EntriesQueryBuilder::select(Entity::Observation)
                .with_obs_filter(ObsFilter::new().with_phenomenon_time(TemporalFilter::latest()))
                .with_datastream_filter(
                    DataStreamFilter::new().with_output_names(["temp", "humidity"]),
                ),
        ),
        (
            "obs_system_members",
            EntriesQueryBuilder::select(Entity::Observation).with_obs_filter(
                ObsFilter::new().with_datastream(
                    DataStreamFilter::new()
                        .with_system(SystemFilter::new().with_unique_ids(["urn:osh:sys:1"]).including_members()),
                ),
            ),
        ),
        (
            "obs_foi_location",
            EntriesQueryBuilder::select(Entity::Observation).with_obs_filter(
                ObsFilter::new().with_foi(
                    FoiFilter::new()
                        .with_location(LocationFilter::intersects(
                            "POLYGON((0 0, 10 0, 10 10, 0 10, 0 0))",
                        ))
                        .with_full_text(FullTextFilter::new(["river", "gauge"])),
                ),
            ),
        ),
        (
            "datastream_properties",
            EntriesQueryBuilder::select(Entity::DataStream).with_datastream_filter(
                DataStreamFilter::new()
                    .with_observed_properties([
                        "http://qudt.org/vocab/quantitykind/Temperature",
                        "http://qudt.org/vocab/quantitykind/Pressure",
                    ])
                    .with_valid_time(TemporalFilter::Current),
            ),
        ),
        (
            "remove_obs",
            EntriesQueryBuilder::remove(Entity::Observation).with_obs_filter(
                ObsFilter::new().with_result_time(TemporalFilter::range("-infinity", "now")),
            ),
        ),
    ]
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");

    for (name, builder) in cases() {
        let builder = builder.with_bindings(bindings());
        group.bench_with_input(BenchmarkId::new("build", name), &builder, |b, builder| {
            b.iter(|| black_box(builder.clone()).build().unwrap());
        });
    }

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render");

    for (name, builder) in cases() {
        let query = builder.with_bindings(bindings()).build().unwrap();
        group.bench_with_input(BenchmarkId::new("to_query", name), &query, |b, query| {
            b.iter(|| black_box(query).to_query());
        });
        group.bench_with_input(BenchmarkId::new("to_count_query", name), &query, |b, query| {
            b.iter(|| black_box(query).to_count_query());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build, bench_render);
criterion_main!(benches);
