/*
Measures the per-block cost of the visualization downsampler and the
counter-derived timestamp formatting, the two operations on the ingest
hot path that run for every block regardless of sink configuration.
*/

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use chrono::NaiveDate;
use pet_daq::pipeline::timebase;
use pet_daq::pipeline::viz::downsample;

fn bench_downsample(c: &mut Criterion) {
    // One second of 4-channel data at 20 kHz.
    let block: Vec<f32> = (0..80_000).map(|i| (i % 997) as f32).collect();
    c.bench_function("downsample_4ch_stride25", |b| {
        b.iter(|| downsample(black_box(&block), 4, 25))
    });
}

fn bench_timestamp_format(c: &mut Criterion) {
    let start = NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap();
    let mut row = 0u64;
    c.bench_function("csv_timestamp", |b| {
        b.iter(|| {
            row += 1;
            timebase::csv_timestamp(black_box(start), black_box(row), 20_000)
        })
    });
}

criterion_group!(benches, bench_downsample, bench_timestamp_format);
criterion_main!(benches);
