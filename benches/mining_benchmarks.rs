//! Performance benchmarks for the per-attempt hot path

use criterion::{criterion_group, criterion_main, Criterion};
use merit_miner::crypto::{cycle_hash, merkle_root};
use merit_miner::stratum::message::parse_notify;
use merit_miner::types::{Cycle, Target, PROOF_SIZE};
use merit_miner::work::work_from_job;
use serde_json::json;
use std::hint::black_box;

fn sample_job() -> merit_miner::Job {
    let params = vec![
        json!("bench"),
        json!("11".repeat(32)),
        json!("0100000001000000000000000000000000"),
        json!("ffffffff0100f2052a01000000434104"),
        json!(["22".repeat(32), "33".repeat(32), "44".repeat(32)]),
        json!("01000020"),
        json!("ffff001d"),
        json!(26),
        json!("5a1b2c3d"),
        json!(true),
    ];
    parse_notify(&params, &[0xaa, 0xbb, 0xcc, 0xdd], 4, 1.0).unwrap()
}

fn bench_work_assembly(c: &mut Criterion) {
    let job = sample_job();

    c.bench_function("work_from_job", |b| {
        b.iter(|| black_box(work_from_job(black_box(&job)).unwrap()));
    });

    c.bench_function("merkle_root", |b| {
        b.iter(|| black_box(merkle_root(black_box(&job.coinbase), black_box(&job.merkle))));
    });
}

fn bench_attempt(c: &mut Criterion) {
    let mut work = work_from_job(&sample_job()).unwrap();
    let cycle = Cycle::new((0..PROOF_SIZE as u32).map(|i| i * 7919).collect());
    let target = Target::from_difficulty(1024.0).unwrap();

    c.bench_function("header_hash_hex", |b| {
        let mut nonce = 0u32;
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            work.set_nonce(nonce);
            black_box(work.header_hash_hex())
        });
    });

    c.bench_function("cycle_hash_meets_target", |b| {
        b.iter(|| black_box(target.is_met_by(&cycle_hash(black_box(&cycle)))));
    });
}

criterion_group!(benches, bench_work_assembly, bench_attempt);
criterion_main!(benches);
