//! Reservation throughput and latency harness. Run with:
//!   cargo bench --bench stress

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use slotd::engine::{Engine, EngineConfig};
use slotd::notify::NotifyHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn bench_engine(name: &str) -> Arc<Engine> {
    let dir = std::env::temp_dir().join("slotd_bench");
    std::fs::create_dir_all(&dir).unwrap();
    let wal = dir.join(format!("{name}_{}.wal", Ulid::new()));
    let notify = Arc::new(NotifyHub::new());
    Arc::new(Engine::new(wal, EngineConfig::default(), notify).unwrap())
}

fn base_date() -> NaiveDate {
    "2099-01-01".parse().unwrap()
}

async fn register(engine: &Engine, n: usize) -> Vec<Ulid> {
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = Ulid::new();
        engine
            .register_resource(id, format!("court-{i}"), 0, 1000, "INR".into())
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

/// One writer filling consecutive days of a single resource.
async fn phase1_sequential() {
    println!("phase 1: sequential reservations");
    let engine = bench_engine("seq");
    let rid = register(&engine, 1).await[0];

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let date = base_date() + Days::new((i / 24) as u64);
        let slot = (i % 24) as u8;
        let t = Instant::now();
        engine
            .reserve(rid, date, &[slot], "bench-user")
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

/// Many writers on disjoint resources.
async fn phase2_concurrent() {
    println!("phase 2: concurrent reservations, disjoint resources");
    let engine = bench_engine("conc");
    let resources = register(&engine, 10).await;

    let n_tasks = 10;
    let n_per_task = 200;
    let start = Instant::now();
    let mut handles = Vec::new();

    for (i, rid) in resources.into_iter().enumerate() {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_task {
                let date = base_date() + Days::new((j / 24) as u64);
                let slot = (j % 24) as u8;
                engine
                    .reserve(rid, date, &[slot], &format!("user-{i}"))
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} reservations = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// All writers hammer the same day of the same resource; measures conflict
/// handling under a pathological hot spot.
async fn phase3_contended() {
    println!("phase 3: contended single day");
    let engine = bench_engine("hot");
    let rid = register(&engine, 1).await[0];
    let date = base_date();

    let n_tasks = 50;
    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let slot = (i % 24) as u8;
            engine
                .reserve(rid, date, &[slot], &format!("user-{i}"))
                .await
                .is_ok()
        }));
    }

    let mut wins = 0;
    for h in handles {
        if h.await.unwrap() {
            wins += 1;
        }
    }
    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} attempts on 24 slots: {wins} won, {} conflicted, in {:.2}ms",
        n_tasks - wins,
        elapsed.as_secs_f64() * 1000.0
    );
    assert_eq!(wins, 24);
}

/// Availability reads while writers churn holds on other days.
async fn phase4_read_under_load() {
    println!("phase 4: availability reads under write load");
    let engine = bench_engine("read");
    let rid = register(&engine, 1).await[0];
    for slot in 0..12u8 {
        engine
            .reserve(rid, base_date(), &[slot], "warm-user")
            .await
            .unwrap();
    }

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..5 {
        let engine = engine.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let mut day = 1u64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let date = base_date() + Days::new(day * 5 + w);
                let _ = engine.reserve(rid, date, &[12], &format!("writer-{w}")).await;
                day += 1;
            }
        }));
    }

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    for _ in 0..n {
        let t = Instant::now();
        let grid = engine.availability(rid, base_date()).await.unwrap();
        assert_eq!(grid.len(), 24);
        latencies.push(t.elapsed());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for w in writers {
        w.await.unwrap();
    }
    print_latency("availability latency", &mut latencies);
}

#[tokio::main]
async fn main() {
    println!("slotd stress harness");
    phase1_sequential().await;
    phase2_concurrent().await;
    phase3_contended().await;
    phase4_read_under_load().await;
}
