use beacon_telemetry::{CallSite, Deduplicator, LogEntry, LogLayer, LogLevel};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

fn entry(message: &str) -> LogEntry {
    LogEntry::new(
        LogLevel::Info,
        LogLayer::Service,
        message,
        CallSite {
            file: "src/api.rs".to_string(),
            line: 1,
            function: "api::call".to_string(),
        },
        "0123456789abcdef0123456789abcdef",
        None,
        None,
        None,
    )
    .unwrap()
}

fn bench_should_log(c: &mut Criterion) {
    c.bench_function("should_log repeated key", |b| {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        let event = entry("hot event");
        b.iter(|| black_box(dedup.should_log(&event)));
    });

    c.bench_function("should_log distinct keys", |b| {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let event = entry(&format!("event {i}"));
            black_box(dedup.should_log(&event))
        });
    });
}

criterion_group!(benches, bench_should_log);
criterion_main!(benches);
