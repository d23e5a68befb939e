//! # Knowledge-Graph Kernel Benchmarks
//!
//! Synchronous paths taken on every event or overlay execution:
//!
//! | Path | Taken |
//! |------|-------|
//! | Subscription matching | once per (event, subscription) |
//! | Circuit breaker admission | once per overlay execution |
//! | Capability narrowing | once per overlay execution |
//! | Fuel settlement | once per sandbox call |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kg_02_overlay_manager::{CircuitBreakerConfig, CircuitBreakers};
use kg_03_sandbox_runtime::{FuelMeter, SandboxConfig};
use shared_bus::{
    handler_fn, Event, EventPredicate, EventPriority, EventType, HandlerError, Subscription,
};
use shared_types::{Capability, CapabilitySet, FuelBudget, Payload};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// EVENT BUS
// ============================================================================

fn bench_subscription_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared-bus-matching");

    let handler = handler_fn(|_event: Arc<Event>| async { Ok::<(), HandlerError>(()) });
    let predicate: EventPredicate = Arc::new(|event: &Event| event.source.starts_with("overlay:"));
    let plain = Subscription::new(
        Arc::clone(&handler),
        [EventType::CapsuleCreated, EventType::CapsuleUpdated],
        EventPriority::Low,
        None,
    )
    .unwrap();
    let filtered = Subscription::new(
        handler,
        EventType::ALL,
        EventPriority::Normal,
        Some(predicate),
    )
    .unwrap();

    let events: Vec<Event> = EventType::ALL
        .iter()
        .map(|ty| Event::new(*ty, "overlay:bench", Payload::new()))
        .collect();
    group.throughput(Throughput::Elements(events.len() as u64));

    group.bench_function("type_and_priority", |b| {
        b.iter(|| events.iter().filter(|e| plain.matches(black_box(e))).count())
    });
    group.bench_function("with_predicate", |b| {
        b.iter(|| events.iter().filter(|e| filtered.matches(black_box(e))).count())
    });

    group.finish();
}

// ============================================================================
// OVERLAY MANAGER
// ============================================================================

fn bench_circuit_admission(c: &mut Criterion) {
    let mut group = c.benchmark_group("kg-02-circuit-breaker");

    for instances in [10usize, 100, 1000] {
        let breakers = CircuitBreakers::new(CircuitBreakerConfig::default());
        let ids: Vec<String> = (0..instances).map(|i| format!("overlay-{i}")).collect();
        for id in &ids {
            breakers.record_success(id);
        }

        group.throughput(Throughput::Elements(instances as u64));
        group.bench_with_input(BenchmarkId::new("check_then_success", instances), &ids, |b, ids| {
            b.iter(|| {
                for id in ids {
                    black_box(breakers.check(id));
                    breakers.record_success(id);
                }
            })
        });
    }

    let granted = CapabilitySet::all();
    let required = CapabilitySet::from([
        Capability::DatabaseRead,
        Capability::EventPublish,
        Capability::CapsuleRead,
    ]);
    group.bench_function("capability_narrowing", |b| {
        b.iter(|| black_box(granted.intersection(&required)).missing_from(&required))
    });

    group.finish();
}

// ============================================================================
// SANDBOX RUNTIME
// ============================================================================

fn bench_fuel_settlement(c: &mut Criterion) {
    let mut group = c.benchmark_group("kg-03-fuel");
    let meter = FuelMeter::from_config(&SandboxConfig::default());

    group.bench_function("consume_until_exhausted", |b| {
        b.iter(|| {
            let mut budget = FuelBudget::new(1_000_000, Duration::from_secs(30));
            let mut calls = 0u32;
            while let Ok(allowance) = meter.allowance(&budget, 10_000) {
                let used = meter.consumption(Duration::from_millis(5), 3);
                if meter.settle(&mut budget, allowance, used).is_err() {
                    break;
                }
                calls += 1;
            }
            black_box(calls)
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_subscription_matching,
    bench_circuit_admission,
    bench_fuel_settlement
);
criterion_main!(benches);
