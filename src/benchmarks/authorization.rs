//! Authorization benchmarks
//!
//! All run against the in-process static authority so only cache and
//! hierarchy-walk costs are measured.

use criterion::{BenchmarkId, Criterion, criterion_group};
use futures::future::join_all;
use std::hint::black_box;
use std::sync::Arc;
use tokio::runtime::Runtime;

use crate::auth::audit::{AuditEvent, AuditSink};
use crate::auth::authorizer::PathAuthorizer;
use crate::auth::cache::{CacheConfig, Invalidation, PermissionCache};
use crate::auth::path::NormalizedPath;
use crate::auth::types::{AccessLevel, Principal};
use crate::services::authority::StaticAuthorityClient;

/// Discards events so the benchmark measures decisions, not logging
struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: AuditEvent) {}
}

fn runtime() -> Runtime {
    match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => panic!("failed to build tokio runtime: {}", e),
    }
}

fn setup(max_entries: usize) -> (PathAuthorizer, PermissionCache) {
    let authority = Arc::new(StaticAuthorityClient::with_grants(
        (0..100).map(|i| (Principal::new(format!("user{}", i)), NormalizedPath::root(), AccessLevel::Write)),
    ));
    let config = CacheConfig {
        max_entries,
        ..CacheConfig::default()
    };
    let cache = match PermissionCache::new(config, authority) {
        Ok(cache) => cache,
        Err(e) => panic!("invalid cache config: {}", e),
    };
    (PathAuthorizer::new(cache.clone(), Arc::new(NullAuditSink)), cache)
}

pub fn bench_path_normalization(c: &mut Criterion) {
    c.bench_function("path_parse_shallow", |b| {
        b.iter(|| NormalizedPath::parse(black_box("/org/proj/file.txt")))
    });

    c.bench_function("path_parse_deep_messy", |b| {
        b.iter(|| NormalizedPath::parse(black_box("//org///proj/a/b/c/d/e/f/g/h/file.parquet/")))
    });
}

pub fn bench_fresh_hit(c: &mut Criterion) {
    let rt = runtime();
    let (authorizer, _cache) = setup(100_000);
    let alice = Principal::new("user1");
    rt.block_on(authorizer.authorize(&alice, "/org/proj/file", AccessLevel::Read)).ok();

    c.bench_function("authorize_fresh_hit", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(authorizer.authorize(&alice, "/org/proj/file", AccessLevel::Read).await).ok();
        })
    });
}

pub fn bench_hierarchy_walk(c: &mut Criterion) {
    let rt = runtime();

    for depth in [2usize, 8, 32] {
        let (authorizer, cache) = setup(100_000);
        let alice = Principal::new("user2");
        // Only the root is cached, so every request walks the full depth
        rt.block_on(cache.lookup(&alice, &NormalizedPath::root(), AccessLevel::Write)).ok();
        let path: String = (0..depth).map(|i| format!("/d{}", i)).collect();

        c.bench_with_input(BenchmarkId::new("authorize_walk_depth", depth), &path, |b, path| {
            b.to_async(&rt).iter(|| async {
                black_box(authorizer.authorize(&alice, path, AccessLevel::Read).await).ok();
            })
        });
    }
}

pub fn bench_concurrent_misses(c: &mut Criterion) {
    let rt = runtime();
    let (_authorizer, cache) = setup(100_000);
    let alice = Principal::new("user3");
    let prefix = NormalizedPath::root();

    c.bench_function("lookup_100_concurrent_misses", |b| {
        b.to_async(&rt).iter(|| async {
            cache.invalidate(Invalidation::All);
            let lookups = (0..100).map(|_| cache.lookup(&alice, &prefix, AccessLevel::Read));
            black_box(join_all(lookups).await);
        })
    });
}

pub fn bench_cache_size_impact(c: &mut Criterion) {
    let rt = runtime();

    for entries in [1_000usize, 10_000, 100_000] {
        let (_authorizer, cache) = setup(entries + 1);
        rt.block_on(async {
            for i in 0..entries {
                let principal = Principal::new(format!("user{}", i % 100));
                if let Ok(path) = NormalizedPath::parse(&format!("/fill/{}", i)) {
                    cache.lookup(&principal, &path, AccessLevel::Read).await.ok();
                }
            }
        });

        let principal = Principal::new("user7");
        let sample = NormalizedPath::parse("/fill/7").unwrap_or_else(|_| NormalizedPath::root());
        c.bench_with_input(BenchmarkId::new("peek_with_entries", entries), &entries, |b, _| {
            b.iter(|| black_box(cache.peek(&principal, &sample, &sample)))
        });
    }
}

criterion_group!(
    benches,
    bench_path_normalization,
    bench_fresh_hit,
    bench_hierarchy_walk,
    bench_concurrent_misses,
    bench_cache_size_impact
);
