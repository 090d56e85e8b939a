//! Certificate Issuance Benchmarks
//!
//! Leaf issuance cost with and without the cache, and decision template
//! evaluation, which both sit on the path of every intercepted connection.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use piperelay::tls::{ConnectionFacts, DecisionTemplate, HostIdentifier};
use piperelay::CertificateAuthority;

/// Benchmark leaf certificate issuance
fn bench_issuance(c: &mut Criterion) {
    let mut group = c.benchmark_group("cert_issuance");
    let rt = tokio::runtime::Runtime::new().unwrap();

    // Cache disabled: every call signs a new leaf
    let uncached = CertificateAuthority::generate(0).unwrap();
    let host = HostIdentifier::Domain("bench.example.test".to_string());
    group.bench_function("issue_uncached", |b| {
        b.to_async(&rt)
            .iter(|| async { uncached.issue(black_box(&host)).await.unwrap() })
    });

    // Warm cache: lookups only
    let cached = CertificateAuthority::generate(1000).unwrap();
    rt.block_on(async { cached.issue(&host).await.unwrap() });
    group.bench_function("issue_cached", |b| {
        b.to_async(&rt)
            .iter(|| async { cached.issue(black_box(&host)).await.unwrap() })
    });

    group.finish();
}

/// Benchmark decrypt decision rendering
fn bench_decision(c: &mut Criterion) {
    let mut group = c.benchmark_group("decision");
    let facts = ConnectionFacts {
        servername: "api.example.test".to_string(),
        local_addr: "127.0.0.1:8443".parse().unwrap(),
        remote_addr: "127.0.0.1:50000".parse().unwrap(),
        addr: ":8443".to_string(),
        port: 8443,
    };

    let constant = DecisionTemplate::parse("true").unwrap();
    group.bench_function("constant", |b| {
        b.iter(|| constant.evaluate(black_box(&facts)).unwrap())
    });

    let by_name =
        DecisionTemplate::parse(r#"{{ servername is endingwith(".example.test") }}"#).unwrap();
    group.bench_function("servername_suffix", |b| {
        b.iter(|| by_name.evaluate(black_box(&facts)).unwrap())
    });

    group.finish();
}

criterion_group!(benches, bench_issuance, bench_decision);
criterion_main!(benches);
