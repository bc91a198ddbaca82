use criterion::{criterion_group, criterion_main, Criterion};
use kaisen_cache::{control_key, JsonCodec, KeyNamespacer, NamespaceToken, ValueCodec};
use serde::{Deserialize, Serialize};
use std::hint::black_box;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Profile {
    id: u64,
    name: String,
    tags: Vec<String>,
}

fn bench_resolve(c: &mut Criterion) {
    let raw = KeyNamespacer::new("UserProfile", false).expect("build namespacer");
    let sanitized = KeyNamespacer::new("UserProfile", true).expect("build namespacer");
    let token = NamespaceToken::new("tenant-42", Uuid::now_v7());

    c.bench_function("key/resolve_plain", |b| {
        b.iter(|| black_box(raw.resolve(black_box("profile:1234567"), None)))
    });

    c.bench_function("key/resolve_namespaced", |b| {
        b.iter(|| black_box(raw.resolve(black_box("profile:1234567"), Some(&token))))
    });

    c.bench_function("key/resolve_sanitized", |b| {
        b.iter(|| black_box(sanitized.resolve(black_box("display name/ünïcode 42"), Some(&token))))
    });

    c.bench_function("key/control_key", |b| {
        b.iter(|| black_box(control_key(black_box("tenant-42"))))
    });
}

fn bench_codec(c: &mut Criterion) {
    let codec = JsonCodec::<Profile>::new();
    let profile = Profile {
        id: 42,
        name: "ada lovelace".to_string(),
        tags: (0..16).map(|i| format!("tag-{}", i)).collect(),
    };
    let encoded = codec.encode(&profile).expect("encode profile");

    c.bench_function("codec/json_encode", |b| {
        b.iter(|| black_box(codec.encode(black_box(&profile))))
    });

    c.bench_function("codec/json_decode", |b| {
        b.iter(|| black_box(codec.decode(black_box(&encoded))))
    });
}

criterion_group!(benches, bench_resolve, bench_codec);
criterion_main!(benches);
