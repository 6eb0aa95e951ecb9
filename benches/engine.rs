use bytes::Bytes;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use minikv::KeyValueStore;
use minikv::resp::{self, RespParser};

fn bench_strings(c: &mut Criterion) {
    let store = KeyValueStore::with_seed(1);
    let key = Bytes::from_static(b"bench-key");
    let value = Bytes::from_static(b"bench-value-0123456789");
    store.set(key.clone(), value.clone(), None);

    c.bench_function("store_set", |b| {
        b.iter(|| store.set(black_box(key.clone()), black_box(value.clone()), None))
    });
    c.bench_function("store_get", |b| {
        b.iter(|| black_box(store.get(b"bench-key")))
    });
}

fn bench_zadd_across_threshold(c: &mut Criterion) {
    c.bench_function("zadd_200_members", |b| {
        b.iter(|| {
            let store = KeyValueStore::with_seed(7);
            for i in 0..200 {
                store.zadd(
                    Bytes::from_static(b"z"),
                    i as f64,
                    Bytes::from(format!("member-{i:04}")),
                );
            }
            black_box(store.zrange(b"z", 0, -1).len())
        })
    });
}

fn bench_resp_parse(c: &mut Criterion) {
    let frame = resp::array_of_bulks(["SET", "some-key", "some-value-of-reasonable-length"]);
    c.bench_function("resp_parse_one", |b| {
        b.iter(|| {
            let mut parser = RespParser::new();
            parser.append(black_box(&frame));
            black_box(parser.try_parse_one_with_raw())
        })
    });
}

criterion_group!(
    benches,
    bench_strings,
    bench_zadd_across_threshold,
    bench_resp_parse
);
criterion_main!(benches);
