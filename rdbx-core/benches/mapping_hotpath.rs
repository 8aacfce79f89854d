use chrono::{DateTime, Utc};
use criterion::{criterion_group, criterion_main, Criterion};
use rdbx_core::{decode_blob, encode_row, expand_wildcard, impl_record, Destination, Fingerprint, Value};
use std::hint::black_box;

#[derive(Debug, Default)]
struct Order {
    id: i64,
    customer: String,
    total: f64,
    paid: bool,
    placed_at: Option<DateTime<Utc>>,
}

impl_record!(Order {
    id => "id",
    customer => "customer",
    total => "total",
    paid => "paid",
    placed_at => "placed_at",
});

fn columns() -> Vec<String> {
    ["id", "customer", "total", "paid", "placed_at"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn rows(count: i64) -> Vec<Vec<Value>> {
    (0..count)
        .map(|i| {
            vec![
                Value::Int(i),
                Value::Text(format!("customer;{i}")),
                Value::Float(i as f64 * 1.5),
                Value::Bool(i % 2 == 0),
                if i % 3 == 0 { Value::Null } else { Value::Timestamp(Utc::now()) },
            ]
        })
        .collect()
}

fn bench_map_rows(c: &mut Criterion) {
    let columns = columns();
    let rows = rows(1_000);

    c.bench_function("mapper/map_1000_rows", |b| {
        b.iter(|| {
            let mut orders: Vec<Order> = Vec::with_capacity(rows.len());
            for row in rows.iter().cloned() {
                orders.map_row(&columns, row).expect("map row");
            }
            black_box(orders.len());
        });
    });
}

fn bench_encode_and_decode(c: &mut Criterion) {
    let rows = rows(1_000);

    c.bench_function("codec/encode_1000_rows", |b| {
        b.iter(|| {
            let mut blob = Vec::new();
            for row in &rows {
                encode_row(&mut blob, 5, black_box(row)).expect("encode row");
            }
            black_box(blob.len());
        });
    });

    let mut blob = Vec::new();
    for row in &rows {
        encode_row(&mut blob, 5, row).expect("encode row");
    }
    c.bench_function("codec/decode_1000_rows", |b| {
        b.iter(|| black_box(decode_blob(black_box(&blob)).expect("decode blob").len()));
    });
}

fn bench_query_key(c: &mut Criterion) {
    let sql = "SELECT * FROM orders WHERE customer = $1 AND placed_at > $2 ORDER BY id";

    c.bench_function("query/expand_and_fingerprint", |b| {
        b.iter(|| {
            let expanded = expand_wildcard(black_box(sql), Order::columns());
            black_box(Fingerprint::of(&expanded));
        });
    });
}

criterion_group!(benches, bench_map_rows, bench_encode_and_decode, bench_query_key);
criterion_main!(benches);
