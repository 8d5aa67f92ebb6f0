use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::prelude::*;

use termxfer::crc::{crc16, crc32, CrcWidth};
use termxfer::subpacket::{self, FrameKind};
use termxfer::EscapeTable;

fn generate_random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

const INPUTS: [(&str, usize); 3] = [("small", 1024), ("medium", 32 * 1024), ("large", 1024 * 1024)];

/// 이스케이프 / 언이스케이프 처리량
fn bench_escape(c: &mut Criterion) {
    let mut group = c.benchmark_group("escape");
    for (name, size) in INPUTS.iter() {
        let data = generate_random_data(*size);
        group.throughput(Throughput::Bytes(*size as u64));

        for (table_name, table) in [("zdle", EscapeTable::zdle()), ("extended", EscapeTable::extended())] {
            let escaped = table.escape(&data);
            group.bench_function(format!("escape:{}:{}", table_name, name), |b| {
                b.iter(|| table.escape(black_box(&data)))
            });
            group.bench_function(format!("unescape:{}:{}", table_name, name), |b| {
                b.iter(|| table.unescape(black_box(&escaped)))
            });
        }
    }
    group.finish();
}

fn bench_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc");
    for (name, size) in INPUTS.iter() {
        let data = generate_random_data(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_function(format!("crc16:{}", name), |b| b.iter(|| crc16(black_box(&data))));
        group.bench_function(format!("crc32:{}", name), |b| b.iter(|| crc32(black_box(&data))));
    }
    group.finish();
}

/// 서브패킷 생성 + 파싱
fn bench_subpacket(c: &mut Criterion) {
    let table = EscapeTable::zdle();
    let mut group = c.benchmark_group("subpacket");
    for (name, size) in INPUTS.iter() {
        let data = generate_random_data(*size);
        let wire = subpacket::encode(&data, FrameKind::ContinueNoAck, CrcWidth::Crc32, &table);
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_function(format!("encode:{}", name), |b| {
            b.iter(|| subpacket::encode(black_box(&data), FrameKind::ContinueNoAck, CrcWidth::Crc32, &table))
        });
        group.bench_function(format!("parse:{}", name), |b| {
            b.iter(|| {
                subpacket::parse(black_box(&wire), CrcWidth::Crc32)
                    .expect("parse returned an error")
                    .expect("subpacket incomplete")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_escape, bench_crc, bench_subpacket);
criterion_main!(benches);
