use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use statecast_transport::alphabet::Alphabet;
use statecast_transport::codec::{InputStream, OutputStream};
use statecast_transport::StreamFormat;

const SYMBOLS_PER_PACKET: usize = 256;

fn symbol_stream() -> Vec<usize> {
    // Skewed the way live traffic is: mostly position updates.
    (0..SYMBOLS_PER_PACKET)
        .map(|i| match i % 19 {
            0 => 3,
            7 => 5,
            _ => 1,
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let symbols = symbol_stream();
    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(SYMBOLS_PER_PACKET as u64));
    for format in [StreamFormat::Arithmetic, StreamFormat::BitPacked] {
        group.bench_function(format!("{format:?}"), |bch| {
            bch.iter_batched(
                || Alphabet::new(8),
                |mut alpha| {
                    let mut out = OutputStream::new(format);
                    for &s in &symbols {
                        alpha.write_symbol(&mut out, s);
                        out.write_bits(s as u32, 12);
                    }
                    out.finish()
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let symbols = symbol_stream();
    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(SYMBOLS_PER_PACKET as u64));
    for format in [StreamFormat::Arithmetic, StreamFormat::BitPacked] {
        let mut alpha = Alphabet::new(8);
        let mut out = OutputStream::new(format);
        for &s in &symbols {
            alpha.write_symbol(&mut out, s);
            out.write_bits(s as u32, 12);
        }
        let buf = out.finish();

        group.bench_function(format!("{format:?}"), |bch| {
            bch.iter_batched(
                || Alphabet::new(8),
                |mut alpha| {
                    let mut inp = InputStream::new(format, &buf);
                    for _ in 0..SYMBOLS_PER_PACKET {
                        let s = alpha.read_symbol(&mut inp);
                        assert_eq!(inp.read_bits(12), s as u32);
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
