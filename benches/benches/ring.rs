use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tandem_engine::{AudioBuffer, Command, Ident, Overflow, SharedRing, Value};

fn audio_ring(c: &mut Criterion) {
    let ring = SharedRing::<AudioBuffer>::create(16, Overflow::DropOldest).expect("ring");
    let block = AudioBuffer::silent(256);
    c.bench_function("ring_publish_consume_audio", |b| {
        b.iter(|| {
            ring.publish(&block);
            ring.consume_latest_with_cushion(2)
        });
    });
}

fn command_ring(c: &mut Criterion) {
    let ring = SharedRing::<Command>::create(256, Overflow::Reject).expect("ring");
    let command = Command::set_param(
        Ident::new("osc").expect("ident"),
        Ident::new("freq").expect("ident"),
        Value::Float(440.0),
    );
    c.bench_function("ring_drain_64_commands", |b| {
        b.iter_batched(
            || {
                for _ in 0..64 {
                    ring.publish(&command);
                }
            },
            |()| {
                while let Some(command) = ring.consume_latest_with_cushion(0) {
                    let _ = command.decode();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, audio_ring, command_ring);
criterion_main!(benches);
