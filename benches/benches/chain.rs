use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use tandem_engine::modules::ModuleSettings;
use tandem_engine::{
    AudioBuffer, AudioCallback, CallbackFence, Command, EngineMetrics, Ident, ModuleHost, Overflow,
    PatchPlan, SharedRing,
};

fn chain_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    group.measurement_time(Duration::from_secs(5));

    for block_len in [64usize, 256, 512] {
        group.bench_function(format!("classic_block{block_len}"), |b| {
            let settings = ModuleSettings {
                block_len,
                ..ModuleSettings::default()
            };
            let mut host =
                ModuleHost::new(&PatchPlan::classic(440.0), settings, 64).expect("host");
            let env = Ident::new("env").expect("ident");
            host.queue_command(Command::set_gate(env, true))
                .expect("queue");
            b.iter(|| {
                host.process_chain();
            });
        });
    }
    group.finish();
}

fn callback_render(c: &mut Criterion) {
    let rings: [Arc<SharedRing<AudioBuffer>>; 2] = [
        Arc::new(SharedRing::create(16, Overflow::DropOldest).expect("ring")),
        Arc::new(SharedRing::create(16, Overflow::DropOldest).expect("ring")),
    ];
    let fence = Arc::new(CallbackFence::new());
    fence.switch_to(0);
    let mut callback = AudioCallback::new(rings.clone(), fence, EngineMetrics::new(), 2, 256);
    let block = AudioBuffer::silent(256);
    let mut out = vec![0.0f32; 256 * 2];

    c.bench_function("callback_stereo_256", |b| {
        b.iter(|| {
            rings[0].publish(&block);
            callback.render(&mut out, 2);
        });
    });
}

criterion_group!(benches, chain_pass, callback_render);
criterion_main!(benches);
