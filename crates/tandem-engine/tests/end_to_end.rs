use tandem_dsp::analysis;
use tandem_engine::modules::ModuleSettings;
use tandem_engine::{Command, Ident, ModuleHost, PatchPlan, Value};

const SAMPLE_RATE: f32 = 48_000.0;
const BLOCK: usize = 256;

fn id(text: &str) -> Ident {
    Ident::new(text).expect("ident")
}

fn host() -> ModuleHost {
    let settings = ModuleSettings {
        sample_rate: SAMPLE_RATE,
        block_len: BLOCK,
        ..ModuleSettings::default()
    };
    ModuleHost::new(&PatchPlan::classic(440.0), settings, 64).expect("host")
}

fn blocks_for_ms(ms: f32) -> usize {
    (ms / 1000.0 * SAMPLE_RATE / BLOCK as f32).ceil() as usize
}

struct Rendered {
    rms: Vec<f32>,
    max_step: f32,
}

fn render(host: &mut ModuleHost, blocks: usize, last: &mut Option<f32>, into: &mut Rendered) {
    for _ in 0..blocks {
        let block = host.process_chain().as_slice();
        assert_eq!(block.len(), BLOCK);
        assert!(analysis::all_finite(block));
        into.rms.push(analysis::rms(block));
        into.max_step = into.max_step.max(analysis::max_step(block, *last));
        *last = block.last().copied();
    }
}

#[test]
fn gated_note_rises_then_decays_without_clicks() {
    let mut host = host();
    let mut out = Rendered {
        rms: Vec::new(),
        max_step: 0.0,
    };
    let mut last = None;

    render(&mut host, 4, &mut last, &mut out);
    assert!(out.rms.iter().all(|rms| *rms == 0.0));

    host.queue_command(Command::set_gate(id("env"), true))
        .expect("queue");
    let gate_on = out.rms.len();
    render(&mut host, blocks_for_ms(250.0), &mut last, &mut out);

    // Parameter moves mid-note glide instead of stepping.
    host.queue_command(Command::set_param(id("osc"), id("gain"), Value::Float(0.9)))
        .expect("queue");
    host.queue_command(Command::set_param(id("flt"), id("cutoff"), Value::Float(8_000.0)))
        .expect("queue");
    render(&mut host, blocks_for_ms(250.0), &mut last, &mut out);

    host.queue_command(Command::set_gate(id("env"), false))
        .expect("queue");
    let gate_off = out.rms.len();
    render(&mut host, blocks_for_ms(400.0), &mut last, &mut out);

    let held = &out.rms[gate_on..gate_off];
    let peak_rms = held.iter().copied().fold(0.0f32, f32::max);
    assert!(peak_rms > 0.1, "note never sounded: {peak_rms}");
    assert!(held[0] < peak_rms);

    let tail = *out.rms.last().expect("blocks");
    assert!(tail < 1.0e-3, "release did not finish: {tail}");
    assert!(out.rms[gate_off + 2] < out.rms[gate_off - 1]);

    // A 440 Hz sine at 0.9 moves at most ~0.052 per sample.
    assert!(out.max_step < 0.08, "discontinuity of {}", out.max_step);
}

#[test]
fn frequency_change_lands_on_a_block_boundary() {
    let mut host = host();
    host.gate_all(true);
    host.process_chain();
    host.queue_command(Command::set_param(id("osc"), id("freq"), Value::Float(880.0)))
        .expect("queue");
    assert_eq!(host.pending(), 1);
    let osc = host.module(id("osc")).expect("osc");
    assert!(osc.params().contains(&("freq", 440.0)));

    host.process_chain();
    assert_eq!(host.pending(), 0);
    assert_eq!(host.stats().applied, 1);
}
