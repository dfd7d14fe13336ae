use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use wavec::pass::PassId;
use wavec::pipeline::compile_source;

// ── Sample Waveling programs ────────────────────────────────────────────────

const SIMPLE_MIX: &str = r#"
program simple_mix;
external {
  sr: 48000,
  block_size: 128,
  inputs: [ { name: a, width: 1 }, { name: b, width: 1 } ],
  outputs: [ { name: o, width: 1 } ],
  properties: []
}
stage main() {
  a + b -> o;
}
"#;

const FEEDBACK_ECHO: &str = r#"
program feedback_echo;
external {
  sr: 48000,
  block_size: 128,
  inputs: [ { name: dry, width: 1 } ],
  outputs: [ { name: wet, width: 1 } ],
  properties: [ { name: feedback, type: f32, rate: b } ]
}
stage main() {
  buffer line(9600): f32(1);
  cell (fb, fb_next): f32(1);
  delwrite(line, dry + (fb * 0.5f32));
  let tap = delread(line, 4800);
  fb_next <- tap;
  tap -> wet;
}
"#;

/// Generate a program with `n_stages` chained stages, each applying a small
/// arithmetic chain to the previous stage's output.
fn generate_chained_stages(n_stages: usize, ops_per_stage: usize) -> String {
    let mut source = String::new();
    source.push_str(
        "program chain;\nexternal { sr: 48000, block_size: 64, \
         inputs: [ { name: x, width: 1 } ], \
         outputs: [ { name: y, width: 1 } ], properties: [] }\n",
    );

    for s in 0..n_stages {
        source.push_str(&format!("stage s{s}(v = f32(1)) {{\n"));
        let input = if s == 0 {
            "x".to_string()
        } else {
            format!("s{}.outputs.v", s - 1)
        };
        source.push_str(&format!("  let t0 = {input} * 0.5f32;\n"));
        for op in 1..ops_per_stage {
            source.push_str(&format!("  let t{op} = t{} + {op}.0f32;\n", op - 1));
        }
        source.push_str(&format!("  v = t{};\n}}\n", ops_per_stage - 1));
    }

    source.push_str(&format!(
        "stage sink() {{ s{}.outputs.v -> y; }}\n",
        n_stages - 1
    ));
    source
}

// ── Benchmarks ──────────────────────────────────────────────────────────────

fn bench_fixed_programs(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_fixed");
    for (name, source) in [("simple_mix", SIMPLE_MIX), ("feedback_echo", FEEDBACK_ECHO)] {
        group.bench_function(name, |bencher| {
            bencher.iter(|| {
                let state =
                    compile_source(black_box(source), PassId::Emit).expect("parses");
                assert!(!state.has_error);
                black_box(state.ir)
            });
        });
    }
    group.finish();
}

fn bench_chained_stages(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_chained_stages");
    for n_stages in [4usize, 16, 64] {
        let source = generate_chained_stages(n_stages, 8);
        group.bench_with_input(
            BenchmarkId::from_parameter(n_stages),
            &source,
            |bencher, source| {
                bencher.iter(|| {
                    let state =
                        compile_source(black_box(source), PassId::Emit).expect("parses");
                    assert!(!state.has_error);
                    black_box(state.ir)
                });
            },
        );
    }
    group.finish();
}

fn bench_parse_only(c: &mut Criterion) {
    let source = generate_chained_stages(32, 8);
    c.bench_function("parse_only_32_stages", |bencher| {
        bencher.iter(|| black_box(wavec::parser::parse(black_box(&source))));
    });
}

criterion_group!(
    benches,
    bench_fixed_programs,
    bench_chained_stages,
    bench_parse_only
);
criterion_main!(benches);
