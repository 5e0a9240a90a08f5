use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use chaincrf::{Context, Event, Flag, Obs, ParamTable, Sequence};

fn build_table(num_labels: usize, num_obs: usize) -> ParamTable {
    let mut table = ParamTable::new();
    let labels: Vec<u32> = (0..num_labels)
        .map(|i| table.add_label(&format!("y{i}")))
        .collect();
    for j in 0..num_obs {
        let oid = table.add_obs(&format!("w{j}"));
        for &y in &labels {
            table.bind_feature(oid, y);
        }
    }
    for i in 0..num_labels {
        let oid = table.add_obs(&format!("@y{i}"));
        for &y in &labels {
            table.bind_feature(oid, y);
        }
    }
    table.end_update();
    for (i, w) in table.weights_mut().iter_mut().enumerate() {
        *w = ((i % 17) as f64 - 8.0) * 0.05;
    }
    table.build_state_transition_index();
    table
}

fn build_sequence(len: usize, num_obs: usize) -> Sequence {
    (0..len)
        .map(|i| {
            let mut ev = Event::new(1 + (i % 2) as u32, 1.0);
            ev.obs.push(Obs::new((i % num_obs) as u32, 1.0));
            ev.obs.push(Obs::new(((i + 3) % num_obs) as u32, 0.5));
            ev
        })
        .collect()
}

fn benchmark_viterbi_by_labels(c: &mut Criterion) {
    let mut group = c.benchmark_group("viterbi_by_labels");
    let t = 10;

    for l in [2, 3, 4, 5, 6, 8, 10, 12, 16, 20] {
        group.bench_with_input(BenchmarkId::from_parameter(l), &l, |b, &l| {
            let table = build_table(l, 8);
            let seq = build_sequence(t, 8);
            let mut ctx = Context::new(Flag::VITERBI, table.num_labels(), t);
            ctx.compute_edge(&table);
            ctx.compute_factors(&seq, &table);

            b.iter(|| {
                let result = ctx.viterbi();
                black_box(result);
            });
        });
    }

    group.finish();
}

fn benchmark_forward_backward_by_length(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_backward_by_length");

    for t in [10, 50, 200] {
        group.bench_with_input(BenchmarkId::from_parameter(t), &t, |b, &t| {
            let table = build_table(5, 8);
            let seq = build_sequence(t, 8);
            let mut ctx = Context::new(Flag::ALL, table.num_labels(), t);
            ctx.compute_edge(&table);

            b.iter(|| {
                ctx.compute_factors(&seq, &table);
                ctx.forward(&table);
                ctx.backward(&table);
                ctx.compute_scale_products();
                black_box(ctx.log_z());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_viterbi_by_labels,
    benchmark_forward_backward_by_length
);
criterion_main!(benches);
