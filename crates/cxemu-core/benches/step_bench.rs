use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use cxemu_core::{Axons, Group, LifConfig, Model, Synapses};

fn build_model(n: usize, discretized: bool) -> Model {
    let mut model = Model::new();
    let mut group = Group::new(n);
    group.configure_lif(&LifConfig::default()).expect("bench group config");
    group
        .set_bias(&(0..n).map(|i| 1.0 + i as f32 / n as f32).collect::<Vec<_>>())
        .expect("bench bias");
    let g = model.add_group(group).expect("bench group");

    // recurrent one-to-one feedback keeps the synapse path busy
    let mut syn = Synapses::new(n);
    syn.set_diagonal_weights(&vec![0.1; n]).expect("bench weights");
    let bank = model.add_synapses(g, syn, None).expect("bench synapses");
    model
        .group_mut(g)
        .expect("bench group access")
        .add_axons(Axons::new(n, bank), None)
        .expect("bench axons");

    if discretized {
        model.discretize().expect("bench discretize");
    }
    model
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_kernel");
    let steps = 100;

    for &n in &[64usize, 256, 1024] {
        group.throughput(Throughput::Elements((n * steps) as u64));

        let float_model = build_model(n, false);
        group.bench_with_input(BenchmarkId::new("float", n), &n, |b, _| {
            b.iter(|| {
                let mut kernel = float_model.get_simulator(Some(1234)).unwrap();
                kernel.run_steps(steps).unwrap();
            });
        });

        let int_model = build_model(n, true);
        group.bench_with_input(BenchmarkId::new("int", n), &n, |b, _| {
            b.iter(|| {
                let mut kernel = int_model.get_simulator(Some(1234)).unwrap();
                kernel.run_steps(steps).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_step);
criterion_main!(benches);
