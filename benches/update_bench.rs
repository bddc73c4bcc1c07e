use criterion::{Criterion, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use osmos::ies::{
    ActiveMask, IesConfig, IesData, Inversion, sample_perturbations, update_ensemble,
};

fn smoother_step(c: &mut Criterion) {
    let state = 200;
    let obs = 60;
    let ens = 100;
    let mut rng = StdRng::seed_from_u64(1234);

    let a0 = Array2::from_shape_fn((state, ens), |_| rng.gen_range(-1.0..1.0));
    let s = Array2::from_shape_fn((obs, ens), |_| rng.gen_range(-1.0..1.0));
    let r = Array2::eye(obs);
    let e = sample_perturbations(&mut rng, &Array1::ones(obs), ens);
    let observed = Array1::from_shape_fn(obs, |_| rng.gen_range(-1.0..1.0));
    let d = Array2::from_shape_fn((obs, ens), |(i, j)| observed[i] + e[(i, j)] - s[(i, j)]);

    let mut group = c.benchmark_group("smoother_step");
    for (label, inversion) in [
        ("exact", Inversion::Exact),
        ("subspace_exact_r", Inversion::SubspaceExactR),
        ("subspace_re", Inversion::SubspaceRe),
    ] {
        group.bench_function(label, |bencher| {
            bencher.iter(|| {
                let config = IesConfig {
                    inversion,
                    ..IesConfig::default()
                };
                let mut data = IesData::new();
                data.init_update(&ActiveMask::all_active(ens), &ActiveMask::all_active(obs))
                    .unwrap();
                let mut a = a0.clone();
                update_ensemble(&config, &mut data, &mut a, &s, &r, &e, &d).unwrap();
                a
            })
        });
    }
    group.finish();
}

criterion_group!(benches, smoother_step);
criterion_main!(benches);
