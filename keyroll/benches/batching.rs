// Throughput of one epoch of window sampling and batch building.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use keyroll::batch::BatchBuilder;
use keyroll::pianoroll::{NUM_PITCHES, PianoRoll};
use keyroll::window::{DataSet, WindowSampler, WindowSamplerConfig};
use keyroll_prng::SeededRng;

fn corpus(songs: usize, width: usize) -> Vec<PianoRoll> {
    let mut rng = SeededRng::new(0);
    (0..songs)
        .map(|_| {
            let mut roll = PianoRoll::zeros(width);
            for t in 0..width {
                for _ in 0..3 {
                    roll.set(rng.range_usize(0, NUM_PITCHES), t, 1);
                }
            }
            roll
        })
        .collect()
}

fn bench_epoch(c: &mut Criterion) {
    let rolls = corpus(50, 400);
    let sampler = WindowSampler::new(WindowSamplerConfig {
        sample_length: 40,
        train_ratio: 0.9,
    })
    .unwrap();
    let builder = BatchBuilder::new(64, 40).unwrap();

    c.bench_function("sample_windows", |b| {
        let mut rng = SeededRng::new(1);
        b.iter(|| black_box(sampler.sample(&rolls, DataSet::Train, &mut rng).unwrap().len()))
    });

    c.bench_function("build_batches", |b| {
        let mut rng = SeededRng::new(2);
        b.iter(|| {
            let windows = sampler.sample(&rolls, DataSet::Train, &mut rng).unwrap();
            black_box(builder.build_batches(windows, &mut rng).unwrap().len())
        })
    });
}

criterion_group!(benches, bench_epoch);
criterion_main!(benches);
