use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use threshold_circuit::session::{verify_subshare, Dealer};

type G = ark_bls12_381::G1Projective;

fn bench_dealing(c: &mut Criterion) {
    let mut rng = ark_std::test_rng();
    let mut group = c.benchmark_group("deal");

    for size in 2..=6 {
        let n = 1 << size;
        let threshold = n / 2 + 1;

        group.bench_with_input(BenchmarkId::from_parameter(n), &threshold, |b, &t| {
            b.iter(|| {
                let dealer = Dealer::<G>::new(t, &mut rng).unwrap();
                for index in 1..=n {
                    dealer.subshare(index).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_verify_subshare(c: &mut Criterion) {
    let mut rng = ark_std::test_rng();
    let mut group = c.benchmark_group("verify_subshare");

    for size in 2..=6 {
        let n = 1 << size;
        let threshold = n / 2 + 1;

        let dealer = Dealer::<G>::new(threshold, &mut rng).unwrap();
        let subshare = dealer.subshare(1).unwrap();
        let commitments = dealer.commitments().to_vec();

        group.bench_with_input(
            BenchmarkId::from_parameter(n),
            &(subshare, commitments),
            |b, inp| {
                b.iter(|| verify_subshare(1, &inp.0, &inp.1));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_dealing, bench_verify_subshare);
criterion_main!(benches);
