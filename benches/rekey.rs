use ark_ec::PrimeGroup;
use ark_std::UniformRand;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use threshold_circuit::keyswitch::{decrypt, encrypt, Dleq};
use threshold_circuit::topology::Keypair;

type G = ark_bls12_381::G1Projective;
type Fr = <G as PrimeGroup>::ScalarField;

fn bench_elgamal(c: &mut Criterion) {
    let mut rng = ark_std::test_rng();
    let keypair = Keypair::<G>::generate(&mut rng);

    let mut group = c.benchmark_group("elgamal");
    for batch in [1usize, 8, 64] {
        let plaintexts: Vec<G> = (0..batch).map(|_| G::rand(&mut rng)).collect();
        let ciphertexts: Vec<_> = plaintexts
            .iter()
            .map(|plaintext| encrypt(*plaintext, &keypair.public(), &mut rng))
            .collect();

        group.bench_with_input(
            BenchmarkId::new("decrypt", batch),
            &ciphertexts,
            |b, cts| {
                b.iter(|| {
                    for ct in cts {
                        decrypt(ct, keypair.secret());
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_dleq(c: &mut Criterion) {
    let mut rng = ark_std::test_rng();
    let witness = Fr::rand(&mut rng);
    let g1 = G::generator();
    let g2 = G::rand(&mut rng);
    let h1 = g1 * witness;
    let h2 = g2 * witness;

    c.bench_function("dleq_prove", |b| {
        b.iter(|| Dleq::<G>::prove(&witness, &g1, &h1, &g2, &h2).unwrap());
    });

    let proof = Dleq::<G>::prove(&witness, &g1, &h1, &g2, &h2).unwrap();
    c.bench_function("dleq_verify", |b| {
        b.iter(|| proof.verify(&g1, &h1, &g2, &h2));
    });
}

criterion_group!(benches, bench_elgamal, bench_dleq);
criterion_main!(benches);
