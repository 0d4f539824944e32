//! Marshaling and field-arithmetic helpers shared across the crate.

use ark_ff::PrimeField;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use blake2::{Blake2b512, Digest};
use rand::RngCore;

use crate::error::ProtocolError;

/// Serializes an arkworks value into compressed bytes.
pub fn to_bytes<T: CanonicalSerialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut bytes = Vec::new();
    value
        .serialize_compressed(&mut bytes)
        .map_err(ProtocolError::serialization)?;
    Ok(bytes)
}

/// Deserializes an arkworks value from compressed bytes.
pub fn from_bytes<T: CanonicalDeserialize>(bytes: &[u8]) -> Result<T, ProtocolError> {
    T::deserialize_compressed(bytes).map_err(ProtocolError::serialization)
}

/// Hashes a domain tag and a sequence of length-prefixed parts to a scalar.
///
/// Used for Schnorr challenges, Fiat-Shamir challenges in the re-keying
/// proofs, and deterministic blinding derivation. The length prefix keeps
/// concatenated parts unambiguous.
pub fn hash_to_scalar<F: PrimeField>(domain: &[u8], parts: &[&[u8]]) -> F {
    let mut hasher = Blake2b512::new();
    hasher.update((domain.len() as u64).to_le_bytes());
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    F::from_le_bytes_mod_order(&hasher.finalize())
}

/// Lagrange weight for interpolation at zero over the points `1..=n`.
///
/// `index` is the 1-based evaluation point of the share being weighted.
/// With shares from every participant, summing `weight * share` across the
/// roster reconstructs the polynomial's constant term.
pub fn lagrange_weight_at_zero<F: PrimeField>(n: usize, index: usize) -> F {
    debug_assert!(index >= 1 && index <= n);
    let xi = F::from(index as u64);
    let mut numerator = F::one();
    let mut denominator = F::one();
    for m in 1..=n {
        if m == index {
            continue;
        }
        let xm = F::from(m as u64);
        numerator *= xm;
        denominator *= xm - xi;
    }
    // Distinct evaluation points make the denominator non-zero.
    numerator
        * denominator
            .inverse()
            .expect("denominator is a product of non-zero differences")
}

/// Fills a fresh 32-byte identifier from the process RNG.
pub fn random_id() -> [u8; 32] {
    let mut rng = rand::rng();
    let mut id = [0u8; 32];
    rng.fill_bytes(&mut id);
    id
}

/// Fills a fresh 16-byte nonce from the process RNG.
pub fn random_nonce() -> [u8; 16] {
    let mut rng = rand::rng();
    let mut nonce = [0u8; 16];
    rng.fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_bls12_381::Fr;
    use ark_poly::{univariate::DensePolynomial, DenseUVPolynomial, Polynomial};
    use ark_std::UniformRand;

    #[test]
    fn lagrange_weights_reconstruct_constant_term() {
        let mut rng = ark_std::test_rng();
        let n = 5;
        let poly = DensePolynomial::<Fr>::rand(2, &mut rng);

        let mut acc = Fr::from(0u64);
        for j in 1..=n {
            let share = poly.evaluate(&Fr::from(j as u64));
            acc += lagrange_weight_at_zero::<Fr>(n, j) * share;
        }
        assert_eq!(acc, poly.coeffs()[0]);
    }

    #[test]
    fn hash_to_scalar_separates_domains() {
        let a: Fr = hash_to_scalar(b"domain-a", &[b"payload"]);
        let b: Fr = hash_to_scalar(b"domain-b", &[b"payload"]);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_to_scalar_length_prefix_disambiguates() {
        let a: Fr = hash_to_scalar(b"t", &[b"ab", b"c"]);
        let b: Fr = hash_to_scalar(b"t", &[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn scalar_bytes_round_trip() {
        let mut rng = ark_std::test_rng();
        let x = Fr::rand(&mut rng);
        let restored: Fr = from_bytes(&to_bytes(&x).unwrap()).unwrap();
        assert_eq!(x, restored);
    }
}
