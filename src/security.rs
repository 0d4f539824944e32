//! Memory hygiene for private share material.

use ark_ff::PrimeField;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Wrapper for a private scalar that is wiped when dropped.
///
/// Arkworks field elements do not expose their raw representation, so wiping
/// means overwriting with the zero element.
pub struct SecretScalar<F: PrimeField> {
    value: F,
}

impl<F: PrimeField> SecretScalar<F> {
    pub fn new(value: F) -> Self {
        Self { value }
    }

    /// Borrow the inner value. The caller must not copy it out of scope.
    pub fn expose(&self) -> &F {
        &self.value
    }
}

impl<F: PrimeField> Zeroize for SecretScalar<F> {
    fn zeroize(&mut self) {
        self.value = F::zero();
    }
}

impl<F: PrimeField> ZeroizeOnDrop for SecretScalar<F> {}

impl<F: PrimeField> Drop for SecretScalar<F> {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl<F: PrimeField> core::fmt::Debug for SecretScalar<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SecretScalar(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_bls12_381::Fr;
    use ark_std::UniformRand;

    #[test]
    fn zeroize_overwrites_value() {
        let mut rng = ark_std::test_rng();
        let mut secret = SecretScalar::new(Fr::rand(&mut rng));
        secret.zeroize();
        assert_eq!(*secret.expose(), Fr::from(0u64));
    }

    #[test]
    fn debug_does_not_leak() {
        let secret = SecretScalar::new(Fr::from(42u64));
        assert_eq!(format!("{:?}", secret), "SecretScalar(<redacted>)");
    }
}
