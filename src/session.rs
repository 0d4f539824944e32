//! Shared-secret sessions and the store that owns them.
//!
//! A protocol run is anchored by exactly one long-term session; every signing
//! round creates a fresh short-term session (the Schnorr nonce) and discards
//! it when the round ends, whatever the outcome. Sessions are built with a
//! joint Feldman-style dealing: each node deals a random polynomial, commits
//! publicly to its coefficients, and hands every other node one evaluation.
//! A node's combined share is the sum of the subshares it verified; the joint
//! public commitment is the sum of the dealers' constant-term commitments.

use std::collections::HashMap;
use std::sync::Arc;

use ark_ec::{CurveGroup, PrimeGroup};
use ark_poly::{univariate::DensePolynomial, DenseUVPolynomial, Polynomial};
use ark_std::rand::RngCore;
use ark_std::UniformRand;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::ProtocolError;
use crate::security::SecretScalar;
use crate::utils::random_nonce;

/// Distinguishes the secret anchoring a protocol run from a per-round nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    LongTerm,
    ShortTerm,
}

/// Opaque session identifier, tagged with its kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId {
    kind: SessionKind,
    nonce: [u8; 16],
}

impl SessionId {
    /// Draws a fresh identifier of the given kind.
    pub fn fresh(kind: SessionKind) -> Self {
        Self {
            kind,
            nonce: random_nonce(),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn is_long_term(&self) -> bool {
        self.kind == SessionKind::LongTerm
    }

    pub fn is_short_term(&self) -> bool {
        self.kind == SessionKind::ShortTerm
    }
}

impl core::fmt::Display for SessionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let tag = match self.kind {
            SessionKind::LongTerm => "lt",
            SessionKind::ShortTerm => "st",
        };
        write!(f, "{}-{}", tag, hex::encode(&self.nonce[..4]))
    }
}

/// A node's private share of a completed session plus the joint commitment.
///
/// The share is wiped when the secret is dropped, i.e. when its session is
/// discarded from the store.
#[derive(Debug)]
pub struct Secret<C: CurveGroup> {
    share: SecretScalar<C::ScalarField>,
    commitment: C,
}

impl<C: CurveGroup> Secret<C> {
    pub fn new(share: C::ScalarField, commitment: C) -> Self {
        Self {
            share: SecretScalar::new(share),
            commitment,
        }
    }

    pub fn share(&self) -> &C::ScalarField {
        self.share.expose()
    }

    /// The group's joint public commitment: the shared public key for a
    /// long-term session, the random commitment for a short-term one.
    pub fn commitment(&self) -> C {
        self.commitment
    }
}

/// One node's dealing for a joint secret-sharing session.
pub struct Dealer<C: CurveGroup> {
    polynomial: DensePolynomial<C::ScalarField>,
    commitments: Vec<C>,
}

impl<C: CurveGroup> Dealer<C> {
    /// Deals a random polynomial with `threshold` coefficients.
    ///
    /// # Errors
    /// Returns a configuration error when `threshold` is zero.
    pub fn new<R: RngCore>(threshold: usize, rng: &mut R) -> Result<Self, ProtocolError> {
        if threshold == 0 {
            return Err(ProtocolError::Configuration(
                "dealing threshold must be at least 1".into(),
            ));
        }

        let coefficients: Vec<C::ScalarField> =
            (0..threshold).map(|_| C::ScalarField::rand(rng)).collect();
        let polynomial = DensePolynomial::from_coefficients_vec(coefficients);

        let commitments: Vec<C> = polynomial
            .coeffs()
            .iter()
            .map(|coeff| C::generator() * coeff)
            .collect();

        Ok(Self {
            polynomial,
            commitments,
        })
    }

    /// Public commitments to the polynomial coefficients.
    pub fn commitments(&self) -> &[C] {
        &self.commitments
    }

    /// Evaluation handed to the participant at 1-based `index`.
    pub fn subshare(&self, index: usize) -> Result<C::ScalarField, ProtocolError> {
        if index == 0 {
            return Err(ProtocolError::Configuration(
                "participant index must be >= 1".into(),
            ));
        }
        Ok(self
            .polynomial
            .evaluate(&C::ScalarField::from(index as u64)))
    }
}

/// Feldman check: `g * subshare` against the dealer's commitments evaluated
/// at the participant's 1-based `index`.
pub fn verify_subshare<C: CurveGroup>(
    index: usize,
    subshare: &C::ScalarField,
    commitments: &[C],
) -> bool {
    if index == 0 || commitments.is_empty() {
        return false;
    }

    let x = C::ScalarField::from(index as u64);
    let mut x_power = C::ScalarField::from(1u64);
    let mut expected = commitments[0];
    for commitment in commitments.iter().skip(1) {
        x_power *= x;
        expected += *commitment * x_power;
    }

    C::generator() * subshare == expected
}

/// Per-session slot. The slot mutex serializes all operations on one
/// session identifier; distinct identifiers never contend on it.
struct Slot<C: CurveGroup> {
    secret: Option<Arc<Secret<C>>>,
}

/// Maps session identifiers to completed secrets.
///
/// Shared by every round running on one node. The outer lock only guards the
/// slot table and is never held across a slot operation, so rounds on
/// distinct sessions make independent progress while operations on one
/// session stay mutually exclusive.
pub struct SessionStore<C: CurveGroup> {
    slots: Mutex<HashMap<SessionId, Arc<Mutex<Slot<C>>>>>,
}

impl<C: CurveGroup> SessionStore<C> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
        })
    }

    async fn slot(&self, session: SessionId) -> Arc<Mutex<Slot<C>>> {
        let mut slots = self.slots.lock().await;
        slots
            .entry(session)
            .or_insert_with(|| Arc::new(Mutex::new(Slot { secret: None })))
            .clone()
    }

    /// Records the completed secret for `session`. The first completion
    /// wins; a later one for the same identifier is ignored.
    pub async fn complete(&self, session: SessionId, secret: Secret<C>) {
        let slot = self.slot(session).await;
        let mut slot = slot.lock().await;
        if slot.secret.is_none() {
            slot.secret = Some(Arc::new(secret));
        }
    }

    /// Looks up the completed secret for `session`.
    ///
    /// Repeated lookups return the same shared secret.
    ///
    /// # Errors
    /// Returns `NotFound` when the session was never completed here or has
    /// been discarded.
    pub async fn secret(&self, session: SessionId) -> Result<Arc<Secret<C>>, ProtocolError> {
        let slot = {
            let slots = self.slots.lock().await;
            slots.get(&session).cloned()
        };
        let slot = slot.ok_or(ProtocolError::NotFound(session))?;
        let slot = slot.lock().await;
        slot.secret.clone().ok_or(ProtocolError::NotFound(session))
    }

    /// Drops `session` and its secret. Short-term sessions are discarded as
    /// soon as their round ends, success or failure.
    pub async fn discard(&self, session: SessionId) {
        let mut slots = self.slots.lock().await;
        slots.remove(&session);
    }
}
