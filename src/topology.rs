//! Ring topology over the flattened participant list.
//!
//! A protocol tree is carried around as its flattened list of participants.
//! The circuit protocols only need each node's unique successor: the next
//! entry in that list, wrapping from the last back to the first, so that the
//! initiator is part of the ring like everyone else.

use ark_ec::{CurveGroup, PrimeGroup};
use ark_std::rand::RngCore;
use ark_std::{UniformRand, Zero};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::security::SecretScalar;

/// Stable identity of a participant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// A participant's entry in the flattened tree list.
#[derive(Clone, Debug)]
pub struct RosterEntry<C: CurveGroup> {
    pub id: NodeId,
    pub public: C,
}

/// The ordered participant list of one protocol tree.
///
/// Order is significant: it defines the ring. Identity is by [`NodeId`]; the
/// attached public keys are the nodes' static ElGamal key shares.
#[derive(Clone, Debug)]
pub struct Roster<C: CurveGroup> {
    members: Vec<RosterEntry<C>>,
}

impl<C: CurveGroup> Roster<C> {
    /// Builds a roster from the flattened tree list.
    ///
    /// # Errors
    /// Returns a configuration error if the list is empty or contains a
    /// duplicate identity.
    pub fn new(members: Vec<RosterEntry<C>>) -> Result<Self, ProtocolError> {
        if members.is_empty() {
            return Err(ProtocolError::Configuration(
                "roster must contain at least one node".into(),
            ));
        }
        for (i, entry) in members.iter().enumerate() {
            if members[..i].iter().any(|other| other.id == entry.id) {
                return Err(ProtocolError::Configuration(format!(
                    "duplicate roster identity {}",
                    entry.id
                )));
            }
        }
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RosterEntry<C>> {
        self.members.iter()
    }

    /// Position of `id` in the flattened list.
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.members.iter().position(|entry| entry.id == id)
    }

    pub fn entry(&self, index: usize) -> Option<&RosterEntry<C>> {
        self.members.get(index)
    }

    pub fn by_id(&self, id: NodeId) -> Option<&RosterEntry<C>> {
        self.members.iter().find(|entry| entry.id == id)
    }

    /// The unique successor of `id` in the ring.
    ///
    /// # Errors
    /// Returns a configuration error if `id` is not part of the roster. This
    /// is unrecoverable and must abort before any network I/O.
    pub fn successor_of(&self, id: NodeId) -> Result<NodeId, ProtocolError> {
        let position = self.position(id).ok_or_else(|| {
            ProtocolError::Configuration(format!("{} is not part of the roster", id))
        })?;
        Ok(self.members[(position + 1) % self.members.len()].id)
    }

    /// The collective ElGamal key: the sum of all member public keys.
    pub fn aggregate_key(&self) -> C {
        self.members
            .iter()
            .fold(C::zero(), |acc, entry| acc + entry.public)
    }
}

/// A node's static keypair. The secret half is wiped on drop.
#[derive(Debug)]
pub struct Keypair<C: CurveGroup> {
    secret: SecretScalar<C::ScalarField>,
    public: C,
}

impl<C: CurveGroup> Keypair<C> {
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let secret = C::ScalarField::rand(rng);
        let public = C::generator() * secret;
        Self {
            secret: SecretScalar::new(secret),
            public,
        }
    }

    pub fn public(&self) -> C {
        self.public
    }

    pub fn secret(&self) -> &C::ScalarField {
        self.secret.expose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_bls12_381::G1Projective;

    fn roster_of(n: u32) -> Roster<G1Projective> {
        let mut rng = ark_std::test_rng();
        let members = (0..n)
            .map(|i| RosterEntry {
                id: NodeId(i),
                public: Keypair::<G1Projective>::generate(&mut rng).public(),
            })
            .collect();
        Roster::new(members).unwrap()
    }

    #[test]
    fn successor_walks_the_ring_and_wraps() {
        let roster = roster_of(4);
        assert_eq!(roster.successor_of(NodeId(0)).unwrap(), NodeId(1));
        assert_eq!(roster.successor_of(NodeId(2)).unwrap(), NodeId(3));
        assert_eq!(roster.successor_of(NodeId(3)).unwrap(), NodeId(0));
    }

    #[test]
    fn single_node_ring_points_at_itself() {
        let roster = roster_of(1);
        assert_eq!(roster.successor_of(NodeId(0)).unwrap(), NodeId(0));
    }

    #[test]
    fn absent_node_is_a_configuration_error() {
        let roster = roster_of(3);
        let err = roster.successor_of(NodeId(9)).unwrap_err();
        assert!(matches!(err, ProtocolError::Configuration(_)));
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut rng = ark_std::test_rng();
        let public = Keypair::<G1Projective>::generate(&mut rng).public();
        let members = vec![
            RosterEntry { id: NodeId(1), public },
            RosterEntry { id: NodeId(1), public },
        ];
        assert!(matches!(
            Roster::new(members),
            Err(ProtocolError::Configuration(_))
        ));
    }

    #[test]
    fn aggregate_key_is_the_sum_of_member_keys() {
        let mut rng = ark_std::test_rng();
        let pairs: Vec<Keypair<G1Projective>> =
            (0..3).map(|_| Keypair::generate(&mut rng)).collect();
        let members = pairs
            .iter()
            .enumerate()
            .map(|(i, kp)| RosterEntry {
                id: NodeId(i as u32),
                public: kp.public(),
            })
            .collect();
        let roster = Roster::new(members).unwrap();

        let expected = pairs
            .iter()
            .fold(G1Projective::zero(), |acc, kp| acc + kp.public());
        assert_eq!(roster.aggregate_key(), expected);
    }
}
