//! Ciphertext key-switching around the ring.
//!
//! The initiator strips a batch of ElGamal ciphertexts of their ephemeral
//! keys and sends it to its successor. Each hop removes its own share of the
//! original encryption key and adds a contribution under the target key — a
//! pure algebraic transform with a blinding scalar derived from the node's
//! private share and the entry's original ephemeral key, so no hop injects
//! fresh randomness. The plaintext hidden in every entry is unchanged across
//! all hops; only the encrypting key and the ephemeral key evolve. Every hop
//! appends one correctness proof per ciphertext, so the full re-keying chain
//! can be audited offline after the round.

use std::collections::BTreeMap;
use std::sync::Arc;

use ark_ec::{CurveGroup, PrimeGroup};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::RngCore;
use ark_std::{UniformRand, Zero};
use async_trait::async_trait;
use rayon::prelude::*;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::lifecycle::{
    Flow, Inbox, Lifecycle, NodeContext, NodeRuntime, ProtocolInstance,
};
use crate::message::{InstanceId, KeySwitchMessage, Payload, TempId};
use crate::topology::Roster;
use crate::utils::{from_bytes, hash_to_scalar, random_id, to_bytes};

/// Registry name of the key-switching protocol.
pub const PROTOCOL_KEY_SWITCH: &str = "key-switch";

const REKEY_DOMAIN: &[u8] = b"threshold-circuit/rekey-blind";
const DLEQ_NONCE_DOMAIN: &[u8] = b"threshold-circuit/dleq-nonce";
const DLEQ_CHALLENGE_DOMAIN: &[u8] = b"threshold-circuit/dleq-challenge";

/// ElGamal ciphertext over the group: `(ephemeral, payload)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct CipherText<C: CurveGroup> {
    pub ephemeral: C,
    pub payload: C,
}

/// Ordered sequence of ciphertexts addressed by one temporary identifier.
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct CipherVector<C: CurveGroup>(pub Vec<CipherText<C>>);

/// Encrypts a group-encoded plaintext under `key`.
pub fn encrypt<C: CurveGroup, R: RngCore>(plaintext: C, key: &C, rng: &mut R) -> CipherText<C> {
    let r = C::ScalarField::rand(rng);
    CipherText {
        ephemeral: C::generator() * r,
        payload: plaintext + *key * r,
    }
}

/// Recovers the group-encoded plaintext with the key's secret scalar.
pub fn decrypt<C: CurveGroup>(ciphertext: &CipherText<C>, secret: &C::ScalarField) -> C {
    ciphertext.payload - ciphertext.ephemeral * *secret
}

/// Chaum-Pedersen proof that two points share one discrete logarithm:
/// `log_g1(h1) == log_g2(h2)`. Challenges and nonces are derived by
/// Fiat-Shamir hashing, so proving is deterministic.
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct Dleq<C: CurveGroup> {
    pub challenge: C::ScalarField,
    pub response: C::ScalarField,
}

impl<C: CurveGroup> Dleq<C> {
    fn challenge_for(
        g1: &C,
        h1: &C,
        g2: &C,
        h2: &C,
        t1: &C,
        t2: &C,
    ) -> Result<C::ScalarField, ProtocolError> {
        Ok(hash_to_scalar(
            DLEQ_CHALLENGE_DOMAIN,
            &[
                &to_bytes(g1)?,
                &to_bytes(h1)?,
                &to_bytes(g2)?,
                &to_bytes(h2)?,
                &to_bytes(t1)?,
                &to_bytes(t2)?,
            ],
        ))
    }

    pub fn prove(
        witness: &C::ScalarField,
        g1: &C,
        h1: &C,
        g2: &C,
        h2: &C,
    ) -> Result<Self, ProtocolError> {
        let nonce: C::ScalarField = hash_to_scalar(
            DLEQ_NONCE_DOMAIN,
            &[
                &to_bytes(witness)?,
                &to_bytes(g1)?,
                &to_bytes(h1)?,
                &to_bytes(g2)?,
                &to_bytes(h2)?,
            ],
        );
        let t1 = *g1 * nonce;
        let t2 = *g2 * nonce;
        let challenge = Self::challenge_for(g1, h1, g2, h2, &t1, &t2)?;
        Ok(Self {
            challenge,
            response: nonce + challenge * witness,
        })
    }

    pub fn verify(&self, g1: &C, h1: &C, g2: &C, h2: &C) -> bool {
        let t1 = *g1 * self.response - *h1 * self.challenge;
        let t2 = *g2 * self.response - *h2 * self.challenge;
        match Self::challenge_for(g1, h1, g2, h2, &t1, &t2) {
            Ok(challenge) => challenge == self.challenge,
            Err(_) => false,
        }
    }
}

/// Correctness proof for one hop's transform of one ciphertext.
///
/// Strictly appended, never removed: the accumulated list replays the whole
/// re-keying chain from the stripped batch to the final one.
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct SwitchProof<C: CurveGroup> {
    /// Roster index of the contributing node.
    pub node: u32,
    /// `blind * G`, added to the entry's ephemeral key.
    pub ephemeral_contrib: C,
    /// `blind * target`, added to the entry's payload.
    pub key_contrib: C,
    /// `share * original_ephemeral`, removed from the entry's payload.
    pub share_contrib: C,
    /// Binds `ephemeral_contrib` and `key_contrib` to one blind.
    pub blind_proof: Dleq<C>,
    /// Binds `share_contrib` to the node's public share.
    pub share_proof: Dleq<C>,
}

impl<C: CurveGroup> SwitchProof<C> {
    /// Checks both bindings against the node's public share, the entry's
    /// original ephemeral key and the target key.
    pub fn verify(&self, public_share: &C, original_ephemeral: &C, target: &C) -> bool {
        let generator = C::generator();
        self.blind_proof
            .verify(&generator, &self.ephemeral_contrib, target, &self.key_contrib)
            && self
                .share_proof
                .verify(&generator, public_share, original_ephemeral, &self.share_contrib)
    }
}

/// Re-keys one entry in place and returns the hop's proof.
fn rekey_entry<C: CurveGroup>(
    entry: &mut CipherText<C>,
    original_ephemeral: &C,
    target: &C,
    share: &C::ScalarField,
    public_share: &C,
    node: u32,
) -> Result<SwitchProof<C>, ProtocolError> {
    let blind: C::ScalarField = hash_to_scalar(
        REKEY_DOMAIN,
        &[
            &to_bytes(share)?,
            &to_bytes(original_ephemeral)?,
            &to_bytes(target)?,
        ],
    );

    let generator = C::generator();
    let share_contrib = *original_ephemeral * *share;
    let key_contrib = *target * blind;
    let ephemeral_contrib = generator * blind;

    entry.payload = entry.payload - share_contrib + key_contrib;
    entry.ephemeral += ephemeral_contrib;

    let blind_proof = Dleq::prove(&blind, &generator, &ephemeral_contrib, target, &key_contrib)?;
    let share_proof = Dleq::prove(share, &generator, public_share, original_ephemeral, &share_contrib)?;

    Ok(SwitchProof {
        node,
        ephemeral_contrib,
        key_contrib,
        share_contrib,
        blind_proof,
        share_proof,
    })
}

/// Final result of a completed round: the re-keyed batch plus the per-hop
/// proof chains accumulated while it circled the ring.
#[derive(Clone, Debug)]
pub struct SwitchedBatch<C: CurveGroup> {
    pub data: BTreeMap<TempId, CipherVector<C>>,
    /// Hop-ordered proof lists, one proof per ciphertext per hop.
    pub proofs: BTreeMap<TempId, Vec<Vec<SwitchProof<C>>>>,
}

/// Typed view of the wire message while a node works on it.
struct RoundState<C: CurveGroup> {
    data: BTreeMap<TempId, CipherVector<C>>,
    target_key: C,
    original_ephemeral: BTreeMap<TempId, Vec<C>>,
    proofs: BTreeMap<TempId, Vec<Vec<SwitchProof<C>>>>,
}

impl<C: CurveGroup> RoundState<C> {
    fn decode(message: &KeySwitchMessage) -> Result<Self, ProtocolError> {
        let mut data = BTreeMap::new();
        for (id, bytes) in &message.data {
            data.insert(*id, from_bytes::<CipherVector<C>>(bytes)?);
        }
        let target_key: C = from_bytes(&message.target_key)?;
        let mut original_ephemeral = BTreeMap::new();
        for (id, bytes) in &message.original_ephemeral {
            original_ephemeral.insert(*id, from_bytes::<Vec<C>>(bytes)?);
        }
        let mut proofs = BTreeMap::new();
        for (id, bytes) in &message.proofs {
            proofs.insert(*id, from_bytes::<Vec<Vec<SwitchProof<C>>>>(bytes)?);
        }
        Ok(Self {
            data,
            target_key,
            original_ephemeral,
            proofs,
        })
    }

    fn encode(&self) -> Result<KeySwitchMessage, ProtocolError> {
        let mut data = BTreeMap::new();
        for (id, vector) in &self.data {
            data.insert(*id, to_bytes(vector)?);
        }
        let mut original_ephemeral = BTreeMap::new();
        for (id, keys) in &self.original_ephemeral {
            original_ephemeral.insert(*id, to_bytes(keys)?);
        }
        let mut proofs = BTreeMap::new();
        for (id, chain) in &self.proofs {
            proofs.insert(*id, to_bytes(chain)?);
        }
        Ok(KeySwitchMessage {
            data,
            target_key: to_bytes(&self.target_key)?,
            original_ephemeral,
            proofs,
        })
    }

    /// Runs this node's hop: every entry re-keyed, in parallel, with a join
    /// barrier before the state can be forwarded.
    fn rekey_all(&mut self, ctx: &NodeContext<C>) -> Result<(), ProtocolError> {
        let share = *ctx.secret_share();
        let public_share = ctx.public_share();
        let target = self.target_key;
        let node = ctx.index() as u32;

        for (id, vector) in self.data.iter_mut() {
            let originals = self.original_ephemeral.get(id).ok_or_else(|| {
                ProtocolError::Serialization(format!("missing ephemeral keys for vector {}", id))
            })?;
            if originals.len() != vector.0.len() {
                return Err(ProtocolError::Serialization(format!(
                    "ephemeral key count mismatch for vector {}",
                    id
                )));
            }

            let hop: Vec<SwitchProof<C>> = vector
                .0
                .par_iter_mut()
                .zip(originals.par_iter())
                .map(|(entry, original)| {
                    rekey_entry(entry, original, &target, &share, &public_share, node)
                })
                .collect::<Result<_, _>>()?;

            self.proofs.entry(*id).or_default().push(hop);
        }
        Ok(())
    }
}

/// The key-switching protocol instance running on one node.
pub struct KeySwitchProtocol<C: CurveGroup> {
    ctx: Arc<NodeContext<C>>,
    instance: InstanceId,
    lifecycle: Lifecycle,
    inbox: Inbox,
    target: Option<BTreeMap<TempId, CipherVector<C>>>,
    target_key: Option<C>,
    feedback: Option<oneshot::Sender<Result<SwitchedBatch<C>, ProtocolError>>>,
    initiated: bool,
}

impl<C: CurveGroup> KeySwitchProtocol<C> {
    /// Builds the responder side, invoked by the registry on first contact.
    pub fn responder(ctx: Arc<NodeContext<C>>, instance: InstanceId, inbox: Inbox) -> Self {
        Self {
            ctx,
            instance,
            lifecycle: Lifecycle::new(),
            inbox,
            target: None,
            target_key: None,
            feedback: None,
            initiated: false,
        }
    }

    fn fail_feedback(&mut self, err: &ProtocolError) {
        if let Some(feedback) = self.feedback.take() {
            let _ = feedback.send(Err(err.clone()));
        }
    }

    fn forward(&self, state: &RoundState<C>) -> Result<(), ProtocolError> {
        let message = state.encode()?;
        let envelope = self.ctx.envelope(
            PROTOCOL_KEY_SWITCH,
            self.instance,
            Payload::KeySwitch(message),
        );
        // A failed hop is logged and never retried here; the round stalls
        // and the initiator's deadline recovers by restarting it.
        self.ctx.send(self.ctx.successor(), envelope)
    }
}

#[async_trait]
impl<C: CurveGroup> ProtocolInstance for KeySwitchProtocol<C> {
    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    /// Packages the batch and hands it to the successor. Initiator only.
    async fn start(&mut self) -> Result<(), ProtocolError> {
        let batch = match self.target.take() {
            Some(batch) => batch,
            None => {
                let err = ProtocolError::Configuration(
                    "no ciphertext batch given as key-switching target".into(),
                );
                self.fail_feedback(&err);
                return Err(err);
            }
        };
        let target_key = match self.target_key {
            Some(target_key) => target_key,
            None => {
                let err = ProtocolError::Configuration(
                    "no target public key to switch onto".into(),
                );
                self.fail_feedback(&err);
                return Err(err);
            }
        };

        info!(node = %self.ctx.local(), "started a key-switching round");

        // Strip the stale key material: the payloads travel with identity
        // ephemeral keys while the originals ride in their own table.
        let mut data = BTreeMap::new();
        let mut original_ephemeral = BTreeMap::new();
        for (id, vector) in batch {
            original_ephemeral.insert(
                id,
                vector.0.iter().map(|entry| entry.ephemeral).collect::<Vec<C>>(),
            );
            data.insert(
                id,
                CipherVector(
                    vector
                        .0
                        .into_iter()
                        .map(|entry| CipherText {
                            ephemeral: C::zero(),
                            payload: entry.payload,
                        })
                        .collect(),
                ),
            );
        }

        let state = RoundState {
            data,
            target_key,
            original_ephemeral,
            proofs: BTreeMap::new(),
        };
        if let Err(err) = self.forward(&state) {
            self.fail_feedback(&err);
            return Err(err);
        }
        Ok(())
    }

    /// Processes the one message this node sees per circuit pass.
    async fn dispatch(&mut self) -> Result<Flow, ProtocolError> {
        let envelope = match self.inbox.recv().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(Flow::Done),
            Err(err) => {
                warn!(node = %self.ctx.local(), "key-switching round expired: {err}");
                self.fail_feedback(&err);
                return Err(err);
            }
        };

        let message = match envelope.payload {
            Payload::KeySwitch(message) => message,
            other => {
                debug!(payload = ?other, "unexpected payload for key-switching protocol");
                return Ok(Flow::Continue);
            }
        };

        let outcome: Result<RoundState<C>, ProtocolError> = (|| {
            let mut state = RoundState::decode(&message)?;
            state.rekey_all(&self.ctx)?;
            Ok(state)
        })();
        let state = match outcome {
            Ok(state) => state,
            Err(err) => {
                self.fail_feedback(&err);
                return Err(err);
            }
        };

        if self.initiated {
            // Our own round has closed the full circuit.
            info!(node = %self.ctx.local(), "completed key switching");
            if let Some(feedback) = self.feedback.take() {
                let _ = feedback.send(Ok(SwitchedBatch {
                    data: state.data,
                    proofs: state.proofs,
                }));
            }
        } else {
            info!(node = %self.ctx.local(), "carried on key switching");
            self.forward(&state)?;
        }
        Ok(Flow::Done)
    }
}

/// Routes `batch` around the ring, re-keying it onto `target_key`.
///
/// Synchronous to the caller: blocks until the circuit completes or the
/// round deadline elapses.
///
/// # Errors
/// `Configuration` when the batch is empty; `Timeout` when the round does
/// not close the circuit within the deadline.
pub async fn switch_keys<C: CurveGroup>(
    runtime: &Arc<NodeRuntime<C>>,
    batch: BTreeMap<TempId, CipherVector<C>>,
    target_key: C,
) -> Result<SwitchedBatch<C>, ProtocolError> {
    if batch.is_empty() {
        return Err(ProtocolError::Configuration(
            "no ciphertext batch given as key-switching target".into(),
        ));
    }

    let instance = random_id();
    let inbox = runtime.attach(instance).await;
    let (feedback_tx, feedback_rx) = oneshot::channel();

    let protocol = KeySwitchProtocol {
        ctx: runtime.context().clone(),
        instance,
        lifecycle: Lifecycle::new(),
        inbox,
        target: Some(batch),
        target_key: Some(target_key),
        feedback: Some(feedback_tx),
        initiated: true,
    };
    runtime.launch(instance, Box::new(protocol), true);

    match tokio::time::timeout(runtime.config().round_timeout, feedback_rx).await {
        Ok(Ok(result)) => result,
        // The instance dropped the round without answering.
        Ok(Err(_)) => Err(ProtocolError::Timeout),
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Replays the accumulated proof chains offline.
///
/// Checks that every roster member contributed exactly one hop per vector,
/// that every per-entry proof verifies, and that the replayed contributions
/// reach exactly the final batch.
///
/// # Errors
/// `ProofInvalid` on the first broken link.
pub fn verify_switch_chain<C: CurveGroup>(
    original: &BTreeMap<TempId, CipherVector<C>>,
    roster: &Roster<C>,
    target_key: &C,
    switched: &SwitchedBatch<C>,
) -> Result<(), ProtocolError> {
    for (id, original_vector) in original {
        let final_vector = switched
            .data
            .get(id)
            .ok_or_else(|| ProtocolError::ProofInvalid(format!("missing vector {}", id)))?;
        let hops = switched
            .proofs
            .get(id)
            .ok_or_else(|| ProtocolError::ProofInvalid(format!("missing proofs for vector {}", id)))?;
        if final_vector.0.len() != original_vector.0.len() {
            return Err(ProtocolError::ProofInvalid(format!(
                "entry count changed for vector {}",
                id
            )));
        }

        let mut contributors: Vec<u32> = Vec::with_capacity(hops.len());
        for hop in hops {
            let Some(first) = hop.first() else {
                return Err(ProtocolError::ProofInvalid(format!(
                    "empty hop for vector {}",
                    id
                )));
            };
            if hop.len() != original_vector.0.len()
                || hop.iter().any(|proof| proof.node != first.node)
            {
                return Err(ProtocolError::ProofInvalid(format!(
                    "malformed hop for vector {}",
                    id
                )));
            }
            contributors.push(first.node);
        }
        let mut distinct = contributors.clone();
        distinct.sort_unstable();
        distinct.dedup();
        if distinct.len() != roster.len() {
            return Err(ProtocolError::ProofInvalid(format!(
                "hops do not cover the roster for vector {}",
                id
            )));
        }

        for (index, original_entry) in original_vector.0.iter().enumerate() {
            let mut payload = original_entry.payload;
            let mut ephemeral = C::zero();
            for hop in hops {
                let proof = &hop[index];
                let entry = roster.entry(proof.node as usize).ok_or_else(|| {
                    ProtocolError::ProofInvalid(format!("unknown node {} in proof", proof.node))
                })?;
                if !proof.verify(&entry.public, &original_entry.ephemeral, target_key) {
                    return Err(ProtocolError::ProofInvalid(format!(
                        "hop by node {} rejected for vector {}",
                        proof.node, id
                    )));
                }
                payload = payload - proof.share_contrib + proof.key_contrib;
                ephemeral += proof.ephemeral_contrib;
            }
            if payload != final_vector.0[index].payload
                || ephemeral != final_vector.0[index].ephemeral
            {
                return Err(ProtocolError::ProofInvalid(format!(
                    "chain does not reach the final ciphertext for vector {}",
                    id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::EngineConfig;
    use crate::local::LocalCluster;
    use crate::topology::NodeId;
    use ark_bls12_381::G1Projective;
    use std::time::Duration;

    type G = G1Projective;

    #[test]
    fn elgamal_round_trip() {
        let mut rng = ark_std::test_rng();
        let keypair = crate::topology::Keypair::<G>::generate(&mut rng);
        let plaintext = G::rand(&mut rng);

        let ciphertext = encrypt(plaintext, &keypair.public(), &mut rng);
        assert_eq!(decrypt(&ciphertext, keypair.secret()), plaintext);
    }

    #[test]
    fn single_hop_rekey_preserves_the_plaintext() {
        let mut rng = ark_std::test_rng();
        let holder = crate::topology::Keypair::<G>::generate(&mut rng);
        let target = crate::topology::Keypair::<G>::generate(&mut rng);
        let plaintext = G::rand(&mut rng);

        // A one-node ring: the holder's key is the whole collective key.
        let sealed = encrypt(plaintext, &holder.public(), &mut rng);
        let original_ephemeral = sealed.ephemeral;
        let mut entry = CipherText {
            ephemeral: G::zero(),
            payload: sealed.payload,
        };

        let proof = rekey_entry(
            &mut entry,
            &original_ephemeral,
            &target.public(),
            holder.secret(),
            &holder.public(),
            0,
        )
        .unwrap();

        assert_eq!(decrypt(&entry, target.secret()), plaintext);
        assert!(proof.verify(&holder.public(), &original_ephemeral, &target.public()));
    }

    #[test]
    fn dleq_rejects_a_swapped_statement() {
        let mut rng = ark_std::test_rng();
        let witness = <G as PrimeGroup>::ScalarField::rand(&mut rng);
        let g1 = G::generator();
        let g2 = G::rand(&mut rng);
        let h1 = g1 * witness;
        let h2 = g2 * witness;

        let proof = Dleq::<G>::prove(&witness, &g1, &h1, &g2, &h2).unwrap();
        assert!(proof.verify(&g1, &h1, &g2, &h2));
        assert!(!proof.verify(&g1, &h2, &g2, &h1));
        assert!(!proof.verify(&g1, &(h1 + g1), &g2, &h2));
    }

    #[tokio::test]
    async fn five_node_circuit_switches_a_three_entry_batch() {
        let mut rng = ark_std::test_rng();
        let cluster = LocalCluster::<G>::start(5, EngineConfig::default(), &mut rng).unwrap();
        let collective = cluster.roster().aggregate_key();
        let target = crate::topology::Keypair::<G>::generate(&mut rng);

        let plaintexts: Vec<G> = (0..3).map(|_| G::rand(&mut rng)).collect();
        let vector = CipherVector(
            plaintexts
                .iter()
                .map(|plaintext| encrypt(*plaintext, &collective, &mut rng))
                .collect(),
        );
        let mut batch = BTreeMap::new();
        batch.insert(7u64, vector.clone());

        let switched = switch_keys(cluster.runtime(0), batch.clone(), target.public())
            .await
            .unwrap();

        let recovered: Vec<G> = switched.data[&7u64]
            .0
            .iter()
            .map(|entry| decrypt(entry, target.secret()))
            .collect();
        assert_eq!(recovered, plaintexts);

        verify_switch_chain(&batch, cluster.roster(), &target.public(), &switched).unwrap();
    }

    #[tokio::test]
    async fn tampered_final_batch_fails_the_audit() {
        let mut rng = ark_std::test_rng();
        let cluster = LocalCluster::<G>::start(3, EngineConfig::default(), &mut rng).unwrap();
        let collective = cluster.roster().aggregate_key();
        let target = crate::topology::Keypair::<G>::generate(&mut rng);

        let mut batch = BTreeMap::new();
        batch.insert(
            1u64,
            CipherVector(vec![encrypt(G::rand(&mut rng), &collective, &mut rng)]),
        );

        let mut switched = switch_keys(cluster.runtime(0), batch.clone(), target.public())
            .await
            .unwrap();
        switched.data.get_mut(&1u64).unwrap().0[0].payload += G::generator();

        assert!(matches!(
            verify_switch_chain(&batch, cluster.roster(), &target.public(), &switched),
            Err(ProtocolError::ProofInvalid(_))
        ));
    }

    #[tokio::test]
    async fn disconnected_node_times_the_round_out() {
        let mut rng = ark_std::test_rng();
        let config = EngineConfig {
            round_timeout: Duration::from_millis(400),
            ..EngineConfig::default()
        };
        let cluster = LocalCluster::<G>::start(5, config, &mut rng).unwrap();
        let collective = cluster.roster().aggregate_key();
        let target = crate::topology::Keypair::<G>::generate(&mut rng);

        let mut batch = BTreeMap::new();
        batch.insert(
            0u64,
            CipherVector(vec![encrypt(G::rand(&mut rng), &collective, &mut rng)]),
        );

        cluster.disconnect(NodeId(3));
        assert!(matches!(
            switch_keys(cluster.runtime(0), batch, target.public()).await,
            Err(ProtocolError::Timeout)
        ));
    }

    #[tokio::test]
    async fn start_without_targets_is_a_configuration_error() {
        use crate::lifecycle::{Inbox, NodeContext};
        use crate::local::LocalNetwork;
        use crate::topology::{Keypair, Roster, RosterEntry};
        use tokio::sync::mpsc;

        let mut rng = ark_std::test_rng();
        let network = LocalNetwork::new();
        let id = NodeId(0);
        let _incoming = network.register(id);
        let keypair = Keypair::<G>::generate(&mut rng);
        let roster = Roster::new(vec![RosterEntry {
            id,
            public: keypair.public(),
        }])
        .unwrap();
        let ctx = NodeContext::new(id, keypair, roster, network).unwrap();

        let (_tx, rx) = mpsc::unbounded_channel();
        let inbox = Inbox::new(rx, Duration::from_millis(100));
        let mut protocol = KeySwitchProtocol::<G>::responder(ctx, [0u8; 32], inbox);

        assert!(matches!(
            protocol.start().await,
            Err(ProtocolError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected_before_any_send() {
        let mut rng = ark_std::test_rng();
        let cluster = LocalCluster::<G>::start(3, EngineConfig::default(), &mut rng).unwrap();
        let target = crate::topology::Keypair::<G>::generate(&mut rng);

        assert!(matches!(
            switch_keys(cluster.runtime(0), BTreeMap::new(), target.public()).await,
            Err(ProtocolError::Configuration(_))
        ));
    }
}
