//! Threshold Circuit
//!
//! Multi-party cryptographic protocols over nodes arranged in a
//! communication ring: a distributed-protocol engine hosting a joint
//! verifiable secret sharing (JVSS) threshold-signing scheme and a
//! ciphertext key-switching circuit.
//!
//! ## Key Components
//!
//! - **Topology**: the flattened participant list and each node's unique
//!   successor in the ring
//! - **Lifecycle**: the Start/Dispatch state machine every protocol runs on,
//!   plus the per-node runtime and protocol registry
//! - **Sessions**: long-term and short-term shared secrets established with
//!   Feldman-style joint dealing and owned by a per-node store
//! - **Signing**: aggregate Schnorr-style signatures assembled from per-node
//!   partial signatures
//! - **Key switching**: re-keying a ciphertext batch onto a new public key
//!   hop by hop, without decrypting, with an auditable proof chain
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use ark_bls12_381::G1Projective;
//! use ark_std::UniformRand;
//! use threshold_circuit::keyswitch::{encrypt, switch_keys, CipherVector};
//! use threshold_circuit::lifecycle::EngineConfig;
//! use threshold_circuit::local::LocalCluster;
//! use threshold_circuit::sign::{verify, JvssProtocol};
//! use threshold_circuit::topology::Keypair;
//!
//! # async fn demo() -> Result<(), threshold_circuit::ProtocolError> {
//! let mut rng = ark_std::test_rng();
//! let cluster = LocalCluster::<G1Projective>::start(5, EngineConfig::default(), &mut rng)?;
//!
//! // Threshold signing anchored on a joint long-term secret.
//! let signer = JvssProtocol::initiate(cluster.runtime(0), cluster.store(0).clone()).await?;
//! let signature = signer.sign(b"Hello world").await?;
//! verify(&signer.public_key().await?, b"Hello world", &signature)?;
//!
//! // Re-key a batch from the ring's collective key onto a fresh one.
//! let target = Keypair::<G1Projective>::generate(&mut rng);
//! let collective = cluster.roster().aggregate_key();
//! let mut batch = BTreeMap::new();
//! batch.insert(
//!     0u64,
//!     CipherVector(vec![encrypt(G1Projective::rand(&mut rng), &collective, &mut rng)]),
//! );
//! let _switched = switch_keys(cluster.runtime(0), batch, target.public()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use ark_ec::CurveGroup;

pub mod error;
pub mod keyswitch;
pub mod lifecycle;
pub mod local;
pub mod message;
pub mod security;
pub mod session;
pub mod sign;
pub mod topology;
pub mod utils;

pub use error::ProtocolError;

use keyswitch::{KeySwitchProtocol, PROTOCOL_KEY_SWITCH};
use lifecycle::{EngineConfig, Registry};
use session::SessionStore;
use sign::{JvssProtocol, PROTOCOL_JVSS};

/// Builds the registry with both hosted protocols, sharing one session
/// store. Construct it once at process start and hand it to the node's
/// runtime; there is no ambient global protocol table.
pub fn standard_registry<C: CurveGroup>(
    store: Arc<SessionStore<C>>,
    config: EngineConfig,
) -> Registry<C> {
    let mut registry = Registry::new();
    registry.register(
        PROTOCOL_JVSS,
        Box::new(move |ctx, instance, inbox| {
            let threshold = config.threshold_for(ctx.roster().len());
            Box::new(JvssProtocol::responder(
                ctx,
                instance,
                inbox,
                store.clone(),
                threshold,
            ))
        }),
    );
    registry.register(
        PROTOCOL_KEY_SWITCH,
        Box::new(|ctx, instance, inbox| {
            Box::new(KeySwitchProtocol::responder(ctx, instance, inbox))
        }),
    );
    registry
}
