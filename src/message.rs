//! Wire messages exchanged between protocol instances.
//!
//! Points and scalars cross the wire as compressed arkworks bytes inside
//! serde-derived structs; the envelope itself is bincode-framed by the
//! transport. Every message is addressed to one protocol instance on one
//! node — there is no broadcast primitive at this layer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::session::SessionId;
use crate::topology::NodeId;

/// Unique identifier of one protocol instance across the roster.
pub type InstanceId = [u8; 32];

/// Temporary identifier addressing one ciphertext vector inside a batch.
pub type TempId = u64;

/// One directed protocol message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Envelope {
    /// Registered protocol name, used to instantiate on first contact.
    pub protocol: String,
    pub instance: InstanceId,
    pub from: NodeId,
    pub payload: Payload,
}

impl Envelope {
    /// Encodes the envelope for a byte-oriented transport.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(ProtocolError::serialization)
    }

    /// Decodes an envelope received from a byte-oriented transport.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(ProtocolError::serialization)
    }
}

/// Typed payloads understood by the hosted protocols.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Payload {
    /// Secret sharing: a dealer's commitments plus the recipient's subshare.
    SecretInit(SecretInit),
    /// Secret sharing: a node's verdict on its combined share.
    SecretConfirm(SecretConfirm),
    /// Signing: the initiator requests a partial signature for a round.
    SigRequest(SigRequest),
    /// Signing: a node's partial signature for a round.
    SigResponse(SigResponse),
    /// Key switching: the ciphertext batch travelling around the ring.
    KeySwitch(KeySwitchMessage),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SecretInit {
    pub session: SessionId,
    /// Roster index of the dealing node.
    pub dealer: u32,
    /// Compressed commitments to the dealer's polynomial coefficients.
    pub commitments: Vec<Vec<u8>>,
    /// Compressed evaluation of the dealer's polynomial at the recipient.
    pub subshare: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SecretConfirm {
    pub session: SessionId,
    /// Roster index of the confirming node.
    pub node: u32,
    /// False when a received subshare contradicted its commitments.
    pub valid: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SigRequest {
    /// The short-term session backing this round.
    pub session: SessionId,
    pub message: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SigResponse {
    pub session: SessionId,
    /// Roster index of the responding node.
    pub node: u32,
    /// Compressed partial signature scalar.
    pub partial: Vec<u8>,
}

/// The state a key-switching round accumulates while circling the ring.
///
/// `data` holds the evolving ciphertext vectors, stripped of their original
/// ephemeral keys; those travel separately in `original_ephemeral` because
/// every hop's transform needs them unchanged. `proofs` is append-only.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KeySwitchMessage {
    /// Compressed [`CipherVector`](crate::keyswitch::CipherVector) per id.
    pub data: BTreeMap<TempId, Vec<u8>>,
    /// Compressed target public key the batch is being switched onto.
    pub target_key: Vec<u8>,
    /// Compressed original ephemeral keys, one vector per id.
    pub original_ephemeral: BTreeMap<TempId, Vec<u8>>,
    /// Compressed per-hop proof lists, one per id, strictly appended.
    pub proofs: BTreeMap<TempId, Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionKind;

    #[test]
    fn envelope_survives_wire_framing() {
        let envelope = Envelope {
            protocol: "jvss".into(),
            instance: [7u8; 32],
            from: NodeId(2),
            payload: Payload::SigRequest(SigRequest {
                session: SessionId::fresh(SessionKind::ShortTerm),
                message: b"Hello world".to_vec(),
            }),
        };
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.protocol, "jvss");
        assert_eq!(decoded.instance, [7u8; 32]);
        assert_eq!(decoded.from, NodeId(2));
        match decoded.payload {
            Payload::SigRequest(req) => {
                assert_eq!(req.message, b"Hello world");
                assert!(req.session.is_short_term());
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
