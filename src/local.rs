//! In-process overlay for tests and local simulation.
//!
//! Wires a full roster of nodes through in-memory channels, with every
//! envelope passed through its wire framing so the local ring behaves like a
//! byte-oriented transport. Nodes can be disconnected to exercise stalled
//! circuits and round timeouts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ark_ec::CurveGroup;
use ark_std::rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ProtocolError;
use crate::lifecycle::{EngineConfig, NodeContext, NodeRuntime, Transport};
use crate::message::Envelope;
use crate::session::SessionStore;
use crate::standard_registry;
use crate::topology::{Keypair, NodeId, Roster, RosterEntry};

/// In-memory mesh connecting every node of a roster.
pub struct LocalNetwork {
    peers: Mutex<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a node and returns its incoming edge.
    pub fn register(&self, id: NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers
            .lock()
            .expect("transport table poisoned")
            .insert(id, tx);
        rx
    }

    /// Cuts a node off the mesh; subsequent sends to it fail.
    pub fn disconnect(&self, id: NodeId) {
        self.peers
            .lock()
            .expect("transport table poisoned")
            .remove(&id);
    }
}

impl Transport for LocalNetwork {
    fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), ProtocolError> {
        // Round-trip the wire framing so local runs exercise the same
        // encoding a byte-oriented transport would.
        let bytes = envelope.encode()?;
        let envelope = Envelope::decode(&bytes)?;

        let peers = self.peers.lock().expect("transport table poisoned");
        let tx = peers
            .get(&to)
            .ok_or(ProtocolError::SendFailure { to })?;
        tx.send(envelope)
            .map_err(|_| ProtocolError::SendFailure { to })
    }
}

/// A fully wired local ring: one runtime, session store and listener task
/// per node, sharing one in-memory mesh.
pub struct LocalCluster<C: CurveGroup> {
    roster: Roster<C>,
    network: Arc<LocalNetwork>,
    runtimes: Vec<Arc<NodeRuntime<C>>>,
    stores: Vec<Arc<SessionStore<C>>>,
    listeners: Vec<JoinHandle<()>>,
}

impl<C: CurveGroup> LocalCluster<C> {
    /// Generates keypairs for `n` nodes and brings the whole ring up.
    pub fn start<R: RngCore>(
        n: usize,
        config: EngineConfig,
        rng: &mut R,
    ) -> Result<Self, ProtocolError> {
        let keypairs: Vec<Keypair<C>> = (0..n).map(|_| Keypair::generate(rng)).collect();
        let members = keypairs
            .iter()
            .enumerate()
            .map(|(i, keypair)| RosterEntry {
                id: NodeId(i as u32),
                public: keypair.public(),
            })
            .collect();
        let roster = Roster::new(members)?;

        let network = LocalNetwork::new();
        let mut runtimes = Vec::with_capacity(n);
        let mut stores = Vec::with_capacity(n);
        let mut listeners = Vec::with_capacity(n);

        for (i, keypair) in keypairs.into_iter().enumerate() {
            let id = NodeId(i as u32);
            let incoming = network.register(id);
            let transport: Arc<dyn Transport> = network.clone();
            let ctx = NodeContext::new(id, keypair, roster.clone(), transport)?;
            let store = SessionStore::new();
            let registry = Arc::new(standard_registry(store.clone(), config.clone()));
            let runtime = NodeRuntime::new(ctx, registry, config.clone());
            listeners.push(runtime.listen(incoming));
            runtimes.push(runtime);
            stores.push(store);
        }

        Ok(Self {
            roster,
            network,
            runtimes,
            stores,
            listeners,
        })
    }

    pub fn roster(&self) -> &Roster<C> {
        &self.roster
    }

    pub fn runtime(&self, index: usize) -> &Arc<NodeRuntime<C>> {
        &self.runtimes[index]
    }

    pub fn store(&self, index: usize) -> &Arc<SessionStore<C>> {
        &self.stores[index]
    }

    /// Cuts one node off mid-protocol.
    pub fn disconnect(&self, id: NodeId) {
        self.network.disconnect(id);
    }
}

impl<C: CurveGroup> Drop for LocalCluster<C> {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::message::SecretConfirm;
    use crate::session::{SessionId, SessionKind};
    use ark_bls12_381::G1Projective;

    #[tokio::test]
    async fn sends_to_a_disconnected_node_fail() {
        let network = LocalNetwork::new();
        let _rx = network.register(NodeId(0));
        let envelope = Envelope {
            protocol: "jvss".into(),
            instance: [0u8; 32],
            from: NodeId(1),
            payload: Payload::SecretConfirm(SecretConfirm {
                session: SessionId::fresh(SessionKind::LongTerm),
                node: 1,
                valid: true,
            }),
        };

        network.send(NodeId(0), envelope.clone()).unwrap();
        network.disconnect(NodeId(0));
        assert!(matches!(
            network.send(NodeId(0), envelope),
            Err(ProtocolError::SendFailure { to: NodeId(0) })
        ));
    }

    #[tokio::test]
    async fn cluster_brings_up_one_runtime_per_node() {
        let mut rng = ark_std::test_rng();
        let cluster =
            LocalCluster::<G1Projective>::start(3, EngineConfig::default(), &mut rng).unwrap();
        assert_eq!(cluster.roster().len(), 3);
        assert_eq!(cluster.runtime(2).context().local(), NodeId(2));
    }
}
