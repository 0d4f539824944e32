//! The Start/Dispatch state machine shared by every protocol on the tree.
//!
//! Each protocol instance occupies one task per node and makes progress by
//! blocking on its typed inbox. The initiator is the only node that runs
//! `start`; every node, initiator included, runs `dispatch`. A per-node
//! runtime demultiplexes incoming envelopes onto instances, instantiating
//! them through an explicit registry on first contact — there is no ambient
//! global protocol table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ark_ec::CurveGroup;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::message::{Envelope, InstanceId, Payload};
use crate::topology::{Keypair, NodeId, Roster};

/// Lifecycle states of one protocol instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Created,
    /// Entered by the initiator only, before its `start` runs.
    Started,
    Running,
    Completed,
    Failed,
}

/// Guarded lifecycle tracker embedded in every protocol instance.
#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Phase::Created,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    pub fn advance(&mut self, next: Phase) -> Result<(), ProtocolError> {
        let legal = matches!(
            (self.phase, next),
            (Phase::Created, Phase::Started)
                | (Phase::Created, Phase::Running)
                | (Phase::Started, Phase::Running)
                | (Phase::Started, Phase::Failed)
                | (Phase::Running, Phase::Completed)
                | (Phase::Running, Phase::Failed)
        );
        if !legal {
            return Err(ProtocolError::Configuration(format!(
                "illegal lifecycle transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        debug!(from = ?self.phase, to = ?next, "lifecycle transition");
        self.phase = next;
        Ok(())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one `dispatch` step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// The instance expects further messages.
    Continue,
    /// The instance has finished its part of the protocol.
    Done,
}

/// One protocol running on one node.
///
/// `start` executes exactly once, on the initiator only, and must validate
/// its inputs before sending anything. `dispatch` is the single per-node
/// handler; each call blocks on one typed message.
#[async_trait]
pub trait ProtocolInstance: Send {
    fn lifecycle_mut(&mut self) -> &mut Lifecycle;
    async fn start(&mut self) -> Result<(), ProtocolError>;
    async fn dispatch(&mut self) -> Result<Flow, ProtocolError>;
}

/// Directed send primitive. Delivery is assumed reliable, ordered and
/// exactly-once per directed edge; the engine adds no deduplication.
pub trait Transport: Send + Sync {
    fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), ProtocolError>;
}

/// Typed per-instance inbox with an associated round deadline.
///
/// The receive is the instance's suspension point; cancellation is the
/// deadline wrapping that receive.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    deadline: Duration,
}

impl Inbox {
    pub fn new(rx: mpsc::UnboundedReceiver<Envelope>, deadline: Duration) -> Self {
        Self { rx, deadline }
    }

    /// Waits for the next message, bounded by the round deadline.
    ///
    /// `Ok(None)` means the runtime tore the instance down.
    ///
    /// # Errors
    /// Returns `Timeout` when the deadline elapses first.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        match tokio::time::timeout(self.deadline, self.rx.recv()).await {
            Ok(message) => Ok(message),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Waits for the next message with no deadline, for instances that idle
    /// between rounds. Returns `None` when the runtime tore the inbox down.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}

/// Capability object handed to each protocol instance: identity, roster
/// position, key access and the directed send primitive. Instances hold
/// nothing beyond this context and their own round state.
pub struct NodeContext<C: CurveGroup> {
    local: NodeId,
    index: usize,
    successor: NodeId,
    keypair: Keypair<C>,
    roster: Roster<C>,
    transport: Arc<dyn Transport>,
}

impl<C: CurveGroup> NodeContext<C> {
    /// # Errors
    /// Returns a configuration error when `local` is not on the roster;
    /// this aborts before any network I/O.
    pub fn new(
        local: NodeId,
        keypair: Keypair<C>,
        roster: Roster<C>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, ProtocolError> {
        let index = roster.position(local).ok_or_else(|| {
            ProtocolError::Configuration(format!("{} is not part of the roster", local))
        })?;
        let successor = roster.successor_of(local)?;
        Ok(Arc::new(Self {
            local,
            index,
            successor,
            keypair,
            roster,
            transport,
        }))
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    /// Position of this node in the flattened tree list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The next node in the circuit, wrapping back to the first.
    pub fn successor(&self) -> NodeId {
        self.successor
    }

    pub fn roster(&self) -> &Roster<C> {
        &self.roster
    }

    pub fn secret_share(&self) -> &C::ScalarField {
        self.keypair.secret()
    }

    pub fn public_share(&self) -> C {
        self.keypair.public()
    }

    pub fn envelope(&self, protocol: &str, instance: InstanceId, payload: Payload) -> Envelope {
        Envelope {
            protocol: protocol.to_string(),
            instance,
            from: self.local,
            payload,
        }
    }

    /// Sends one envelope. Failures are logged and returned, never retried
    /// in place — recovery is restarting the round.
    pub fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), ProtocolError> {
        self.transport.send(to, envelope).map_err(|err| {
            warn!(%to, "had an error sending a message: {err}");
            err
        })
    }

    /// Sends `payload` to every roster member, the local node included.
    /// Self-delivery goes through the transport like any other edge.
    pub fn broadcast(
        &self,
        protocol: &str,
        instance: InstanceId,
        payload: Payload,
    ) -> Result<(), ProtocolError> {
        let mut first_failure = None;
        for entry in self.roster.iter() {
            let envelope = self.envelope(protocol, instance, payload.clone());
            if let Err(err) = self.send(entry.id, envelope) {
                first_failure.get_or_insert(err);
            }
        }
        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Constructor invoked when a message arrives for an instance that does not
/// exist yet on this node.
pub type Constructor<C> =
    Box<dyn Fn(Arc<NodeContext<C>>, InstanceId, Inbox) -> Box<dyn ProtocolInstance> + Send + Sync>;

/// Explicit protocol-name table, built once at process start and passed by
/// reference to whichever component instantiates protocols.
pub struct Registry<C: CurveGroup> {
    constructors: HashMap<String, Constructor<C>>,
}

impl<C: CurveGroup> Registry<C> {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: Constructor<C>) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn instantiate(
        &self,
        name: &str,
        ctx: Arc<NodeContext<C>>,
        instance: InstanceId,
        inbox: Inbox,
    ) -> Option<Box<dyn ProtocolInstance>> {
        self.constructors
            .get(name)
            .map(|constructor| constructor(ctx, instance, inbox))
    }
}

impl<C: CurveGroup> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine-wide knobs shared by both hosted protocols.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Deadline bounding every round; an expired round fails with `Timeout`.
    pub round_timeout: Duration,
    /// Coefficient count of the dealing polynomials. `None` means a simple
    /// majority of the roster.
    pub threshold: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(10),
            threshold: None,
        }
    }
}

impl EngineConfig {
    /// Resolves the dealing threshold against a roster of `n` nodes.
    pub fn threshold_for(&self, n: usize) -> usize {
        self.threshold.unwrap_or(n / 2 + 1)
    }
}

/// Per-node demultiplexer: one logical worker per protocol instance.
///
/// Envelopes coming off the transport are routed to the owning instance's
/// inbox; unknown instances are created through the registry and driven on
/// their own task. Finished instances are reaped from the table.
pub struct NodeRuntime<C: CurveGroup> {
    ctx: Arc<NodeContext<C>>,
    registry: Arc<Registry<C>>,
    config: EngineConfig,
    instances: Mutex<HashMap<InstanceId, mpsc::UnboundedSender<Envelope>>>,
}

impl<C: CurveGroup> NodeRuntime<C> {
    pub fn new(
        ctx: Arc<NodeContext<C>>,
        registry: Arc<Registry<C>>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry,
            config,
            instances: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<NodeContext<C>> {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Consumes the node's incoming edge of the transport.
    pub fn listen(self: &Arc<Self>, mut incoming: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            while let Some(envelope) = incoming.recv().await {
                runtime.route(envelope).await;
            }
        })
    }

    /// Registers an inbox for a locally initiated instance.
    pub async fn attach(&self, instance: InstanceId) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        self.instances.lock().await.insert(instance, tx);
        Inbox::new(rx, self.config.round_timeout)
    }

    /// Drives `instance` on its own task and reaps it when it finishes.
    pub fn launch(
        self: &Arc<Self>,
        instance_id: InstanceId,
        instance: Box<dyn ProtocolInstance>,
        initiate: bool,
    ) {
        let runtime = self.clone();
        tokio::spawn(async move {
            drive(instance, initiate).await;
            runtime.instances.lock().await.remove(&instance_id);
        });
    }

    async fn route(self: &Arc<Self>, envelope: Envelope) {
        let mut instances = self.instances.lock().await;
        if let Some(tx) = instances.get(&envelope.instance) {
            if tx.send(envelope).is_err() {
                // Receiver already gone; the reaper will drop the entry.
                debug!("dropping late message for finished instance");
            }
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let inbox = Inbox::new(rx, self.config.round_timeout);
        let instance = match self.registry.instantiate(
            &envelope.protocol,
            self.ctx.clone(),
            envelope.instance,
            inbox,
        ) {
            Some(instance) => instance,
            None => {
                debug!(protocol = %envelope.protocol, "dropping message for unknown protocol");
                return;
            }
        };

        let instance_id = envelope.instance;
        let _ = tx.send(envelope);
        instances.insert(instance_id, tx);
        drop(instances);
        self.launch(instance_id, instance, false);
    }
}

/// Runs one instance through its lifecycle.
pub(crate) async fn drive(mut instance: Box<dyn ProtocolInstance>, initiate: bool) {
    if initiate {
        if let Err(err) = instance.lifecycle_mut().advance(Phase::Started) {
            warn!("{err}");
            return;
        }
        if let Err(err) = instance.start().await {
            warn!("protocol start failed: {err}");
            let _ = instance.lifecycle_mut().advance(Phase::Failed);
            return;
        }
    }
    if let Err(err) = instance.lifecycle_mut().advance(Phase::Running) {
        warn!("{err}");
        return;
    }
    loop {
        match instance.dispatch().await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Done) => {
                let _ = instance.lifecycle_mut().advance(Phase::Completed);
                break;
            }
            Err(err) => {
                warn!("protocol round failed: {err}");
                let _ = instance.lifecycle_mut().advance(Phase::Failed);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_path_is_legal() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(Phase::Started).unwrap();
        lifecycle.advance(Phase::Running).unwrap();
        lifecycle.advance(Phase::Completed).unwrap();
        assert_eq!(lifecycle.phase(), Phase::Completed);
    }

    #[test]
    fn responder_skips_started() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(Phase::Running).unwrap();
        lifecycle.advance(Phase::Failed).unwrap();
        assert_eq!(lifecycle.phase(), Phase::Failed);
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(Phase::Running).unwrap();
        lifecycle.advance(Phase::Completed).unwrap();
        assert!(lifecycle.advance(Phase::Running).is_err());

        let mut lifecycle = Lifecycle::new();
        assert!(lifecycle.advance(Phase::Completed).is_err());
    }

    #[tokio::test]
    async fn inbox_deadline_fails_with_timeout() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut inbox = Inbox::new(rx, Duration::from_millis(20));
        assert!(matches!(inbox.recv().await, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn closed_inbox_reads_as_teardown() {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        drop(tx);
        let mut inbox = Inbox::new(rx, Duration::from_millis(20));
        assert!(matches!(inbox.recv().await, Ok(None)));
        assert!(inbox.next().await.is_none());
    }
}
