//! Joint threshold Schnorr signing over the ring.
//!
//! One signer instance per node anchors a long-term shared secret; every
//! signing round establishes a fresh short-term secret whose joint
//! commitment becomes the round's Schnorr nonce. A node's partial signature
//! folds its Lagrange weight into `r + c * x`, so the initiator aggregates
//! by plain scalar addition once all roster members have answered. The
//! short-term session is discarded when the round ends, whatever the
//! outcome, which keeps rounds over the same long-term key unlinkable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ark_ec::{CurveGroup, PrimeGroup};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::rand::rngs::StdRng;
use ark_std::rand::SeedableRng;
use ark_std::Zero;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::lifecycle::{
    Flow, Inbox, Lifecycle, NodeContext, NodeRuntime, ProtocolInstance,
};
use crate::message::{
    Envelope, InstanceId, Payload, SecretConfirm, SecretInit, SigRequest, SigResponse,
};
use crate::session::{verify_subshare, Dealer, Secret, SessionId, SessionKind, SessionStore};
use crate::topology::NodeId;
use crate::utils::{from_bytes, hash_to_scalar, lagrange_weight_at_zero, random_id, to_bytes};

/// Registry name of the signing protocol.
pub const PROTOCOL_JVSS: &str = "jvss";

const CHALLENGE_DOMAIN: &[u8] = b"threshold-circuit/schnorr-challenge";

/// Aggregate Schnorr-style signature.
#[derive(Clone, Debug, PartialEq, Eq, CanonicalSerialize, CanonicalDeserialize)]
pub struct Signature<C: CurveGroup> {
    /// Joint commitment of the round's short-term session.
    pub random_commitment: C,
    /// Aggregated response scalar.
    pub sigma: C::ScalarField,
}

fn challenge<C: CurveGroup>(
    random_commitment: &C,
    public_key: &C,
    message: &[u8],
) -> Result<C::ScalarField, ProtocolError> {
    let commitment_bytes = to_bytes(random_commitment)?;
    let key_bytes = to_bytes(public_key)?;
    Ok(hash_to_scalar(
        CHALLENGE_DOMAIN,
        &[&commitment_bytes, &key_bytes, message],
    ))
}

/// Checks the defining Schnorr equation `sigma * G == R + c * P`.
///
/// # Errors
/// Returns `SignatureInvalid` on any mismatch.
pub fn verify<C: CurveGroup>(
    public_key: &C,
    message: &[u8],
    signature: &Signature<C>,
) -> Result<(), ProtocolError> {
    let c = challenge(&signature.random_commitment, public_key, message)?;
    if C::generator() * signature.sigma == signature.random_commitment + *public_key * c {
        Ok(())
    } else {
        Err(ProtocolError::SignatureInvalid)
    }
}

enum SignerCommand<C: CurveGroup> {
    Sign {
        message: Vec<u8>,
        reply: oneshot::Sender<Result<Signature<C>, ProtocolError>>,
    },
    PublicKey {
        reply: oneshot::Sender<Result<C, ProtocolError>>,
    },
}

/// Initiator-side handle to a running signer instance.
///
/// Calls are synchronous to the caller: they block until the instance
/// answers on the feedback channel or the round deadline elapses.
pub struct SignerHandle<C: CurveGroup> {
    commands: mpsc::UnboundedSender<SignerCommand<C>>,
    round_timeout: Duration,
}

impl<C: CurveGroup> Clone for SignerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            round_timeout: self.round_timeout,
        }
    }
}

impl<C: CurveGroup> SignerHandle<C> {
    /// Runs one signing round over `message`.
    ///
    /// # Errors
    /// `Timeout` when the round does not complete within the deadline;
    /// `ShareMismatch` when secret sharing aborted the round.
    pub async fn sign(&self, message: &[u8]) -> Result<Signature<C>, ProtocolError> {
        let (reply, feedback) = oneshot::channel();
        self.commands
            .send(SignerCommand::Sign {
                message: message.to_vec(),
                reply,
            })
            .map_err(|_| ProtocolError::Configuration("signer instance is gone".into()))?;
        match tokio::time::timeout(self.round_timeout, feedback).await {
            Ok(Ok(result)) => result,
            // The instance dropped the round without answering.
            Ok(Err(_)) => Err(ProtocolError::Timeout),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// The joint public key of the anchoring long-term session.
    ///
    /// # Errors
    /// `NotFound` while the long-term session is still being established.
    pub async fn public_key(&self) -> Result<C, ProtocolError> {
        let (reply, feedback) = oneshot::channel();
        self.commands
            .send(SignerCommand::PublicKey { reply })
            .map_err(|_| ProtocolError::Configuration("signer instance is gone".into()))?;
        match tokio::time::timeout(self.round_timeout, feedback).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ProtocolError::Timeout),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Verifies `signature` against the instance's joint public key.
    pub async fn verify(
        &self,
        message: &[u8],
        signature: &Signature<C>,
    ) -> Result<(), ProtocolError> {
        let public_key = self.public_key().await?;
        verify(&public_key, message, signature)
    }
}

/// Joint dealing state for one session on one node.
struct SessionBuild<C: CurveGroup> {
    dealt: bool,
    share_sum: C::ScalarField,
    commitment_sum: C,
    dealers: HashSet<u32>,
    confirms: HashSet<u32>,
    established: bool,
    failed: bool,
}

impl<C: CurveGroup> SessionBuild<C> {
    fn new() -> Self {
        Self {
            dealt: false,
            share_sum: C::ScalarField::zero(),
            commitment_sum: C::zero(),
            dealers: HashSet::new(),
            confirms: HashSet::new(),
            established: false,
            failed: false,
        }
    }
}

/// Initiator-side state of one signing round.
struct SignRound<C: CurveGroup> {
    partials: HashMap<u32, C::ScalarField>,
    reply: Option<oneshot::Sender<Result<Signature<C>, ProtocolError>>>,
}

/// A signature request waiting for its sessions to be established.
struct PendingRequest {
    initiator: NodeId,
    message: Vec<u8>,
    responded: bool,
}

/// The JVSS protocol instance running on one node.
pub struct JvssProtocol<C: CurveGroup> {
    ctx: Arc<NodeContext<C>>,
    instance: InstanceId,
    lifecycle: Lifecycle,
    store: Arc<SessionStore<C>>,
    threshold: usize,
    inbox: Inbox,
    commands: Option<mpsc::UnboundedReceiver<SignerCommand<C>>>,
    long_term: Option<SessionId>,
    long_term_failure: Option<ProtocolError>,
    builds: HashMap<SessionId, SessionBuild<C>>,
    rounds: HashMap<SessionId, SignRound<C>>,
    pending: HashMap<SessionId, PendingRequest>,
}

enum Event<C: CurveGroup> {
    Message(Option<Envelope>),
    Command(Option<SignerCommand<C>>),
}

impl<C: CurveGroup> JvssProtocol<C> {
    /// Builds the responder side, invoked by the registry on first contact.
    pub fn responder(
        ctx: Arc<NodeContext<C>>,
        instance: InstanceId,
        inbox: Inbox,
        store: Arc<SessionStore<C>>,
        threshold: usize,
    ) -> Self {
        Self {
            ctx,
            instance,
            lifecycle: Lifecycle::new(),
            store,
            threshold,
            inbox,
            commands: None,
            long_term: None,
            long_term_failure: None,
            builds: HashMap::new(),
            rounds: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Starts a signer instance on the local node, which becomes the
    /// initiator of the long-term session and of every signing round.
    pub async fn initiate(
        runtime: &Arc<NodeRuntime<C>>,
        store: Arc<SessionStore<C>>,
    ) -> Result<SignerHandle<C>, ProtocolError> {
        let instance = random_id();
        let inbox = runtime.attach(instance).await;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let threshold = runtime
            .config()
            .threshold_for(runtime.context().roster().len());

        let mut protocol = Self::responder(
            runtime.context().clone(),
            instance,
            inbox,
            store,
            threshold,
        );
        protocol.commands = Some(command_rx);
        runtime.launch(instance, Box::new(protocol), true);

        Ok(SignerHandle {
            commands: command_tx,
            round_timeout: runtime.config().round_timeout,
        })
    }

    /// Deals this node's polynomial for `session`, once.
    fn deal(&mut self, session: SessionId) -> Result<(), ProtocolError> {
        let build = self.builds.entry(session).or_insert_with(SessionBuild::new);
        if build.dealt {
            return Ok(());
        }
        build.dealt = true;

        let mut rng = StdRng::from_entropy();
        let dealer = Dealer::<C>::new(self.threshold, &mut rng)?;
        let commitments: Vec<Vec<u8>> = dealer
            .commitments()
            .iter()
            .map(to_bytes)
            .collect::<Result<_, _>>()?;

        let recipients: Vec<NodeId> = self.ctx.roster().iter().map(|entry| entry.id).collect();
        for (j, to) in recipients.iter().enumerate() {
            let subshare = to_bytes(&dealer.subshare(j + 1)?)?;
            let payload = Payload::SecretInit(SecretInit {
                session,
                dealer: self.ctx.index() as u32,
                commitments: commitments.clone(),
                subshare,
            });
            let envelope = self.ctx.envelope(PROTOCOL_JVSS, self.instance, payload);
            self.ctx.send(*to, envelope)?;
        }
        Ok(())
    }

    async fn on_secret_init(&mut self, init: SecretInit) -> Result<(), ProtocolError> {
        let session = init.session;
        if session.is_long_term() {
            match self.long_term {
                None => self.long_term = Some(session),
                Some(anchor) if anchor != session => {
                    debug!(%session, "ignoring deal for a foreign long-term session");
                    return Ok(());
                }
                _ => {}
            }
        }

        // Contribute our own dealing before processing the incoming one.
        self.deal(session)?;

        let commitments: Vec<C> = init
            .commitments
            .iter()
            .map(|bytes| from_bytes(bytes))
            .collect::<Result<_, _>>()?;
        let subshare: C::ScalarField = from_bytes(&init.subshare)?;

        let valid = verify_subshare(self.ctx.index() + 1, &subshare, &commitments);
        if !valid {
            warn!(%session, dealer = init.dealer, "subshare contradicts its commitments");
            let payload = Payload::SecretConfirm(SecretConfirm {
                session,
                node: self.ctx.index() as u32,
                valid: false,
            });
            let _ = self.ctx.broadcast(PROTOCOL_JVSS, self.instance, payload);
            self.fail_session(session, init.dealer).await;
            return Ok(());
        }

        let n = self.ctx.roster().len();
        let confirm = {
            let build = self.builds.entry(session).or_insert_with(SessionBuild::new);
            if build.failed || build.established {
                return Ok(());
            }
            let fresh = build.dealers.insert(init.dealer);
            if fresh {
                build.share_sum += subshare;
                build.commitment_sum += commitments[0];
            }
            fresh && build.dealers.len() == n
        };

        if confirm {
            let payload = Payload::SecretConfirm(SecretConfirm {
                session,
                node: self.ctx.index() as u32,
                valid: true,
            });
            self.ctx.broadcast(PROTOCOL_JVSS, self.instance, payload)?;
        }
        self.try_establish(session).await
    }

    async fn on_secret_confirm(&mut self, confirm: SecretConfirm) -> Result<(), ProtocolError> {
        let session = confirm.session;
        if !confirm.valid {
            self.fail_session(session, confirm.node).await;
            return Ok(());
        }
        {
            let build = self.builds.entry(session).or_insert_with(SessionBuild::new);
            if build.failed || build.established {
                return Ok(());
            }
            build.confirms.insert(confirm.node);
        }
        self.try_establish(session).await
    }

    /// Completes the session once every dealer contributed and every node
    /// confirmed, then serves whatever was waiting on it.
    async fn try_establish(&mut self, session: SessionId) -> Result<(), ProtocolError> {
        let n = self.ctx.roster().len();
        let completed = {
            let Some(build) = self.builds.get_mut(&session) else {
                return Ok(());
            };
            if build.failed
                || build.established
                || build.dealers.len() < n
                || build.confirms.len() < n
            {
                return Ok(());
            }
            build.established = true;
            (build.share_sum, build.commitment_sum)
        };

        self.store
            .complete(session, Secret::new(completed.0, completed.1))
            .await;
        info!(node = %self.ctx.local(), %session, "shared secret established");

        if session.is_short_term() {
            self.try_respond(session).await?;
        } else {
            // The anchor is ready; flush requests that were waiting on it.
            let waiting: Vec<SessionId> = self.pending.keys().copied().collect();
            for pending in waiting {
                self.try_respond(pending).await?;
            }
        }
        Ok(())
    }

    /// Marks `session` failed and aborts anything that depended on it.
    async fn fail_session(&mut self, session: SessionId, dealer: u32) {
        self.builds
            .entry(session)
            .or_insert_with(SessionBuild::new)
            .failed = true;
        let err = ProtocolError::ShareMismatch { session, dealer };
        if Some(session) == self.long_term {
            self.long_term_failure = Some(err.clone());
            let open: Vec<SessionId> = self.rounds.keys().copied().collect();
            for round in open {
                self.fail_round(round, err.clone());
            }
        } else {
            self.fail_round(session, err);
            self.pending.remove(&session);
            self.store.discard(session).await;
        }
    }

    fn fail_round(&mut self, session: SessionId, err: ProtocolError) {
        if let Some(mut round) = self.rounds.remove(&session) {
            if let Some(reply) = round.reply.take() {
                let _ = reply.send(Err(err));
            }
        }
    }

    async fn on_sig_request(&mut self, from: NodeId, request: SigRequest) -> Result<(), ProtocolError> {
        self.pending
            .entry(request.session)
            .or_insert(PendingRequest {
                initiator: from,
                message: request.message,
                responded: false,
            });
        self.try_respond(request.session).await
    }

    /// Computes and sends this node's partial signature once both the
    /// anchoring and the round's sessions are established locally.
    async fn try_respond(&mut self, session: SessionId) -> Result<(), ProtocolError> {
        let Some(pending) = self.pending.get(&session) else {
            return Ok(());
        };
        if pending.responded {
            return Ok(());
        }
        let Some(long_term) = self.long_term else {
            return Ok(());
        };
        let Ok(anchor) = self.store.secret(long_term).await else {
            return Ok(());
        };
        let Ok(nonce) = self.store.secret(session).await else {
            return Ok(());
        };

        let c = challenge(&nonce.commitment(), &anchor.commitment(), &pending.message)?;
        let weight = lagrange_weight_at_zero::<C::ScalarField>(
            self.ctx.roster().len(),
            self.ctx.index() + 1,
        );
        let partial = weight * (*nonce.share() + c * *anchor.share());

        let initiator = pending.initiator;
        let payload = Payload::SigResponse(SigResponse {
            session,
            node: self.ctx.index() as u32,
            partial: to_bytes(&partial)?,
        });
        let envelope = self.ctx.envelope(PROTOCOL_JVSS, self.instance, payload);
        self.ctx.send(initiator, envelope)?;
        debug!(node = %self.ctx.local(), %session, "sent partial signature");

        if let Some(pending) = self.pending.get_mut(&session) {
            pending.responded = true;
        }

        // The nonce is single use. The round's initiator still needs it for
        // aggregation; everyone else drops it right away.
        if !self.rounds.contains_key(&session) {
            self.store.discard(session).await;
            self.pending.remove(&session);
            self.builds.remove(&session);
        }
        Ok(())
    }

    async fn on_sig_response(&mut self, response: SigResponse) -> Result<(), ProtocolError> {
        let n = self.ctx.roster().len();
        let complete = {
            let Some(round) = self.rounds.get_mut(&response.session) else {
                debug!(session = %response.session, "partial for an unknown round");
                return Ok(());
            };
            let partial: C::ScalarField = from_bytes(&response.partial)?;
            round.partials.insert(response.node, partial);
            round.partials.len() == n
        };
        if !complete {
            return Ok(());
        }

        let nonce = self.store.secret(response.session).await?;
        let Some(mut round) = self.rounds.remove(&response.session) else {
            return Ok(());
        };
        let mut sigma = C::ScalarField::zero();
        for partial in round.partials.values() {
            sigma += *partial;
        }
        let signature = Signature {
            random_commitment: nonce.commitment(),
            sigma,
        };
        if let Some(reply) = round.reply.take() {
            let _ = reply.send(Ok(signature));
        }
        info!(node = %self.ctx.local(), session = %response.session, "signature round completed");

        self.store.discard(response.session).await;
        self.pending.remove(&response.session);
        self.builds.remove(&response.session);
        Ok(())
    }

    async fn on_command(&mut self, command: SignerCommand<C>) -> Result<(), ProtocolError> {
        match command {
            SignerCommand::Sign { message, reply } => {
                if let Some(err) = &self.long_term_failure {
                    let _ = reply.send(Err(err.clone()));
                    return Ok(());
                }
                let session = SessionId::fresh(SessionKind::ShortTerm);
                self.rounds.insert(
                    session,
                    SignRound {
                        partials: HashMap::new(),
                        reply: Some(reply),
                    },
                );
                info!(node = %self.ctx.local(), %session, "started a signing round");
                if let Err(err) = self.deal(session) {
                    self.fail_round(session, err);
                    return Ok(());
                }
                let payload = Payload::SigRequest(SigRequest { session, message });
                if let Err(err) = self.ctx.broadcast(PROTOCOL_JVSS, self.instance, payload) {
                    self.fail_round(session, err);
                }
                Ok(())
            }
            SignerCommand::PublicKey { reply } => {
                let result = match self.long_term {
                    Some(long_term) => self
                        .store
                        .secret(long_term)
                        .await
                        .map(|secret| secret.commitment()),
                    None => Err(ProtocolError::Configuration(
                        "no long-term session anchored yet".into(),
                    )),
                };
                let _ = reply.send(result);
                Ok(())
            }
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
        match envelope.payload {
            Payload::SecretInit(init) => self.on_secret_init(init).await,
            Payload::SecretConfirm(confirm) => self.on_secret_confirm(confirm).await,
            Payload::SigRequest(request) => self.on_sig_request(envelope.from, request).await,
            Payload::SigResponse(response) => self.on_sig_response(response).await,
            other => {
                debug!(payload = ?other, "unexpected payload for signing protocol");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl<C: CurveGroup> ProtocolInstance for JvssProtocol<C> {
    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    /// Anchors the long-term session. Runs on the initiator only.
    async fn start(&mut self) -> Result<(), ProtocolError> {
        let session = SessionId::fresh(SessionKind::LongTerm);
        self.long_term = Some(session);
        info!(node = %self.ctx.local(), %session, "started a joint secret sharing");
        self.deal(session)
    }

    /// Handles one message or one initiator command. The instance idles
    /// between rounds; round deadlines live with the blocked callers.
    async fn dispatch(&mut self) -> Result<Flow, ProtocolError> {
        let event: Event<C> = match self.commands.as_mut() {
            Some(commands) => tokio::select! {
                envelope = self.inbox.next() => Event::Message(envelope),
                command = commands.recv() => Event::Command(command),
            },
            None => Event::Message(self.inbox.next().await),
        };

        match event {
            Event::Message(None) => Ok(Flow::Done),
            Event::Message(Some(envelope)) => {
                self.on_envelope(envelope).await?;
                Ok(Flow::Continue)
            }
            Event::Command(None) => {
                // The handle is gone; keep serving the ring.
                self.commands = None;
                Ok(Flow::Continue)
            }
            Event::Command(Some(command)) => {
                self.on_command(command).await?;
                Ok(Flow::Continue)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::EngineConfig;
    use crate::local::LocalCluster;
    use ark_bls12_381::G1Projective;

    async fn signing_cluster(
        n: usize,
    ) -> (LocalCluster<G1Projective>, SignerHandle<G1Projective>) {
        let mut rng = ark_std::test_rng();
        let cluster = LocalCluster::start(n, EngineConfig::default(), &mut rng).unwrap();
        let handle = JvssProtocol::initiate(cluster.runtime(0), cluster.store(0).clone())
            .await
            .unwrap();
        (cluster, handle)
    }

    #[tokio::test]
    async fn signs_and_verifies_over_a_five_node_ring() {
        let (_cluster, handle) = signing_cluster(5).await;
        let message = b"Hello world";

        let signature = handle.sign(message).await.unwrap();
        let public_key = handle.public_key().await.unwrap();
        verify(&public_key, message, &signature).unwrap();
    }

    #[tokio::test]
    async fn flipped_message_byte_fails_verification() {
        let (_cluster, handle) = signing_cluster(5).await;
        let message = b"Hello world".to_vec();

        let signature = handle.sign(&message).await.unwrap();
        let public_key = handle.public_key().await.unwrap();

        let mut tampered = message.clone();
        tampered[0] ^= 0x01;
        assert!(matches!(
            verify(&public_key, &tampered, &signature),
            Err(ProtocolError::SignatureInvalid)
        ));
        verify(&public_key, &message, &signature).unwrap();
    }

    #[tokio::test]
    async fn rounds_use_independent_short_term_sessions() {
        let (_cluster, handle) = signing_cluster(5).await;

        let first = handle.sign(b"first message").await.unwrap();
        let second = handle.sign(b"second message").await.unwrap();

        assert_ne!(first.sigma, second.sigma);
        assert_ne!(first.random_commitment, second.random_commitment);
    }

    #[tokio::test]
    async fn concurrent_rounds_share_the_anchor_without_leakage() {
        let (_cluster, handle) = signing_cluster(5).await;
        let other = handle.clone();

        let (first, second) = tokio::join!(other.sign(b"round one"), handle.sign(b"round two"));
        let first = first.unwrap();
        let second = second.unwrap();

        let public_key = handle.public_key().await.unwrap();
        verify(&public_key, b"round one", &first).unwrap();
        verify(&public_key, b"round two", &second).unwrap();
        assert_ne!(first.random_commitment, second.random_commitment);
    }

    #[tokio::test]
    async fn signature_survives_wire_marshaling() {
        let (_cluster, handle) = signing_cluster(3).await;
        let signature = handle.sign(b"persist me").await.unwrap();

        let bytes = to_bytes(&signature).unwrap();
        let restored: Signature<G1Projective> = from_bytes(&bytes).unwrap();
        assert_eq!(signature, restored);
    }
}
