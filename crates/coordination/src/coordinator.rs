//! The coordinator controller: one task that serializes every round.
//!
//! External create/disputable/unanimous requests and a periodic drain tick
//! all land on the same dispatcher, and every handler runs to completion
//! before the next event is looked at, so at most one round of any kind is
//! ever in flight.

use crate::config::CoordinatorConfig;
use crate::driver::{UnanimousHandles, VmDriver};
use crate::error::CoordinationError;
use crate::manager::{ClientManager, ClientManagerHandle, LabeledResponse};
use crate::queue::{MessageQueue, QueueHandle};
use crate::server::FollowerListener;
use crate::types::{
    CreateVmRequest, OffchainMessage, VmId, FINAL_SEQUENCE_NUMBER,
};
use crate::validators::ValidatorSet;
use crate::wire::{FollowerVote, LeaderRequest, UnanimousSignatureRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tokio_rustls::TlsAcceptor;
use validator_keys::{Hash32, PrivateKey, RecoverableSignature};

enum CoordinatorCommand {
    CreateVm {
        limit: Duration,
        reply: oneshot::Sender<Result<bool, CoordinationError>>,
    },
    DisputableAssertion {
        reply: oneshot::Sender<bool>,
    },
    UnanimousAssertion {
        force_final: bool,
        reply: oneshot::Sender<Result<bool, CoordinationError>>,
    },
}

/// Public access to a running coordinator.
///
/// `new` spawns the manager, queue, and controller tasks; `serve` binds the
/// TLS listener and starts admitting followers. Every request method hands a
/// command to the controller and returns a one-shot receiver for its
/// outcome.
pub struct ValidatorCoordinator {
    vm_id: VmId,
    commands: mpsc::Sender<CoordinatorCommand>,
    queue: QueueHandle,
    manager: ClientManagerHandle,
    key: PrivateKey,
    validators: Arc<ValidatorSet>,
    config: CoordinatorConfig,
}

impl ValidatorCoordinator {
    /// Build a coordinator for `validators` and spawn its tasks. Must be
    /// called inside a tokio runtime.
    pub fn new<D: VmDriver>(
        key: PrivateKey,
        driver: Arc<D>,
        validators: ValidatorSet,
        config: CoordinatorConfig,
    ) -> Self {
        assert!(
            config.ping_period < config.pong_wait,
            "ping period must stay under the liveness deadline"
        );
        let vm_id = VmId::random();
        let validators = Arc::new(validators);
        let (manager, manager_task) =
            ClientManager::new(validators.remote_count(), config.gather_timeout);
        let (queue, queue_task) = MessageQueue::new();
        let (commands, command_rx) = mpsc::channel(16);
        let controller = Controller {
            commands: command_rx,
            manager: manager.clone(),
            queue: queue.clone(),
            driver,
            key: key.clone(),
            vm_id,
            validators: validators.clone(),
            config: config.clone(),
        };
        tokio::spawn(manager_task.run());
        tokio::spawn(queue_task.run());
        tokio::spawn(controller.run());
        Self {
            vm_id,
            commands,
            queue,
            manager,
            key,
            validators,
            config,
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Bind the TLS listener and start admitting followers.
    pub async fn serve(&self, acceptor: TlsAcceptor) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!(addr = %self.config.listen_addr, "listening for followers");
        let follower_listener = FollowerListener::new(
            self.key.clone(),
            self.vm_id,
            self.validators.clone(),
            self.manager.clone(),
            self.config.clone(),
        );
        tokio::spawn(follower_listener.run(listener, acceptor));
        Ok(())
    }

    /// Queue an off-chain message for the next unanimous round.
    pub async fn send_message(&self, message: OffchainMessage) {
        self.queue.send(message).await;
    }

    /// Create the VM on chain once every follower has connected.
    pub async fn create_vm(
        &self,
        limit: Duration,
    ) -> oneshot::Receiver<Result<bool, CoordinationError>> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .commands
            .send(CoordinatorCommand::CreateVm { limit, reply })
            .await;
        receiver
    }

    /// Make a disputable assertion; resolves true on success.
    pub async fn initiate_disputable_assertion(&self) -> oneshot::Receiver<bool> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .commands
            .send(CoordinatorCommand::DisputableAssertion { reply })
            .await;
        receiver
    }

    /// Run a unanimous round over the queued messages.
    pub async fn initiate_unanimous_assertion(
        &self,
        force_final: bool,
    ) -> oneshot::Receiver<Result<bool, CoordinationError>> {
        let (reply, receiver) = oneshot::channel();
        let _ = self
            .commands
            .send(CoordinatorCommand::UnanimousAssertion { force_final, reply })
            .await;
        receiver
    }

    #[cfg(test)]
    pub(crate) fn manager_handle(&self) -> ClientManagerHandle {
        self.manager.clone()
    }

    #[cfg(test)]
    pub(crate) fn queue_handle(&self) -> QueueHandle {
        self.queue.clone()
    }
}

struct Controller<D: VmDriver> {
    commands: mpsc::Receiver<CoordinatorCommand>,
    manager: ClientManagerHandle,
    queue: QueueHandle,
    driver: Arc<D>,
    key: PrivateKey,
    vm_id: VmId,
    validators: Arc<ValidatorSet>,
    config: CoordinatorConfig,
}

impl<D: VmDriver> Controller<D> {
    async fn run(mut self) {
        let mut tick = interval_at(
            TokioInstant::now() + self.config.tick_interval,
            self.config.tick_interval,
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending_for_processing = false;
        loop {
            tokio::select! {
                maybe = self.commands.recv() => match maybe {
                    None => break,
                    Some(CoordinatorCommand::CreateVm { limit, reply }) => {
                        let _ = reply.send(self.create_vm(limit).await);
                    }
                    Some(CoordinatorCommand::DisputableAssertion { reply }) => {
                        let _ = reply.send(self.disputable_assertion().await);
                    }
                    Some(CoordinatorCommand::UnanimousAssertion { force_final, reply }) => {
                        let result = self.unanimous_assertion(force_final).await;
                        if result.is_ok() {
                            pending_for_processing = false;
                        }
                        let _ = reply.send(result);
                    }
                },
                _ = tick.tick() => {
                    pending_for_processing = self.drain_tick(pending_for_processing).await;
                }
            }
        }
    }

    /// Idle drain policy: pending on-chain messages force a final round and
    /// schedule a follow-up drain; otherwise queued off-chain traffic is
    /// batched into an ordinary round.
    async fn drain_tick(&self, pending_for_processing: bool) -> bool {
        if self.driver.has_pending_messages().await.unwrap_or(false) {
            if let Err(err) = self.unanimous_assertion(true).await {
                tracing::warn!(%err, "forced unanimous round failed");
            }
            true
        } else if self.queue.has_messages().await || pending_for_processing {
            if let Err(err) = self.unanimous_assertion(false).await {
                tracing::warn!(%err, "unanimous round failed");
            }
            false
        } else {
            pending_for_processing
        }
    }

    async fn create_vm(&self, limit: Duration) -> Result<bool, CoordinationError> {
        if !self.manager.wait_for_followers(limit).await {
            return Err(CoordinationError::NotAllValidatorsConnected);
        }
        let state = self
            .driver
            .request_vm_state()
            .await
            .map_err(|_| CoordinationError::DriverClosed)?;
        let request = CreateVmRequest {
            config: state.config,
            vm_id: self.vm_id,
            vm_state: state.machine_state,
            challenge_manager: 0,
        };
        let digest = request.digest();
        let responses = self
            .manager
            .gather_signatures(LeaderRequest::Create(request.clone()), digest)
            .await;

        let outcome = self.assemble_create_signatures(&digest, &responses);
        self.manager
            .broadcast(LeaderRequest::CreateNotification {
                approved: outcome.is_ok(),
            })
            .await;
        let signatures = outcome?;
        self.driver.create_vm(&request, signatures)?;
        tracing::info!(vm = %hex::encode(self.vm_id.as_bytes()), "created VM with a full quorum");
        Ok(true)
    }

    fn assemble_create_signatures(
        &self,
        digest: &Hash32,
        responses: &[LabeledResponse],
    ) -> Result<Vec<RecoverableSignature>, CoordinationError> {
        if responses.len() != self.validators.remote_count() {
            return Err(CoordinationError::MissingResponses);
        }
        let mut slots: Vec<Option<RecoverableSignature>> = vec![None; self.validators.count()];
        slots[self.validators.own_index()] = Some(self.key.sign_digest(digest)?);
        for labeled in responses {
            let FollowerVote::Create {
                accepted,
                signature,
            } = &labeled.response.vote
            else {
                return Err(CoordinationError::ValidatorRefused);
            };
            if !*accepted {
                return Err(CoordinationError::ValidatorRefused);
            }
            let signature = signature.clone().ok_or(CoordinationError::ValidatorRefused)?;
            let index = self
                .validators
                .index_of(&labeled.address)
                .ok_or(CoordinationError::UnknownValidator)?;
            slots[index] = Some(signature);
        }
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(CoordinationError::MissingResponses)
    }

    async fn disputable_assertion(&self) -> bool {
        let started = Instant::now();
        let made = self
            .driver
            .request_disputable_assertion(self.config.max_assertion_steps, false)
            .await
            .unwrap_or(false);
        if made {
            tracing::info!(elapsed = ?started.elapsed(), "made disputable assertion");
        } else {
            tracing::warn!("disputable assertion failed");
        }
        made
    }

    /// Drain the queue, run one unanimous round, and settle the channel if
    /// the round came out final. A round that fails before confirmation puts
    /// the drained batch back.
    async fn unanimous_assertion(&self, force_final: bool) -> Result<bool, CoordinationError> {
        let batch = self.queue.fetch().await;
        match self.run_unanimous_round(&batch, force_final).await {
            Err(err) => {
                self.queue.return_batch(batch).await;
                Err(err)
            }
            Ok(false) => {
                tracing::debug!("keeping the unanimous assertion channel open");
                Ok(true)
            }
            Ok(true) => {
                tracing::info!("closing the unanimous assertion channel");
                let closed = self
                    .driver
                    .close_unanimous_assertion()
                    .await
                    .unwrap_or(false);
                if closed {
                    tracing::info!("unanimous channel closed");
                } else {
                    tracing::warn!("failed to close the unanimous channel");
                }
                Ok(closed)
            }
        }
    }

    /// Runs one unanimous round to confirmation; resolves to whether the
    /// round was final.
    async fn run_unanimous_round(
        &self,
        batch: &[OffchainMessage],
        force_final: bool,
    ) -> Result<bool, CoordinationError> {
        let messages: Vec<_> = batch.iter().map(|m| m.message.clone()).collect();
        let UnanimousHandles {
            request,
            results,
            mut errors,
        } = self
            .driver
            .initiate_unanimous_request(self.config.max_assertion_steps, messages, force_final);

        let request = tokio::select! {
            request = request => match request {
                Ok(request) => request,
                Err(_) => return Err(take_driver_error(&mut errors)),
            },
            Some(err) = errors.recv() => return Err(err.into()),
        };

        let signed_messages: Vec<OffchainMessage> = request
            .new_messages
            .iter()
            .zip(batch)
            .map(|(message, original)| OffchainMessage {
                message: message.clone(),
                signature: original.signature.clone(),
            })
            .collect();
        let round_id = request.data.digest();

        // Collect follower signatures while the driver finishes computing
        // the round.
        let gather = {
            let manager = self.manager.clone();
            let signature_request = LeaderRequest::Unanimous {
                request_id: round_id,
                request: UnanimousSignatureRequest {
                    before_hash: request.data.before_hash,
                    before_inbox: request.data.before_inbox,
                    sequence_num: request.data.sequence_num,
                    time_bounds: request.data.time_bounds,
                    signed_messages,
                },
            };
            tokio::spawn(async move { manager.gather_signatures(signature_request, round_id).await })
        };

        let mut update = tokio::select! {
            results = results => match results {
                Ok(update) => update,
                Err(_) => {
                    let err = take_driver_error(&mut errors);
                    self.notify_unanimous(round_id, false, Vec::new()).await;
                    return Err(err);
                }
            },
            Some(err) = errors.recv() => {
                self.notify_unanimous(round_id, false, Vec::new()).await;
                return Err(err.into());
            }
        };

        // Outgoing messages leave the channel, so this round must settle on
        // chain: mark it as the last in the channel.
        if !update.assertion.out_msgs.is_empty() {
            update.sequence_num = FINAL_SEQUENCE_NUMBER;
        }
        let assertion_digest = update.assertion_digest();
        let own_signature = match self.key.sign_digest(&assertion_digest) {
            Ok(signature) => signature,
            Err(err) => {
                self.notify_unanimous(round_id, false, Vec::new()).await;
                return Err(err.into());
            }
        };

        let responses = match gather.await {
            Ok(responses) => responses,
            Err(_) => {
                self.notify_unanimous(round_id, false, Vec::new()).await;
                return Err(CoordinationError::MissingResponses);
            }
        };
        let signatures = match self.assemble_unanimous_signatures(
            &assertion_digest,
            own_signature,
            &responses,
        ) {
            Ok(signatures) => signatures,
            Err(err) => {
                self.notify_unanimous(round_id, false, Vec::new()).await;
                return Err(err);
            }
        };

        tracing::info!(round = %hex::encode(&round_id[..8]), "unanimous assertion fully signed");
        self.notify_unanimous(round_id, true, signatures.clone()).await;

        let mut confirmation = self
            .driver
            .confirm_unanimous_assertion(request.data.clone(), signatures);
        tokio::select! {
            confirmed = &mut confirmation.confirmed => {
                if confirmed.is_err() {
                    return Err(take_driver_error(&mut confirmation.errors));
                }
            }
            Some(err) = confirmation.errors.recv() => return Err(err.into()),
        }
        Ok(update.sequence_num == FINAL_SEQUENCE_NUMBER)
    }

    fn assemble_unanimous_signatures(
        &self,
        assertion_digest: &Hash32,
        own_signature: RecoverableSignature,
        responses: &[LabeledResponse],
    ) -> Result<Vec<RecoverableSignature>, CoordinationError> {
        if responses.len() != self.validators.remote_count() {
            return Err(CoordinationError::MissingResponses);
        }
        let mut slots: Vec<Option<RecoverableSignature>> = vec![None; self.validators.count()];
        slots[self.validators.own_index()] = Some(own_signature);
        for labeled in responses {
            let FollowerVote::Unanimous {
                accepted,
                assertion_hash,
                signature,
            } = &labeled.response.vote
            else {
                return Err(CoordinationError::ValidatorRefused);
            };
            if !*accepted {
                return Err(CoordinationError::ValidatorRefused);
            }
            if assertion_hash != assertion_digest {
                return Err(CoordinationError::AssertionMismatch);
            }
            let signature = signature.clone().ok_or(CoordinationError::ValidatorRefused)?;
            let index = self
                .validators
                .index_of(&labeled.address)
                .ok_or(CoordinationError::UnknownValidator)?;
            slots[index] = Some(signature);
        }
        slots
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or(CoordinationError::MissingResponses)
    }

    async fn notify_unanimous(
        &self,
        round_id: Hash32,
        accepted: bool,
        signatures: Vec<RecoverableSignature>,
    ) {
        self.manager
            .broadcast(LeaderRequest::UnanimousNotification {
                request_id: round_id,
                accepted,
                signatures,
            })
            .await;
    }
}

/// Pull the concrete failure off the error channel if the driver reported
/// one before dropping its side.
fn take_driver_error(
    errors: &mut mpsc::Receiver<crate::driver::DriverError>,
) -> CoordinationError {
    match errors.try_recv() {
        Ok(err) => err.into(),
        Err(_) => CoordinationError::DriverClosed,
    }
}
