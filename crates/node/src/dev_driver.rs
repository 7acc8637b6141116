//! In-memory settlement driver for local runs.
//!
//! Stands in for the on-chain driver so a coordinator and its followers can
//! be exercised without chain infrastructure: assertions always succeed, the
//! inbox is a keccak hash chain over the batched messages, and confirmation
//! advances the simulated machine.

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use validator_coordination::driver::{
    ConfirmationHandles, DriverError, UnanimousHandles, VmDriver,
};
use validator_coordination::types::{
    Assertion, CreateVmRequest, TimeBounds, UnanimousRequest, UnanimousRequestData,
    UnanimousUpdate, VmConfig, VmMessage, VmStateData, FINAL_SEQUENCE_NUMBER,
};
use validator_keys::{keccak256, Hash32, RecoverableSignature};

pub struct DevDriver {
    state: Mutex<DevState>,
}

struct DevState {
    sequence_num: u64,
    machine_hash: Hash32,
    inbox_hash: Hash32,
    /// Post-state of the round awaiting confirmation.
    pending: Option<(Hash32, Hash32)>,
}

impl DevDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DevState {
                sequence_num: 0,
                machine_hash: [0u8; 32],
                inbox_hash: [0u8; 32],
                pending: None,
            }),
        }
    }
}

impl Default for DevDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn fold_message(inbox: Hash32, message: &VmMessage) -> Hash32 {
    let mut buffer = Vec::with_capacity(64 + message.payload.len());
    buffer.extend_from_slice(&inbox);
    buffer.extend_from_slice(&message.destination);
    buffer.extend_from_slice(&message.payload);
    keccak256(&buffer)
}

impl VmDriver for DevDriver {
    fn request_vm_state(&self) -> oneshot::Receiver<VmStateData> {
        let (reply, receiver) = oneshot::channel();
        let state = self.state.lock();
        let _ = reply.send(VmStateData {
            config: VmConfig {
                grace_period_blocks: 100,
                escrow_required: 0,
                max_execution_steps: 10_000,
            },
            machine_state: state.machine_hash,
        });
        receiver
    }

    fn initiate_unanimous_request(
        &self,
        _max_steps: u32,
        messages: Vec<VmMessage>,
        force_final: bool,
    ) -> UnanimousHandles {
        let (request_tx, request) = oneshot::channel();
        let (results_tx, results) = oneshot::channel();
        let (_errors_tx, errors) = mpsc::channel(1);

        let mut state = self.state.lock();
        let mut inbox = state.inbox_hash;
        for message in &messages {
            inbox = fold_message(inbox, message);
        }
        let sequence_num = if force_final {
            FINAL_SEQUENCE_NUMBER
        } else {
            state.sequence_num
        };
        let data = UnanimousRequestData {
            before_hash: state.machine_hash,
            before_inbox: state.inbox_hash,
            sequence_num,
            time_bounds: TimeBounds {
                start_block: 0,
                end_block: u64::MAX,
            },
        };

        let mut after = Vec::with_capacity(64);
        after.extend_from_slice(&state.machine_hash);
        after.extend_from_slice(&inbox);
        let after_hash = keccak256(&after);
        let update = UnanimousUpdate {
            sequence_num,
            before_hash: state.machine_hash,
            time_bounds: data.time_bounds,
            new_inbox_hash: inbox,
            original_inbox_hash: state.inbox_hash,
            assertion: Assertion {
                after_hash,
                num_steps: messages.len() as u32,
                out_msgs: Vec::new(),
            },
        };
        state.pending = Some((after_hash, inbox));

        let _ = request_tx.send(UnanimousRequest {
            data,
            new_messages: messages,
        });
        let _ = results_tx.send(update);
        UnanimousHandles {
            request,
            results,
            errors,
        }
    }

    fn close_unanimous_assertion(&self) -> oneshot::Receiver<bool> {
        let (reply, receiver) = oneshot::channel();
        let _ = reply.send(true);
        receiver
    }

    fn request_disputable_assertion(
        &self,
        _max_steps: u32,
        _finalize: bool,
    ) -> oneshot::Receiver<bool> {
        let (reply, receiver) = oneshot::channel();
        let _ = reply.send(true);
        receiver
    }

    fn confirm_unanimous_assertion(
        &self,
        request: UnanimousRequestData,
        _signatures: Vec<RecoverableSignature>,
    ) -> ConfirmationHandles {
        let (reply, confirmed) = oneshot::channel();
        let (_errors_tx, errors) = mpsc::channel(1);
        let mut state = self.state.lock();
        if let Some((machine_hash, inbox_hash)) = state.pending.take() {
            state.machine_hash = machine_hash;
            state.inbox_hash = inbox_hash;
        }
        state.sequence_num = request.sequence_num.wrapping_add(1);
        let _ = reply.send(());
        ConfirmationHandles { confirmed, errors }
    }

    fn has_pending_messages(&self) -> oneshot::Receiver<bool> {
        let (reply, receiver) = oneshot::channel();
        let _ = reply.send(false);
        receiver
    }

    fn create_vm(
        &self,
        request: &CreateVmRequest,
        signatures: Vec<RecoverableSignature>,
    ) -> Result<(), DriverError> {
        tracing::info!(
            vm = %hex::encode(request.vm_id.as_bytes()),
            signatures = signatures.len(),
            "simulated VM creation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn confirmation_advances_the_simulated_machine() {
        let driver = DevDriver::new();
        let message = VmMessage {
            destination: [1u8; 32],
            payload: b"ping".to_vec(),
        };
        let handles = driver.initiate_unanimous_request(10_000, vec![message], false);
        let request = handles.request.await.unwrap();
        let update = handles.results.await.unwrap();
        assert_eq!(request.data.sequence_num, 0);
        assert_eq!(update.before_hash, [0u8; 32]);
        assert_ne!(update.new_inbox_hash, update.original_inbox_hash);

        driver
            .confirm_unanimous_assertion(request.data.clone(), Vec::new())
            .confirmed
            .await
            .unwrap();

        let next = driver.initiate_unanimous_request(10_000, Vec::new(), false);
        let next_request = next.request.await.unwrap();
        assert_eq!(next_request.data.sequence_num, 1);
        assert_eq!(next_request.data.before_hash, update.assertion.after_hash);
        assert_eq!(next_request.data.before_inbox, update.new_inbox_hash);
    }

    #[tokio::test]
    async fn forced_rounds_carry_the_final_sequence_number() {
        let driver = DevDriver::new();
        let handles = driver.initiate_unanimous_request(10_000, Vec::new(), true);
        let request = handles.request.await.unwrap();
        assert_eq!(request.data.sequence_num, FINAL_SEQUENCE_NUMBER);
    }
}
