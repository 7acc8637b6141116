//! Interface to the on-chain driver that executes the VM and settles
//! assertions.
//!
//! The coordination engine only consumes these hooks; the driver itself runs
//! elsewhere. Every receiver-returning method is one-shot: exactly one value
//! (or one error) followed by closure.

use crate::types::{
    CreateVmRequest, UnanimousRequest, UnanimousRequestData, UnanimousUpdate, VmMessage,
    VmStateData,
};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use validator_keys::RecoverableSignature;

/// Failure reported by the driver before a round settled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DriverError(pub String);

/// Channels for one in-flight unanimous round. `request` resolves first with
/// the canonical round payload, `results` later with the proposed
/// post-state; `errors` may fire instead of either.
pub struct UnanimousHandles {
    pub request: oneshot::Receiver<UnanimousRequest>,
    pub results: oneshot::Receiver<UnanimousUpdate>,
    pub errors: mpsc::Receiver<DriverError>,
}

/// Channels for a pending settlement confirmation.
pub struct ConfirmationHandles {
    pub confirmed: oneshot::Receiver<()>,
    pub errors: mpsc::Receiver<DriverError>,
}

/// Hooks the coordinator calls on the on-chain driver.
pub trait VmDriver: Send + Sync + 'static {
    /// Current configuration and machine state, for the create round.
    fn request_vm_state(&self) -> oneshot::Receiver<VmStateData>;

    /// Start assembling a unanimous round over `messages`.
    fn initiate_unanimous_request(
        &self,
        max_steps: u32,
        messages: Vec<VmMessage>,
        force_final: bool,
    ) -> UnanimousHandles;

    /// Settle the current unanimous channel on chain.
    fn close_unanimous_assertion(&self) -> oneshot::Receiver<bool>;

    /// Make a disputable on-chain assertion.
    fn request_disputable_assertion(&self, max_steps: u32, finalize: bool)
        -> oneshot::Receiver<bool>;

    /// Record a fully signed unanimous assertion.
    fn confirm_unanimous_assertion(
        &self,
        request: UnanimousRequestData,
        signatures: Vec<RecoverableSignature>,
    ) -> ConfirmationHandles;

    /// Whether on-chain inbox messages are waiting to be drained.
    fn has_pending_messages(&self) -> oneshot::Receiver<bool>;

    /// Submit the VM-creation transaction with the full signature vector.
    fn create_vm(
        &self,
        request: &CreateVmRequest,
        signatures: Vec<RecoverableSignature>,
    ) -> Result<(), DriverError>;
}
