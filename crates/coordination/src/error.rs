//! Round-level failures surfaced to coordinator API callers.

use crate::driver::DriverError;
use thiserror::Error;
use validator_keys::KeyError;

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("coordinator can only create a VM when connected to all other validators")]
    NotAllValidatorsConnected,

    #[error("some validators did not respond")]
    MissingResponses,

    #[error("some validators refused to sign")]
    ValidatorRefused,

    #[error("some validators signed a different assertion")]
    AssertionMismatch,

    #[error("response from a validator outside the set")]
    UnknownValidator,

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("driver stopped before completing the round")]
    DriverClosed,

    #[error("signing failed: {0}")]
    Signing(#[from] KeyError),
}
