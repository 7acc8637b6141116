//! Core records exchanged between the coordinator, its followers, and the
//! on-chain driver.

use borsh::{BorshDeserialize, BorshSerialize};
use rand::RngCore;
use sha3::{Digest, Keccak256};
use validator_keys::Hash32;

/// Sequence number that marks a unanimous round as the last in its channel,
/// forcing on-chain settlement.
pub const FINAL_SEQUENCE_NUMBER: u64 = u64::MAX;

/// 32-byte identifier tying every round to one logical VM. Chosen at random
/// when the coordinator starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VmId(pub [u8; 32]);

impl VmId {
    pub fn random() -> Self {
        let mut id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id);
        VmId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Static parameters of the VM being validated.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VmConfig {
    pub grace_period_blocks: u64,
    pub escrow_required: u64,
    pub max_execution_steps: u32,
}

/// An application payload addressed to the VM.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct VmMessage {
    pub destination: Hash32,
    pub payload: Vec<u8>,
}

/// An inbound off-chain message paired with its originator's signature.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct OffchainMessage {
    pub message: VmMessage,
    pub signature: Vec<u8>,
}

/// Block range within which an assertion claims validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct TimeBounds {
    pub start_block: u64,
    pub end_block: u64,
}

/// A proposed post-state transition of the VM.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Assertion {
    pub after_hash: Hash32,
    pub num_steps: u32,
    pub out_msgs: Vec<VmMessage>,
}

/// Snapshot the driver reports for the create round.
#[derive(Debug, Clone)]
pub struct VmStateData {
    pub config: VmConfig,
    pub machine_state: Hash32,
}

/// Canonical description of one unanimous round. Its digest is the round id
/// every response is correlated by.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct UnanimousRequestData {
    pub before_hash: Hash32,
    pub before_inbox: Hash32,
    pub sequence_num: u64,
    pub time_bounds: TimeBounds,
}

impl UnanimousRequestData {
    /// The round id: a tagged Keccak-256 digest of the canonical encoding.
    pub fn digest(&self) -> Hash32 {
        let mut hasher = Keccak256::new();
        hasher.update(b"unanimous-request");
        hasher.update(borsh::to_vec(self).expect("unanimous request data encoding"));
        hasher.finalize().into()
    }
}

/// The payload the driver assembles when a unanimous round starts.
#[derive(Debug, Clone)]
pub struct UnanimousRequest {
    pub data: UnanimousRequestData,
    pub new_messages: Vec<VmMessage>,
}

/// The driver's proposed outcome of a unanimous round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnanimousUpdate {
    pub sequence_num: u64,
    pub before_hash: Hash32,
    pub time_bounds: TimeBounds,
    pub new_inbox_hash: Hash32,
    pub original_inbox_hash: Hash32,
    pub assertion: Assertion,
}

impl UnanimousUpdate {
    /// Digest every validator signs to commit this round off-chain.
    pub fn assertion_digest(&self) -> Hash32 {
        let mut hasher = Keccak256::new();
        hasher.update(b"unanimous-assertion");
        hasher.update(self.sequence_num.to_le_bytes());
        hasher.update(self.before_hash);
        hasher.update(self.time_bounds.start_block.to_le_bytes());
        hasher.update(self.time_bounds.end_block.to_le_bytes());
        hasher.update(self.new_inbox_hash);
        hasher.update(self.original_inbox_hash);
        hasher.update(borsh::to_vec(&self.assertion).expect("assertion encoding"));
        hasher.finalize().into()
    }
}

/// Request every validator co-signs to bring a new VM on chain.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CreateVmRequest {
    pub config: VmConfig,
    pub vm_id: VmId,
    pub vm_state: Hash32,
    pub challenge_manager: u64,
}

impl CreateVmRequest {
    /// Digest every validator signs to approve creation.
    pub fn digest(&self) -> Hash32 {
        let mut hasher = Keccak256::new();
        hasher.update(b"create-vm");
        hasher.update(borsh::to_vec(self).expect("create request encoding"));
        hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update() -> UnanimousUpdate {
        UnanimousUpdate {
            sequence_num: 3,
            before_hash: [1u8; 32],
            time_bounds: TimeBounds {
                start_block: 10,
                end_block: 20,
            },
            new_inbox_hash: [2u8; 32],
            original_inbox_hash: [3u8; 32],
            assertion: Assertion {
                after_hash: [4u8; 32],
                num_steps: 100,
                out_msgs: Vec::new(),
            },
        }
    }

    #[test]
    fn assertion_digest_is_deterministic() {
        assert_eq!(
            sample_update().assertion_digest(),
            sample_update().assertion_digest()
        );
    }

    #[test]
    fn assertion_digest_commits_to_sequence_number() {
        let mut update = sample_update();
        let digest = update.assertion_digest();
        update.sequence_num = FINAL_SEQUENCE_NUMBER;
        assert_ne!(digest, update.assertion_digest());
    }

    #[test]
    fn create_digest_commits_to_vm_id() {
        let request = CreateVmRequest {
            config: VmConfig {
                grace_period_blocks: 100,
                escrow_required: 0,
                max_execution_steps: 10_000,
            },
            vm_id: VmId([5u8; 32]),
            vm_state: [6u8; 32],
            challenge_manager: 0,
        };
        let mut other = request.clone();
        other.vm_id = VmId([7u8; 32]);
        assert_ne!(request.digest(), other.digest());
    }

    #[test]
    fn round_id_commits_to_every_request_field() {
        let data = UnanimousRequestData {
            before_hash: [0u8; 32],
            before_inbox: [0u8; 32],
            sequence_num: 0,
            time_bounds: TimeBounds {
                start_block: 0,
                end_block: 0,
            },
        };
        let round_id = data.digest();
        let mut inbox = data.clone();
        inbox.before_inbox = [9u8; 32];
        let mut bounds = data.clone();
        bounds.time_bounds.end_block = 1;
        assert_ne!(round_id, inbox.digest());
        assert_ne!(round_id, bounds.digest());
    }
}
