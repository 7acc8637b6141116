//! Framed messages exchanged with followers.
//!
//! Every steady-state frame is one borsh-encoded record. Requests that open
//! a signature round are answered by [`FollowerResponse`]s carrying the
//! 32-byte round id they reply to.

use crate::types::{CreateVmRequest, OffchainMessage, TimeBounds};
use borsh::{BorshDeserialize, BorshSerialize};
use validator_keys::{Hash32, RecoverableSignature};

/// Messages the coordinator sends to followers.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum LeaderRequest {
    /// Ask every follower to co-sign the creation of the VM. Followers
    /// recompute the digest from the payload, so no round id is carried.
    Create(CreateVmRequest),
    /// Outcome of a create round, broadcast whether or not it succeeded.
    CreateNotification { approved: bool },
    /// Ask every follower to co-sign a unanimous assertion.
    Unanimous {
        request_id: Hash32,
        request: UnanimousSignatureRequest,
    },
    /// Outcome of a unanimous round. Carries the full signature vector on
    /// acceptance and an empty one on rejection.
    UnanimousNotification {
        request_id: Hash32,
        accepted: bool,
        signatures: Vec<RecoverableSignature>,
    },
}

/// Everything a follower needs to recompute and sign a unanimous round.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct UnanimousSignatureRequest {
    pub before_hash: Hash32,
    pub before_inbox: Hash32,
    pub sequence_num: u64,
    pub time_bounds: TimeBounds,
    pub signed_messages: Vec<OffchainMessage>,
}

/// A follower's reply to one round, keyed by the round id it answers.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct FollowerResponse {
    pub request_id: Hash32,
    pub vote: FollowerVote,
}

/// The follower's verdict on a round.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum FollowerVote {
    Create {
        accepted: bool,
        signature: Option<RecoverableSignature>,
    },
    Unanimous {
        accepted: bool,
        assertion_hash: Hash32,
        signature: Option<RecoverableSignature>,
    },
}

impl LeaderRequest {
    /// Serialize for transmission. Outbound records are trusted; failing to
    /// encode one is a programming error.
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("leader request encoding")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

impl FollowerResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).expect("follower response encoding")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, borsh::io::Error> {
        borsh::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VmMessage;

    #[test]
    fn unanimous_request_round_trips() {
        let request = LeaderRequest::Unanimous {
            request_id: [7u8; 32],
            request: UnanimousSignatureRequest {
                before_hash: [1u8; 32],
                before_inbox: [2u8; 32],
                sequence_num: 9,
                time_bounds: TimeBounds {
                    start_block: 5,
                    end_block: 6,
                },
                signed_messages: vec![OffchainMessage {
                    message: VmMessage {
                        destination: [3u8; 32],
                        payload: b"transfer".to_vec(),
                    },
                    signature: vec![0xaa; 65],
                }],
            },
        };
        let decoded = LeaderRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn rejects_truncated_frames() {
        let response = FollowerResponse {
            request_id: [7u8; 32],
            vote: FollowerVote::Create {
                accepted: true,
                signature: None,
            },
        };
        let bytes = response.to_bytes();
        assert!(FollowerResponse::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        assert!(FollowerResponse::from_bytes(b"junk").is_err());
    }
}
