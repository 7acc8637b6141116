//! Client manager: the registry of live followers.
//!
//! The follower table, the pending signature rounds, and the parked waiters
//! are all owned by one event loop and reached through typed commands, so
//! per-follower I/O stays concurrent without a lock on any of them.

use crate::wire::{FollowerResponse, LeaderRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use validator_keys::{Address, Hash32};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A live follower as the manager sees it: its address and the channel its
/// writer task drains. Dropping the channel shuts the writer down. Each
/// registration gets a fresh connection id so that a reader outliving its
/// replacement cannot unregister the newer connection.
#[derive(Debug)]
pub struct Follower {
    pub address: Address,
    pub sender: mpsc::Sender<LeaderRequest>,
    id: u64,
}

impl Follower {
    pub fn new(address: Address, sender: mpsc::Sender<LeaderRequest>) -> Self {
        Self {
            address,
            sender,
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A follower response labeled with the address it came from.
#[derive(Debug, Clone)]
pub struct LabeledResponse {
    pub address: Address,
    pub response: FollowerResponse,
}

enum ManagerCommand {
    Register {
        follower: Follower,
        responses: mpsc::Receiver<FollowerResponse>,
    },
    Unregister {
        address: Address,
        connection: u64,
    },
    Broadcast {
        request: LeaderRequest,
    },
    GatherSignatures {
        request: LeaderRequest,
        request_id: Hash32,
        sink: mpsc::Sender<LabeledResponse>,
    },
    FinishRound {
        request_id: Hash32,
    },
    WaitForFollowers {
        waiter: oneshot::Sender<()>,
    },
}

/// Cloneable access to the manager loop.
#[derive(Clone)]
pub struct ClientManagerHandle {
    commands: mpsc::Sender<ManagerCommand>,
    remote_count: usize,
    gather_timeout: Duration,
}

impl ClientManagerHandle {
    pub async fn register(&self, follower: Follower, responses: mpsc::Receiver<FollowerResponse>) {
        let _ = self
            .commands
            .send(ManagerCommand::Register {
                follower,
                responses,
            })
            .await;
    }

    pub async fn unregister(&self, address: Address, connection: u64) {
        let _ = self
            .commands
            .send(ManagerCommand::Unregister {
                address,
                connection,
            })
            .await;
    }

    pub async fn broadcast(&self, request: LeaderRequest) {
        let _ = self
            .commands
            .send(ManagerCommand::Broadcast { request })
            .await;
    }

    /// Wait until every other validator is connected. Returns false if the
    /// limit expires first. Waiters are one-shot.
    pub async fn wait_for_followers(&self, limit: Duration) -> bool {
        let (waiter, signal) = oneshot::channel();
        if self
            .commands
            .send(ManagerCommand::WaitForFollowers { waiter })
            .await
            .is_err()
        {
            return false;
        }
        matches!(timeout(limit, signal).await, Ok(Ok(())))
    }

    /// Broadcast `request` and collect responses for the round `request_id`,
    /// at most one per follower, under the single-shot gather deadline.
    /// Partial results are returned on timeout; the round entry is removed
    /// either way.
    pub async fn gather_signatures(
        &self,
        request: LeaderRequest,
        request_id: Hash32,
    ) -> Vec<LabeledResponse> {
        let (sink, mut responses) = mpsc::channel(self.remote_count.max(1));
        tracing::debug!(round = %hex::encode(&request_id[..8]), "gathering signatures");
        if self
            .commands
            .send(ManagerCommand::GatherSignatures {
                request,
                request_id,
                sink,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }

        let mut collected = Vec::with_capacity(self.remote_count);
        let deadline = sleep(self.gather_timeout);
        tokio::pin!(deadline);
        while collected.len() < self.remote_count {
            tokio::select! {
                maybe = responses.recv() => match maybe {
                    Some(response) => collected.push(response),
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(round = %hex::encode(&request_id[..8]), "timed out gathering signatures");
                    break;
                }
            }
        }
        let _ = self
            .commands
            .send(ManagerCommand::FinishRound { request_id })
            .await;
        collected
    }
}

struct FollowerEntry {
    sender: mpsc::Sender<LeaderRequest>,
    id: u64,
}

/// The manager event loop.
pub struct ClientManager {
    commands: mpsc::Receiver<ManagerCommand>,
    aggregate_tx: mpsc::Sender<LabeledResponse>,
    aggregate_rx: mpsc::Receiver<LabeledResponse>,
    followers: HashMap<Address, FollowerEntry>,
    rounds: HashMap<Hash32, mpsc::Sender<LabeledResponse>>,
    waiters: Vec<oneshot::Sender<()>>,
    remote_count: usize,
}

impl ClientManager {
    pub fn new(remote_count: usize, gather_timeout: Duration) -> (ClientManagerHandle, Self) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (aggregate_tx, aggregate_rx) = mpsc::channel(32);
        (
            ClientManagerHandle {
                commands: commands_tx,
                remote_count,
                gather_timeout,
            },
            ClientManager {
                commands: commands_rx,
                aggregate_tx,
                aggregate_rx,
                followers: HashMap::new(),
                rounds: HashMap::new(),
                waiters: Vec::new(),
                remote_count,
            },
        )
    }

    /// Run until every handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                maybe = self.commands.recv() => match maybe {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(response) = self.aggregate_rx.recv() => self.route_response(response),
            }
        }
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::Register {
                follower,
                mut responses,
            } => {
                let address = follower.address;
                let entry = FollowerEntry {
                    sender: follower.sender,
                    id: follower.id,
                };
                if self.followers.insert(address, entry).is_some() {
                    tracing::info!(%address, "replacing existing follower connection");
                }
                let aggregate = self.aggregate_tx.clone();
                tokio::spawn(async move {
                    while let Some(response) = responses.recv().await {
                        if aggregate
                            .send(LabeledResponse { address, response })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
                tracing::info!(%address, connected = self.followers.len(), "follower connected");
                if self.followers.len() == self.remote_count {
                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                }
            }
            ManagerCommand::Unregister {
                address,
                connection,
            } => {
                // A reader that outlived its replacement must not take the
                // newer connection down with it.
                let current = self.followers.get(&address).map(|entry| entry.id);
                if current == Some(connection) {
                    self.followers.remove(&address);
                    tracing::info!(%address, "follower disconnected");
                }
            }
            ManagerCommand::Broadcast { request } => self.broadcast(request),
            ManagerCommand::GatherSignatures {
                request,
                request_id,
                sink,
            } => {
                // Two concurrent rounds under one digest would misdeliver
                // responses; the controller serializes rounds, so this can
                // only be a programming error.
                if self.rounds.insert(request_id, sink).is_some() {
                    panic!("duplicate signature round {}", hex::encode(request_id));
                }
                self.broadcast(request);
            }
            ManagerCommand::FinishRound { request_id } => {
                self.rounds.remove(&request_id);
            }
            ManagerCommand::WaitForFollowers { waiter } => {
                if self.followers.len() == self.remote_count {
                    let _ = waiter.send(());
                } else {
                    self.waiters.push(waiter);
                }
            }
        }
    }

    /// Non-blocking fan-out. A follower whose outbound buffer is full cannot
    /// keep up and is evicted; the next round then aborts cleanly instead of
    /// stalling the leader behind it.
    fn broadcast(&mut self, request: LeaderRequest) {
        let mut evicted = Vec::new();
        for (address, entry) in &self.followers {
            if entry.sender.try_send(request.clone()).is_err() {
                evicted.push(*address);
            }
        }
        for address in evicted {
            tracing::warn!(%address, "evicting unresponsive follower");
            self.followers.remove(&address);
        }
    }

    fn route_response(&mut self, labeled: LabeledResponse) {
        match self.rounds.get(&labeled.response.request_id) {
            Some(sink) => {
                let _ = sink.try_send(labeled);
            }
            // Late arrival from an aborted round.
            None => tracing::debug!(address = %labeled.address, "dropping response for unknown round"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::FollowerVote;

    fn address(tag: u8) -> Address {
        Address([tag; 20])
    }

    fn spawn_manager(remote_count: usize) -> ClientManagerHandle {
        let (handle, manager) = ClientManager::new(remote_count, Duration::from_millis(200));
        tokio::spawn(manager.run());
        handle
    }

    fn unanimous_probe(request_id: Hash32) -> LeaderRequest {
        LeaderRequest::UnanimousNotification {
            request_id,
            accepted: true,
            signatures: Vec::new(),
        }
    }

    /// Registers a follower that answers every request carrying a round id.
    async fn register_echo(
        handle: &ClientManagerHandle,
        tag: u8,
    ) -> (Address, mpsc::Sender<FollowerResponse>) {
        let follower_address = address(tag);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        handle
            .register(Follower::new(follower_address, outbound_tx), inbound_rx)
            .await;
        let responder = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let request_id = match request {
                    LeaderRequest::Unanimous { request_id, .. }
                    | LeaderRequest::UnanimousNotification { request_id, .. } => request_id,
                    _ => continue,
                };
                let _ = responder
                    .send(FollowerResponse {
                        request_id,
                        vote: FollowerVote::Unanimous {
                            accepted: true,
                            assertion_hash: request_id,
                            signature: None,
                        },
                    })
                    .await;
            }
        });
        (follower_address, inbound_tx)
    }

    #[tokio::test]
    async fn wait_reports_when_all_followers_connect() {
        let handle = spawn_manager(2);
        assert!(!handle.wait_for_followers(Duration::from_millis(50)).await);
        register_echo(&handle, 1).await;
        assert!(!handle.wait_for_followers(Duration::from_millis(50)).await);
        register_echo(&handle, 2).await;
        assert!(handle.wait_for_followers(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn parked_waiter_wakes_on_last_connection() {
        let handle = spawn_manager(2);
        register_echo(&handle, 1).await;
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_followers(Duration::from_secs(5)).await })
        };
        register_echo(&handle, 2).await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn gather_collects_labeled_responses() {
        let handle = spawn_manager(2);
        let (first, _) = register_echo(&handle, 1).await;
        let (second, _) = register_echo(&handle, 2).await;

        let responses = handle
            .gather_signatures(unanimous_probe([7u8; 32]), [7u8; 32])
            .await;
        assert_eq!(responses.len(), 2);
        let mut seen: Vec<Address> = responses.iter().map(|r| r.address).collect();
        seen.sort();
        assert_eq!(seen, vec![first, second]);
    }

    #[tokio::test]
    async fn gather_times_out_with_partial_responses() {
        let handle = spawn_manager(2);
        register_echo(&handle, 1).await;
        // The second follower never answers.
        let (outbound_tx, _outbound_rx) = mpsc::channel(16);
        let (_inbound_tx, inbound_rx) = mpsc::channel::<FollowerResponse>(16);
        handle
            .register(Follower::new(address(2), outbound_tx), inbound_rx)
            .await;

        let responses = handle
            .gather_signatures(unanimous_probe([8u8; 32]), [8u8; 32])
            .await;
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test]
    async fn responses_for_unknown_rounds_are_dropped() {
        let handle = spawn_manager(1);
        let (_, inbound) = register_echo(&handle, 1).await;
        inbound
            .send(FollowerResponse {
                request_id: [9u8; 32],
                vote: FollowerVote::Create {
                    accepted: true,
                    signature: None,
                },
            })
            .await
            .unwrap();
        // The loop keeps serving rounds afterwards.
        let responses = handle
            .gather_signatures(unanimous_probe([1u8; 32]), [1u8; 32])
            .await;
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test]
    async fn slow_follower_is_evicted_on_overflow() {
        let handle = spawn_manager(1);
        let (outbound_tx, mut outbound_rx) = mpsc::channel(1);
        let (_inbound_tx, inbound_rx) = mpsc::channel::<FollowerResponse>(16);
        handle
            .register(Follower::new(address(1), outbound_tx), inbound_rx)
            .await;
        assert!(handle.wait_for_followers(Duration::from_millis(50)).await);

        // First broadcast fills the single-slot buffer, second overflows it.
        handle.broadcast(unanimous_probe([1u8; 32])).await;
        handle.broadcast(unanimous_probe([2u8; 32])).await;

        assert!(outbound_rx.recv().await.is_some());
        assert!(outbound_rx.recv().await.is_none());
        assert!(!handle.wait_for_followers(Duration::from_millis(50)).await);
    }
}
