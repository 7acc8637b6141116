//! One live follower connection: a reader and a writer task sharing a
//! websocket. Exactly one task writes, preserving frame integrity.
//!
//! Both pumps are generic over the underlying IO stream so tests can run
//! them on in-memory duplex pipes.

use crate::manager::ClientManagerHandle;
use crate::wire::{FollowerResponse, LeaderRequest};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use validator_keys::Address;

/// Read frames from a follower until the connection dies, stays silent past
/// `pong_wait`, or the paired writer goes away, forwarding decoded responses
/// inbound. Malformed frames are logged and skipped. Unregisters the
/// follower on exit.
pub(crate) async fn read_pump<S>(
    address: Address,
    connection: u64,
    mut stream: SplitStream<WebSocketStream<S>>,
    inbound: mpsc::Sender<FollowerResponse>,
    manager: ClientManagerHandle,
    pong_wait: Duration,
    mut writer_gone: oneshot::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = timeout(pong_wait, stream.next()) => match frame {
                Err(_) => {
                    tracing::warn!(%address, "follower went silent");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    tracing::debug!(%address, %err, "follower read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            },
            _ = &mut writer_gone => {
                tracing::debug!(%address, "writer exited, stopping reader");
                break;
            }
        };
        match frame {
            Message::Binary(data) => match FollowerResponse::from_bytes(&data) {
                Ok(response) => {
                    if inbound.send(response).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(%address, %err, "discarding malformed follower frame")
                }
            },
            Message::Close(_) => break,
            // Pings are answered by the websocket layer; receiving any frame,
            // heartbeat replies included, already refreshed the deadline.
            _ => {}
        }
    }
    manager.unregister(address, connection).await;
}

/// Drain the outbound channel into the socket and keep the follower alive
/// with periodic pings, one write deadline per frame. Closure of the
/// outbound channel is the shutdown signal: the writer sends a close frame
/// and exits. `writer_gone` drops with this task, which the paired reader
/// watches, so a write failure tears the whole connection down instead of
/// leaving the reader to wait out its liveness deadline.
pub(crate) async fn write_pump<S>(
    address: Address,
    connection: u64,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<LeaderRequest>,
    manager: ClientManagerHandle,
    write_wait: Duration,
    ping_period: Duration,
    _writer_gone: oneshot::Sender<()>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            maybe = outbound.recv() => match maybe {
                Some(request) => {
                    let frame = Message::Binary(request.to_bytes());
                    if send_frame(&mut sink, frame, write_wait).await.is_err() {
                        tracing::debug!(%address, "follower write failed");
                        break;
                    }
                }
                None => {
                    // Already unregistered; just say goodbye.
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if send_frame(&mut sink, Message::Ping(Vec::new()), write_wait).await.is_err() {
                    tracing::debug!(%address, "follower ping failed");
                    break;
                }
            }
        }
    }
    manager.unregister(address, connection).await;
}

async fn send_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    frame: Message,
    write_wait: Duration,
) -> Result<(), ()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{ClientManager, Follower};
    use crate::wire::FollowerVote;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn websocket_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (leader_io, follower_io) = tokio::io::duplex(64 * 1024);
        let leader = WebSocketStream::from_raw_socket(leader_io, Role::Server, None).await;
        let follower = WebSocketStream::from_raw_socket(follower_io, Role::Client, None).await;
        (leader, follower)
    }

    fn spawn_manager(remote_count: usize) -> ClientManagerHandle {
        let (handle, manager) = ClientManager::new(remote_count, Duration::from_millis(200));
        tokio::spawn(manager.run());
        handle
    }

    async fn next_binary(socket: &mut WebSocketStream<DuplexStream>) -> Option<Vec<u8>> {
        while let Some(frame) = socket.next().await {
            match frame {
                Ok(Message::Binary(data)) => return Some(data),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    }

    #[tokio::test]
    async fn writer_frames_requests_and_closes_on_shutdown() {
        let (leader, mut follower) = websocket_pair().await;
        let (sink, _stream) = leader.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (writer_gone_tx, _writer_gone_rx) = oneshot::channel();
        let manager = spawn_manager(1);
        tokio::spawn(write_pump(
            Address([1u8; 20]),
            0,
            sink,
            outbound_rx,
            manager,
            Duration::from_secs(1),
            Duration::from_secs(60),
            writer_gone_tx,
        ));

        let request = LeaderRequest::CreateNotification { approved: true };
        outbound_tx.send(request.clone()).await.unwrap();
        let data = next_binary(&mut follower).await.unwrap();
        assert_eq!(LeaderRequest::from_bytes(&data).unwrap(), request);

        // Dropping the channel asks the writer to shut the socket down.
        drop(outbound_tx);
        loop {
            match follower.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    }

    #[tokio::test]
    async fn writer_pings_on_idle() {
        let (leader, mut follower) = websocket_pair().await;
        let (sink, _stream) = leader.split();
        let (_outbound_tx, outbound_rx) = mpsc::channel(8);
        let (writer_gone_tx, _writer_gone_rx) = oneshot::channel();
        let manager = spawn_manager(1);
        tokio::spawn(write_pump(
            Address([1u8; 20]),
            0,
            sink,
            outbound_rx,
            manager,
            Duration::from_secs(1),
            Duration::from_millis(20),
            writer_gone_tx,
        ));

        loop {
            match follower.next().await {
                Some(Ok(Message::Ping(_))) => break,
                Some(Ok(_)) => continue,
                other => panic!("expected a ping, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn writer_failure_stops_the_reader() {
        // A pipe too small for the frame: the writer jams and hits its write
        // deadline while the socket itself stays open.
        let (leader_io, follower_io) = tokio::io::duplex(16);
        let leader = WebSocketStream::from_raw_socket(leader_io, Role::Server, None).await;
        let _follower_io = follower_io;
        let (sink, stream) = leader.split();
        let manager = spawn_manager(1);
        let address = Address([1u8; 20]);
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let (writer_gone_tx, writer_gone_rx) = oneshot::channel();
        tokio::spawn(write_pump(
            address,
            0,
            sink,
            outbound_rx,
            manager.clone(),
            Duration::from_millis(50),
            Duration::from_secs(60),
            writer_gone_tx,
        ));
        tokio::spawn(read_pump(
            address,
            0,
            stream,
            inbound_tx,
            manager.clone(),
            Duration::from_secs(3600),
            writer_gone_rx,
        ));

        outbound_tx
            .send(LeaderRequest::UnanimousNotification {
                request_id: [7u8; 32],
                accepted: true,
                signatures: Vec::new(),
            })
            .await
            .unwrap();

        // The reader must fall with the writer, not wait out its own
        // liveness deadline.
        let next = timeout(Duration::from_secs(1), inbound_rx.recv())
            .await
            .expect("reader kept running after the writer died");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn reader_forwards_valid_frames_and_skips_garbage() {
        let (leader, mut follower) = websocket_pair().await;
        let (_sink, stream) = leader.split();
        let manager = spawn_manager(1);

        let address = Address([1u8; 20]);
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let record = Follower::new(address, outbound_tx);
        let connection = record.id();
        manager.register(record, mpsc::channel(8).1).await;
        let (_writer_gone_tx, writer_gone_rx) = oneshot::channel();
        tokio::spawn(read_pump(
            address,
            connection,
            stream,
            inbound_tx,
            manager.clone(),
            Duration::from_secs(5),
            writer_gone_rx,
        ));
        assert!(manager.wait_for_followers(Duration::from_millis(100)).await);

        follower
            .send(Message::Binary(b"not a response".to_vec()))
            .await
            .unwrap();
        let response = FollowerResponse {
            request_id: [3u8; 32],
            vote: FollowerVote::Create {
                accepted: true,
                signature: None,
            },
        };
        follower
            .send(Message::Binary(response.to_bytes()))
            .await
            .unwrap();
        assert_eq!(inbound_rx.recv().await.unwrap(), response);

        // A close unregisters the follower.
        follower.send(Message::Close(None)).await.unwrap();
        let mut disconnected = false;
        for _ in 0..50 {
            if !manager.wait_for_followers(Duration::from_millis(20)).await {
                disconnected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(disconnected);
    }
}
