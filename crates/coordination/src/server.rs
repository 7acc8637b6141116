//! TLS websocket listener and the authenticated admission handshake.
//!
//! A follower proves control of a validator key by signing the keccak of a
//! value exported from the TLS session, so a captured handshake cannot be
//! replayed on another connection. The coordinator answers with the VM id
//! and its own signature over the same digest.

use crate::config::CoordinatorConfig;
use crate::connection::{read_pump, write_pump};
use crate::manager::{ClientManagerHandle, Follower};
use crate::types::VmId;
use crate::validators::ValidatorSet;
use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use validator_keys::{keccak256, Address, Hash32, PrivateKey, RecoverableSignature};

/// Label under which both sides export the TLS channel binding.
const CHANNEL_BINDING_LABEL: &[u8] = b"validator-coordinator channel binding";

/// Endpoint followers connect to.
const WEBSOCKET_PATH: &str = "/ws";

/// Accepts follower connections and runs the admission handshake.
#[derive(Clone)]
pub struct FollowerListener {
    key: PrivateKey,
    vm_id: VmId,
    validators: Arc<ValidatorSet>,
    manager: ClientManagerHandle,
    config: CoordinatorConfig,
}

impl FollowerListener {
    pub fn new(
        key: PrivateKey,
        vm_id: VmId,
        validators: Arc<ValidatorSet>,
        manager: ClientManagerHandle,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            key,
            vm_id,
            validators,
            manager,
            config,
        }
    }

    /// Accept loop. Each connection is admitted on its own task; a failed
    /// handshake drops the connection without registering anything.
    pub async fn run(self, listener: TcpListener, acceptor: TlsAcceptor) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.admit(stream, acceptor).await {
                    tracing::warn!(%peer, err = %format!("{err:#}"), "follower admission failed");
                }
            });
        }
    }

    async fn admit(&self, stream: TcpStream, acceptor: TlsAcceptor) -> Result<()> {
        let mut tls = acceptor.accept(stream).await.context("TLS accept")?;
        let binding = {
            let (_, session) = tls.get_mut();
            session
                .export_keying_material([0u8; 32], CHANNEL_BINDING_LABEL, None)
                .context("channel binding export")?
        };
        let binding_digest = keccak256(&binding);

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.config.max_frame_bytes);
        ws_config.max_frame_size = Some(self.config.max_frame_bytes);
        let mut socket = tokio_tungstenite::accept_hdr_async_with_config(
            tls,
            require_websocket_path,
            Some(ws_config),
        )
        .await
        .context("websocket upgrade")?;

        let address = timeout(
            self.config.handshake_timeout,
            self.authenticate(&mut socket, &binding_digest),
        )
        .await
        .context("handshake timed out")??;

        let own_signature = self.key.sign_digest(&binding_digest)?;
        let mut reply = Vec::with_capacity(32 + 65);
        reply.extend_from_slice(self.vm_id.as_bytes());
        reply.extend_from_slice(&own_signature.to_bytes());
        socket
            .send(Message::Binary(reply))
            .await
            .context("handshake reply")?;

        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_buffer);
        let follower = Follower::new(address, outbound_tx);
        let connection = follower.id();
        self.manager.register(follower, inbound_rx).await;
        tracing::info!(%address, "admitted follower");

        let (sink, stream) = socket.split();
        let (writer_gone_tx, writer_gone_rx) = oneshot::channel();
        tokio::spawn(write_pump(
            address,
            connection,
            sink,
            outbound_rx,
            self.manager.clone(),
            self.config.write_wait,
            self.config.ping_period,
            writer_gone_tx,
        ));
        tokio::spawn(read_pump(
            address,
            connection,
            stream,
            inbound_tx,
            self.manager.clone(),
            self.config.pong_wait,
            writer_gone_rx,
        ));
        Ok(())
    }

    async fn authenticate<S>(
        &self,
        socket: &mut WebSocketStream<S>,
        binding_digest: &Hash32,
    ) -> Result<Address>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let first = socket
            .next()
            .await
            .context("connection closed during handshake")?
            .context("handshake read")?;
        let Message::Binary(raw) = first else {
            bail!("expected a binary greeting frame");
        };
        authenticate_follower(binding_digest, &raw, &self.validators)
    }
}

/// Recover the signer of the channel-bound greeting and check membership.
pub(crate) fn authenticate_follower(
    binding_digest: &Hash32,
    raw_signature: &[u8],
    validators: &ValidatorSet,
) -> Result<Address> {
    let signature =
        RecoverableSignature::from_bytes(raw_signature).context("malformed greeting signature")?;
    let address = signature
        .recover_address(binding_digest)
        .context("greeting signature recovery")?;
    if !validators.contains(&address) {
        bail!("{address} is not a member of the validator set");
    }
    Ok(address)
}

fn require_websocket_path(request: &Request, response: Response) -> Result<Response, ErrorResponse> {
    if request.uri().path() == WEBSOCKET_PATH {
        Ok(response)
    } else {
        let mut rejection = ErrorResponse::new(None);
        *rejection.status_mut() = StatusCode::NOT_FOUND;
        Err(rejection)
    }
}

/// Build a TLS acceptor from PEM certificate and key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path).with_context(|| format!("opening certificate {cert_path:?}"))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing certificate")?;
    let mut key_reader = BufReader::new(
        File::open(key_path).with_context(|| format!("opening TLS key {key_path:?}"))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .context("parsing TLS key")?
        .context("no private key found")?;
    let tls_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS configuration")?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
