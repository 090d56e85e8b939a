//! Per-connection handling
//!
//! A paired connection goes through the ClientHello probe, the decrypt
//! decision and, for interception, certificate issuance. Up to that point a
//! failure abandons the pairing without moving any data. Once the outbound
//! stream is started the decision is committed and later failures only
//! close the streams.

use super::ca::{CertificateAuthority, HostIdentifier};
use super::decision::{ConnectionFacts, DecisionTemplate};
use super::error::InterceptError;
use super::probe::{read_client_hello, ClientHello, HandshakeProbe};
use super::relay::{relay, RelayStats};
use super::rendezvous::Pairing;
use crate::message::{drain, Metadata};
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

/// Settings shared by every connection of one listener
pub struct ListenerContext {
    pub authority: Option<Arc<CertificateAuthority>>,
    pub decision: DecisionTemplate,
    /// Listen address as configured
    pub listen: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

/// How a connection was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passthrough(RelayStats),
    Intercepted(RelayStats),
}

impl Outcome {
    pub fn stats(&self) -> RelayStats {
        match self {
            Self::Passthrough(stats) | Self::Intercepted(stats) => *stats,
        }
    }

    pub fn decrypted(&self) -> bool {
        matches!(self, Self::Intercepted(_))
    }
}

enum Plan {
    Passthrough,
    Intercept {
        host: HostIdentifier,
        config: Arc<ServerConfig>,
    },
}

impl ConnectionFacts {
    /// Metadata published on the connection's outbound stream
    pub fn to_metadata(&self) -> Metadata {
        Metadata::new()
            .with("servername", self.servername.clone())
            .with("local_addr", self.local_addr.to_string())
            .with("remote_addr", self.remote_addr.to_string())
            .with("addr", self.addr.clone())
            .with("port", self.port)
    }
}

/// Serve one paired connection to completion
pub async fn serve_connection(
    ctx: &ListenerContext,
    socket: TcpStream,
    pairing: Pairing,
) -> Result<Outcome, InterceptError> {
    let addresses = socket
        .local_addr()
        .and_then(|local| Ok((local, socket.peer_addr()?)));
    let (local_addr, remote_addr) = match addresses {
        Ok(addresses) => addresses,
        Err(err) => {
            pairing.abandon(Metadata::default()).await;
            return Err(err.into());
        }
    };

    let mut probe = HandshakeProbe::new(socket);
    let hello = match read_client_hello(&mut probe, ctx.read_timeout).await {
        Ok(hello) => hello,
        Err(err) => {
            pairing.abandon(Metadata::default()).await;
            return Err(err);
        }
    };

    let facts = ConnectionFacts {
        servername: hello.server_name().to_string(),
        local_addr,
        remote_addr,
        addr: ctx.listen.clone(),
        port: ctx.port,
    };
    let metadata = facts.to_metadata();
    let plan = match plan(ctx, &hello, &facts).await {
        Ok(plan) => plan,
        Err(err) => {
            pairing.abandon(metadata).await;
            return Err(err);
        }
    };

    let decrypt = matches!(plan, Plan::Intercept { .. });
    let Pairing { upstream, starter } = pairing;
    let outbound = starter.start(metadata.with("decrypt", decrypt));
    let (_, inbound) = upstream.begin().await;

    match plan {
        Plan::Passthrough => {
            let replay = probe.pivot();
            if !replay.is_empty() && outbound.send(replay).await.is_err() {
                drop(outbound);
                drain(inbound).await;
                return Err(InterceptError::StreamClosed);
            }
            let stats = relay(probe, outbound, inbound, ctx.read_timeout).await;
            Ok(Outcome::Passthrough(stats))
        }
        Plan::Intercept { host, config } => {
            probe.rewind();
            let handshake = timeout(ctx.read_timeout, TlsAcceptor::from(config).accept(probe)).await;
            let session = match handshake {
                Ok(Ok(session)) => session,
                Ok(Err(err)) => {
                    drop(outbound);
                    drain(inbound).await;
                    return Err(InterceptError::handshake(host.to_string(), err));
                }
                Err(_) => {
                    drop(outbound);
                    drain(inbound).await;
                    return Err(InterceptError::ReadTimeout);
                }
            };
            let stats = relay(session, outbound, inbound, ctx.read_timeout).await;
            Ok(Outcome::Intercepted(stats))
        }
    }
}

async fn plan(
    ctx: &ListenerContext,
    hello: &ClientHello,
    facts: &ConnectionFacts,
) -> Result<Plan, InterceptError> {
    if !ctx.decision.evaluate(facts)? {
        return Ok(Plan::Passthrough);
    }
    if !hello.is_tls() {
        return Err(InterceptError::NotTls);
    }
    let authority = ctx.authority.as_ref().ok_or(InterceptError::NoAuthority)?;

    let host = HostIdentifier::from_server_name(hello.server_name(), facts.local_addr.ip());
    let issued = authority.issue(&host).await?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(issued.chain().to_vec(), issued.private_key())?;

    Ok(Plan::Intercept {
        host,
        config: Arc::new(config),
    })
}
