//! TLS listener module
//!
//! Accepts TCP connections and pairs each one with a stream request coming
//! from the pipeline. For every connection a stream is announced downstream
//! carrying what the client sends, and the paired upstream stream is written
//! back to the client.
//!
//! Whether a connection is decrypted is decided per connection by the
//! `--decrypt` template, after the ClientHello has been read but before any
//! certificate is presented:
//!
//! - passthrough: the bytes read so far are replayed and the connection is
//!   relayed raw in both directions
//! - intercept: a leaf certificate for the server name is issued by the CA,
//!   the handshake completes, and plaintext is relayed
//!
//! ```text
//! piperelay -- tls --listen :8443 --decrypt '{{ servername == "example.test" }}' -- stdout
//! ```

pub mod ca;
pub mod cert_cache;
pub mod connection;
pub mod decision;
pub mod error;
pub mod probe;
pub mod relay;
pub mod rendezvous;

pub use ca::{CertificateAuthority, HostIdentifier, IssuedCert};
pub use cert_cache::CacheStats;
pub use decision::{ConnectionFacts, DecisionTemplate};
pub use error::{CaError, DecisionError, InterceptError};
pub use probe::{ClientHello, HandshakeProbe};

use crate::config::GlobalFlags;
use crate::error::ModuleError;
use crate::message::{announce, drain, Message};
use crate::module::{finish, send_control, Module, ModuleIo, Worker};
use crate::registry::ModuleArgs;
use clap::Parser;
use connection::{serve_connection, ListenerContext};
use rendezvous::{Pairing, Rendezvous, WaitingConnection};
use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const MODULE: &str = "tls";

/// Flags of the `tls` module
#[derive(Debug, Clone, Parser)]
#[command(
    name = "tls",
    no_binary_name = true,
    about = "TLS server that relays or decrypts each connection"
)]
pub struct TlsArgs {
    /// Listen address, e.g. 127.0.0.1:8443 or :8443
    #[arg(long)]
    pub listen: String,

    /// How long a connection waits to be paired with a pipeline stream
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    pub connect_timeout: Duration,

    /// Maximum idle time between two reads from a client
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    pub read_timeout: Duration,

    /// Template rendering to a boolean; true decrypts the connection.
    /// Variables: servername, local_addr, remote_addr, addr, port. Function: rand(n)
    #[arg(long, default_value = "")]
    pub decrypt: String,

    /// CA certificate (PEM); a CA is generated when omitted
    #[arg(long, requires = "ca_key")]
    pub ca_cert: Option<PathBuf>,

    /// CA private key (PKCS#8 PEM)
    #[arg(long, requires = "ca_cert")]
    pub ca_key: Option<PathBuf>,

    /// Number of leaf certificates kept in memory; 0 disables caching
    #[arg(long, default_value_t = ca::DEFAULT_CACHE_SIZE)]
    pub cert_cache_size: usize,
}

impl TlsArgs {
    /// Arguments for a listener on `listen` with default settings
    pub fn new(listen: impl Into<String>) -> Self {
        Self {
            listen: listen.into(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(15),
            decrypt: String::new(),
            ca_cert: None,
            ca_key: None,
            cert_cache_size: ca::DEFAULT_CACHE_SIZE,
        }
    }
}

pub fn construct(args: ModuleArgs<'_>) -> Result<Box<dyn Module>, clap::Error> {
    let parsed = TlsArgs::try_parse_from(args.args)?;
    Ok(Box::new(TlsServer::new(parsed)))
}

/// The `tls` module
pub struct TlsServer {
    args: TlsArgs,
    authority: Option<Arc<CertificateAuthority>>,
    bound: Arc<OnceLock<SocketAddr>>,
}

impl TlsServer {
    pub fn new(args: TlsArgs) -> Self {
        Self {
            args,
            authority: None,
            bound: Arc::new(OnceLock::new()),
        }
    }

    /// Use an existing CA instead of loading or generating one
    pub fn with_authority(mut self, authority: Arc<CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Address the listener is bound to, set during `init`
    pub fn bound_addr(&self) -> Arc<OnceLock<SocketAddr>> {
        Arc::clone(&self.bound)
    }
}

impl Module for TlsServer {
    fn name(&self) -> &'static str {
        MODULE
    }

    fn init(self: Box<Self>, io: ModuleIo, global: &GlobalFlags) -> Result<Worker, ModuleError> {
        let TlsServer {
            args,
            authority,
            bound,
        } = *self;

        if args.read_timeout.is_zero() {
            return Err(ModuleError::invalid_flag(
                "--read-timeout",
                "cannot be negative or zero",
            ));
        }
        if args.connect_timeout.is_zero() {
            return Err(ModuleError::invalid_flag(
                "--connect-timeout",
                "cannot be negative or zero",
            ));
        }
        if args.ca_cert.is_some() != args.ca_key.is_some() {
            return Err(ModuleError::invalid_flag(
                "--ca-cert",
                "and --ca-key must be given together",
            ));
        }

        let decision = DecisionTemplate::parse(&args.decrypt)?;
        let authority = match authority {
            _ if !decision.may_decrypt() => None,
            Some(authority) => Some(authority),
            None => Some(Arc::new(prepare_authority(&args)?)),
        };

        let listener = bind(&args.listen)?;
        let local_addr = listener.local_addr()?;
        let _ = bound.set(local_addr);
        info!(module = MODULE, listen = %local_addr, decrypt = decision.may_decrypt(), "listening");

        let ctx = Arc::new(ListenerContext {
            authority,
            decision,
            listen: args.listen,
            port: local_addr.port(),
            read_timeout: args.read_timeout,
            connect_timeout: args.connect_timeout,
        });
        Ok(Box::pin(run_listener(
            listener,
            ctx,
            io,
            global.multi_streams,
            global.stream_limit(),
        )))
    }
}

fn prepare_authority(args: &TlsArgs) -> Result<CertificateAuthority, ModuleError> {
    if let (Some(cert), Some(key)) = (&args.ca_cert, &args.ca_key) {
        return Ok(CertificateAuthority::load(cert, key, args.cert_cache_size)?);
    }
    let authority = CertificateAuthority::generate(args.cert_cache_size)?;
    info!(
        module = MODULE,
        certificate = %authority.cert_pem(),
        private_key = %authority.key_pem(),
        "generated CA, trust this certificate on clients"
    );
    Ok(authority)
}

fn bind(listen: &str) -> Result<TcpListener, ModuleError> {
    // ":port" listens on every interface
    let listen = match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    };
    let addr = listen
        .to_socket_addrs()
        .map_err(|e| ModuleError::invalid_flag("--listen", e.to_string()))?
        .next()
        .ok_or_else(|| ModuleError::invalid_flag("--listen", format!("{listen:?} does not resolve")))?;
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

/// A connection asking to be paired
struct Arrival {
    peer: SocketAddr,
    reply: oneshot::Sender<Pairing>,
}

async fn run_listener(
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    io: ModuleIo,
    multi_streams: bool,
    stream_limit: usize,
) {
    let ModuleIo { mut input, output } = io;
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (arrivals_tx, mut arrivals) = mpsc::channel(stream_limit);

    tracker.spawn(accept_loop(
        listener,
        Arc::clone(&ctx),
        arrivals_tx,
        cancel.clone(),
        tracker.clone(),
        Arc::new(Semaphore::new(stream_limit)),
    ));

    let mut rendezvous = Rendezvous::default();
    let mut outgoing: VecDeque<Message> = VecDeque::new();
    let deadline = tokio::time::sleep(ctx.connect_timeout);
    tokio::pin!(deadline);
    let mut armed = true;

    loop {
        tokio::select! {
            _ = &mut deadline, if armed => {
                info!(
                    module = MODULE,
                    "connect timeout reached, nobody connected and no stream request arrived"
                );
                break;
            }
            permit = output.reserve(), if !outgoing.is_empty() => {
                match (permit, outgoing.pop_front()) {
                    (Ok(permit), Some(message)) => permit.send(message),
                    (Err(_), _) => {
                        debug!(module = MODULE, "downstream control queue closed");
                        outgoing.clear();
                    }
                    (Ok(_), None) => {}
                }
            }
            arrival = arrivals.recv() => {
                let Some(Arrival { peer, reply }) = arrival else {
                    break;
                };
                let (starter, announced) = announce();
                outgoing.push_back(Message::Announce(announced));
                let waiting = WaitingConnection { peer, starter, reply };
                if rendezvous.connection_arrived(waiting) && !multi_streams {
                    break;
                }
            }
            message = input.recv() => {
                armed = false;
                match message {
                    None | Some(Message::Terminate) => break,
                    Some(Message::Announce(upstream)) => {
                        if rendezvous.request_arrived(upstream) && !multi_streams {
                            break;
                        }
                    }
                }
            }
        }
    }

    // The paired connection's announcement may still be queued
    for message in outgoing {
        send_control(MODULE, &output, message).await;
    }
    cancel.cancel();
    info!(module = MODULE, paired = rendezvous.paired(), "listener stopping");
    for upstream in rendezvous.close() {
        tracker.spawn(async move {
            let (_, inbound) = upstream.begin().await;
            drain(inbound).await;
        });
    }
    tracker.close();
    tracker.wait().await;

    send_control(MODULE, &output, Message::Terminate).await;
    finish(MODULE, input, output).await;
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
    arrivals: mpsc::Sender<Arrival>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((socket, peer)) => {
                debug!(module = MODULE, remote_addr = %peer, "accepted connection");
                tracker.spawn(handle_connection(
                    Arc::clone(&ctx),
                    socket,
                    peer,
                    arrivals.clone(),
                    cancel.clone(),
                    Arc::clone(&permits),
                ));
            }
            Err(err) => {
                warn!(module = MODULE, error = %err, "error accepting connection");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn handle_connection(
    ctx: Arc<ListenerContext>,
    socket: TcpStream,
    peer: SocketAddr,
    arrivals: mpsc::Sender<Arrival>,
    cancel: CancellationToken,
    permits: Arc<Semaphore>,
) {
    let _permit = tokio::select! {
        _ = cancel.cancelled() => return,
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    let (reply, paired) = oneshot::channel();
    tokio::select! {
        _ = cancel.cancelled() => return,
        sent = arrivals.send(Arrival { peer, reply }) => {
            if sent.is_err() {
                return;
            }
        }
    }

    let pairing = tokio::select! {
        biased;
        result = timeout(ctx.connect_timeout, paired) => match result {
            Ok(Ok(pairing)) => pairing,
            Ok(Err(_)) => return,
            Err(_) => {
                info!(module = MODULE, remote_addr = %peer, "connect timeout reached, dropping connection");
                return;
            }
        },
        _ = cancel.cancelled() => {
            debug!(module = MODULE, remote_addr = %peer, "listener stopped before pairing");
            return;
        }
    };

    match serve_connection(&ctx, socket, pairing).await {
        Ok(outcome) => {
            let stats = outcome.stats();
            info!(
                module = MODULE,
                remote_addr = %peer,
                decrypt = outcome.decrypted(),
                received = stats.received,
                sent = stats.sent,
                "connection closed"
            );
        }
        Err(err) => {
            warn!(module = MODULE, remote_addr = %peer, error = %err, "connection failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = TlsArgs::try_parse_from(["--listen", "127.0.0.1:0"]).unwrap();
        assert_eq!(args.connect_timeout, Duration::from_secs(30));
        assert_eq!(args.read_timeout, Duration::from_secs(15));
        assert!(args.decrypt.is_empty());
        assert_eq!(args.cert_cache_size, ca::DEFAULT_CACHE_SIZE);
    }

    #[test]
    fn test_args_humantime() {
        let args = TlsArgs::try_parse_from([
            "--listen",
            ":8443",
            "--connect-timeout",
            "1m",
            "--read-timeout",
            "500ms",
        ])
        .unwrap();
        assert_eq!(args.connect_timeout, Duration::from_secs(60));
        assert_eq!(args.read_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_ca_flags_required_together() {
        assert!(TlsArgs::try_parse_from(["--listen", ":0", "--ca-cert", "ca.pem"]).is_err());
    }

    #[test]
    fn test_listen_required() {
        assert!(TlsArgs::try_parse_from(Vec::<String>::new()).is_err());
    }
}
