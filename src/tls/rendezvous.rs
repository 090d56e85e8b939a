//! Pairing of accepted connections with pipeline stream requests
//!
//! Owned by the listener's control loop; connection tasks never touch it
//! directly. Both sides are served first come, first served.

use crate::message::{drain, Announce, Metadata, StreamStarter};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tracing::debug;

/// What a connection task receives once paired
pub struct Pairing {
    /// Stream coming from the pipeline, to be written to the client
    pub upstream: Announce,
    /// Stream going to the pipeline, fed from the client
    pub starter: StreamStarter,
}

impl Pairing {
    /// Give up before any data moved
    ///
    /// The outbound stream is started with `metadata` and closed empty, and
    /// the upstream stream is drained so its producer can finish.
    pub async fn abandon(self, metadata: Metadata) {
        drop(self.starter.start(metadata));
        let (_, inbound) = self.upstream.begin().await;
        drain(inbound).await;
    }
}

/// A connection waiting for a stream request
pub struct WaitingConnection {
    pub peer: SocketAddr,
    pub starter: StreamStarter,
    pub reply: oneshot::Sender<Pairing>,
}

#[derive(Default)]
pub struct Rendezvous {
    connections: VecDeque<WaitingConnection>,
    requests: VecDeque<Announce>,
    paired: u64,
}

impl Rendezvous {
    /// Queue a connection; returns true if it was paired
    pub fn connection_arrived(&mut self, waiting: WaitingConnection) -> bool {
        self.connections.push_back(waiting);
        self.try_pair()
    }

    /// Queue a stream request; returns true if it was paired
    pub fn request_arrived(&mut self, upstream: Announce) -> bool {
        self.requests.push_back(upstream);
        self.try_pair()
    }

    pub fn paired(&self) -> u64 {
        self.paired
    }

    pub fn waiting_connections(&self) -> usize {
        self.connections.len()
    }

    pub fn waiting_requests(&self) -> usize {
        self.requests.len()
    }

    fn try_pair(&mut self) -> bool {
        while !self.requests.is_empty() {
            let Some(waiting) = self.connections.pop_front() else {
                return false;
            };
            let Some(upstream) = self.requests.pop_front() else {
                return false;
            };
            let pairing = Pairing {
                upstream,
                starter: waiting.starter,
            };
            match waiting.reply.send(pairing) {
                Ok(()) => {
                    self.paired += 1;
                    debug!(remote_addr = %waiting.peer, "connection paired with stream request");
                    return true;
                }
                Err(unclaimed) => {
                    // Connection gave up; keep the request for the next one
                    debug!(remote_addr = %waiting.peer, "connection left before pairing");
                    self.requests.push_front(unclaimed.upstream);
                }
            }
        }
        false
    }

    /// Drop waiting connections and hand back unpaired requests
    pub fn close(self) -> Vec<Announce> {
        drop(self.connections);
        self.requests.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::announce;

    fn connection() -> (WaitingConnection, oneshot::Receiver<Pairing>) {
        let (starter, _announced) = announce();
        let (reply, paired) = oneshot::channel();
        (
            WaitingConnection {
                peer: "127.0.0.1:40000".parse().unwrap(),
                starter,
                reply,
            },
            paired,
        )
    }

    fn request() -> Announce {
        announce().1
    }

    #[test]
    fn test_fifo_pairing() {
        let mut rendezvous = Rendezvous::default();
        let (first, mut first_rx) = connection();
        let (second, mut second_rx) = connection();

        assert!(!rendezvous.connection_arrived(first));
        assert!(!rendezvous.connection_arrived(second));
        assert!(rendezvous.request_arrived(request()));

        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_err());
        assert_eq!(rendezvous.waiting_connections(), 1);
        assert_eq!(rendezvous.paired(), 1);
    }

    #[test]
    fn test_request_waits_for_connection() {
        let mut rendezvous = Rendezvous::default();
        assert!(!rendezvous.request_arrived(request()));
        assert_eq!(rendezvous.waiting_requests(), 1);

        let (conn, mut rx) = connection();
        assert!(rendezvous.connection_arrived(conn));
        assert!(rx.try_recv().is_ok());
        assert_eq!(rendezvous.waiting_requests(), 0);
    }

    #[test]
    fn test_departed_connection_skipped() {
        let mut rendezvous = Rendezvous::default();
        let (gone, gone_rx) = connection();
        let (live, mut live_rx) = connection();
        drop(gone_rx);

        rendezvous.connection_arrived(gone);
        rendezvous.connection_arrived(live);
        assert!(rendezvous.request_arrived(request()));
        assert!(live_rx.try_recv().is_ok());
        assert_eq!(rendezvous.paired(), 1);
    }

    #[test]
    fn test_request_kept_when_only_connection_departed() {
        let mut rendezvous = Rendezvous::default();
        let (gone, gone_rx) = connection();
        drop(gone_rx);

        rendezvous.connection_arrived(gone);
        assert!(!rendezvous.request_arrived(request()));
        assert_eq!(rendezvous.close().len(), 1);
    }
}
