//! UDP transport with RFC 7252 §4.2 confirmable-message semantics:
//! exponential-backoff retransmission, message-id de-duplication for
//! ACKs, and token matching for separate (non-piggybacked) responses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};

use crate::message::{Code, Message, MessageType};

/// RFC 7252 §4.8 default transmission parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetransmitConfig {
    pub ack_timeout: Duration,
    pub random_factor: f64,
    pub max_retransmit: u8,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        RetransmitConfig {
            ack_timeout: Duration::from_secs(2),
            random_factor: 1.5,
            max_retransmit: 4,
        }
    }
}

impl RetransmitConfig {
    fn initial_timeout(self) -> Duration {
        let factor = 1.0 + rand::thread_rng().gen::<f64>() * (self.random_factor - 1.0);
        self.ack_timeout.mul_f64(factor)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error on CoAP socket: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response after {0} retransmissions")]
    Timeout(u8),
    #[error("peer reset the exchange")]
    Reset,
    #[error("exchange was dropped before completion")]
    Cancelled,
}

struct Pending {
    by_mid: HashMap<u16, oneshot::Sender<Message>>,
    by_token: HashMap<Vec<u8>, oneshot::Sender<Message>>,
}

/// A CoAP endpoint bound to one UDP socket, shared by the client side
/// (outbound requests to the LwM2M server) and the server side
/// (inbound requests from it) the way a single aiocoap context serves
/// both roles over one transport.
pub struct Endpoint {
    socket: UdpSocket,
    next_mid: AtomicU16,
    next_token: AtomicU64,
    pending: Mutex<Pending>,
    retransmit: RetransmitConfig,
}

impl Endpoint {
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Endpoint>, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Endpoint {
            socket,
            next_mid: AtomicU16::new(rand::thread_rng().gen()),
            next_token: AtomicU64::new(rand::thread_rng().gen()),
            pending: Mutex::new(Pending {
                by_mid: HashMap::new(),
                by_token: HashMap::new(),
            }),
            retransmit: RetransmitConfig::default(),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn next_message_id(&self) -> u16 {
        self.next_mid.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_token(&self) -> Vec<u8> {
        self.next_token.fetch_add(1, Ordering::Relaxed).to_be_bytes().to_vec()
    }

    async fn send(&self, msg: &Message, peer: SocketAddr) -> Result<(), TransportError> {
        self.socket.send_to(&msg.encode(), peer).await?;
        Ok(())
    }

    /// Send a confirmable message and retransmit until any ACK or Reset
    /// arrives, without expecting a separate response. Used for Observe
    /// notifications (RFC 7641 §3.4), where the ACK itself is the
    /// delivery confirmation and carries no payload of its own.
    pub async fn send_confirmable(&self, msg: Message, peer: SocketAddr) -> Result<(), TransportError> {
        let mid_rx = {
            let mut pending = self.pending.lock().await;
            let (tx, rx) = oneshot::channel();
            pending.by_mid.insert(msg.message_id, tx);
            rx
        };

        let mut mid_rx = mid_rx;
        let mut timeout = self.retransmit.initial_timeout();
        let mut attempt = 0u8;
        let result = loop {
            self.send(&msg, peer).await?;
            match tokio::time::timeout(timeout, &mut mid_rx).await {
                Ok(Ok(ack)) => break Ok(ack),
                Ok(Err(_)) => break Err(TransportError::Cancelled),
                Err(_elapsed) => {
                    attempt += 1;
                    if attempt > self.retransmit.max_retransmit {
                        break Err(TransportError::Timeout(attempt - 1));
                    }
                    timeout *= 2;
                }
            }
        };
        self.pending.lock().await.by_mid.remove(&msg.message_id);
        match result? {
            ack if ack.kind == MessageType::Reset => Err(TransportError::Reset),
            _ => Ok(()),
        }
    }

    /// Send a request with confirmable retransmission and return the
    /// matching response, whether piggybacked on the ACK or delivered
    /// as a later separate confirmable/non-confirmable message.
    pub async fn request(&self, msg: Message, peer: SocketAddr) -> Result<Message, TransportError> {
        let mid_rx = {
            let mut pending = self.pending.lock().await;
            let (tx, rx) = oneshot::channel();
            pending.by_mid.insert(msg.message_id, tx);
            rx
        };
        let token_rx = {
            let mut pending = self.pending.lock().await;
            let (tx, rx) = oneshot::channel();
            pending.by_token.insert(msg.token.clone(), tx);
            rx
        };

        let mut mid_rx = mid_rx;
        let mut timeout = self.retransmit.initial_timeout();
        let result = 'retransmit: loop {
            let mut attempt = 0u8;
            loop {
                self.send(&msg, peer).await?;
                match tokio::time::timeout(timeout, &mut mid_rx).await {
                    Ok(Ok(ack)) => break 'retransmit Ok(ack),
                    Ok(Err(_)) => break 'retransmit Err(TransportError::Cancelled),
                    Err(_elapsed) => {
                        attempt += 1;
                        if attempt > self.retransmit.max_retransmit {
                            break 'retransmit Err(TransportError::Timeout(attempt - 1));
                        }
                        timeout *= 2;
                    }
                }
            }
        };

        self.pending.lock().await.by_mid.remove(&msg.message_id);

        match result {
            Ok(ack) if ack.kind == MessageType::Reset => {
                self.pending.lock().await.by_token.remove(&msg.token);
                Err(TransportError::Reset)
            }
            Ok(ack) if ack.code != Code::EMPTY => {
                self.pending.lock().await.by_token.remove(&msg.token);
                Ok(ack)
            }
            Ok(_empty_ack) => {
                // Response will arrive separately, matched by token.
                token_rx.await.map_err(|_| TransportError::Cancelled)
            }
            Err(e) => {
                self.pending.lock().await.by_token.remove(&msg.token);
                Err(e)
            }
        }
    }

    /// Send a message with no reliability layer (NON requests, empty
    /// ACKs, and Reset replies all skip the retransmission path).
    pub async fn send_unreliable(&self, msg: &Message, peer: SocketAddr) -> Result<(), TransportError> {
        self.send(msg, peer).await
    }

    /// Receive and decode the next datagram. Returns `None` on a
    /// malformed datagram (logged and dropped, never fatal).
    async fn recv_one(&self) -> Result<Option<(Message, SocketAddr)>, TransportError> {
        let mut buf = vec![0u8; 2048];
        let (n, peer) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        match Message::decode(&buf) {
            Ok(msg) => Ok(Some((msg, peer))),
            Err(e) => {
                tracing::warn!(error = %e, from = %peer, "dropping malformed CoAP datagram");
                Ok(None)
            }
        }
    }

    /// Resolve a reply against the pending-exchange tables. Returns
    /// `Some(message)` when no pending exchange claimed it, meaning the
    /// caller should treat it as a fresh incoming request.
    async fn resolve_pending(&self, msg: Message, peer: SocketAddr) -> Option<(Message, SocketAddr)> {
        if matches!(msg.kind, MessageType::Acknowledgement | MessageType::Reset) {
            let mut pending = self.pending.lock().await;
            if let Some(tx) = pending.by_mid.remove(&msg.message_id) {
                let _ = tx.send(msg);
            }
            // An ACK/Reset with no matching exchange is stray; drop it either way.
            return None;
        }

        if msg.code.class() >= 2 {
            let mut pending = self.pending.lock().await;
            if let Some(tx) = pending.by_token.remove(&msg.token) {
                if msg.kind == MessageType::Confirmable {
                    let ack = Message::ack(msg.message_id, vec![], Code::EMPTY);
                    drop(pending);
                    let _ = self.send_unreliable(&ack, peer).await;
                }
                let _ = tx.send(msg);
                return None;
            }
        }

        Some((msg, peer))
    }

    /// Drive the endpoint forever, handing every datagram that isn't
    /// claimed by a pending exchange to `on_request`.
    pub async fn serve<F, Fut>(self: &Arc<Self>, mut on_request: F) -> Result<(), TransportError>
    where
        F: FnMut(Message, SocketAddr) -> Fut,
        Fut: std::future::Future<Output = Option<Message>>,
    {
        loop {
            let Some((msg, peer)) = self.recv_one().await? else {
                continue;
            };
            let Some((msg, peer)) = self.resolve_pending(msg, peer).await else {
                continue;
            };
            if !msg.code.is_request() {
                continue;
            }
            if let Some(response) = on_request(msg, peer).await {
                if let Err(e) = self.send(&response, peer).await {
                    tracing::warn!(error = %e, %peer, "failed to send CoAP response");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_receives_piggybacked_response() {
        let server = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                server
                    .serve(|req, _peer| async move {
                        Some(Message::ack(req.message_id, req.token.clone(), Code::CONTENT).with_payload(b"hi".to_vec()))
                    })
                    .await
            }
        });

        let mut req = Message::new(MessageType::Confirmable, Code::GET, client.next_message_id());
        req.token = client.next_token();
        let response = client.request(req, server_addr).await.unwrap();
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"hi");

        server_task.abort();
    }
}
