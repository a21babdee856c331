//! A minimal CoAP resource site: exact-path routing to `Resource`
//! trait objects plus an RFC 7641 Observe registry, in the spirit of
//! aiocoap's `site.add_resource(path_tuple, resource)` (see the
//! blockwise resources in the original `lwm2m.block` module).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::message::{Code, Message, MessageType};
use crate::transport::Endpoint;

/// An incoming CoAP request, narrowed to what a resource needs.
pub struct Request {
    pub message: Message,
    pub peer: SocketAddr,
}

impl Request {
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn content_format(&self) -> Option<u16> {
        self.message.options.content_format()
    }

    pub fn accept(&self) -> Option<u16> {
        self.message.options.accept()
    }

    pub fn uri_query(&self) -> Vec<String> {
        self.message.options.uri_query()
    }

    pub fn wants_observe(&self) -> bool {
        self.message.options.observe() == Some(0)
    }
}

/// A routable CoAP resource. Unimplemented methods answer 4.05 Method
/// Not Allowed, matching aiocoap's default `render_*` behavior.
#[async_trait]
pub trait Resource: Send + Sync {
    async fn render_get(&self, _req: &Request) -> Message {
        Message::new(MessageType::Acknowledgement, Code::METHOD_NOT_ALLOWED, 0)
    }

    async fn render_post(&self, _req: &Request) -> Message {
        Message::new(MessageType::Acknowledgement, Code::METHOD_NOT_ALLOWED, 0)
    }

    async fn render_put(&self, _req: &Request) -> Message {
        Message::new(MessageType::Acknowledgement, Code::METHOD_NOT_ALLOWED, 0)
    }

    async fn render_delete(&self, _req: &Request) -> Message {
        Message::new(MessageType::Acknowledgement, Code::METHOD_NOT_ALLOWED, 0)
    }
}

#[derive(Debug, Clone)]
struct Observer {
    peer: SocketAddr,
    token: Vec<u8>,
}

/// Tracks which peers are observing which paths and hands out the
/// monotonically increasing sequence numbers RFC 7641 requires.
#[derive(Default)]
pub struct ObserveRegistry {
    observers: Mutex<HashMap<Vec<String>, Vec<Observer>>>,
    sequence: Mutex<HashMap<Vec<String>, u32>>,
}

impl ObserveRegistry {
    pub fn new() -> ObserveRegistry {
        ObserveRegistry::default()
    }

    pub async fn register(&self, path: Vec<String>, peer: SocketAddr, token: Vec<u8>) {
        let mut observers = self.observers.lock().await;
        let entry = observers.entry(path).or_default();
        entry.retain(|o| o.peer != peer);
        entry.push(Observer { peer, token });
    }

    pub async fn unregister(&self, path: &[String], peer: SocketAddr) {
        let mut observers = self.observers.lock().await;
        if let Some(entry) = observers.get_mut(path) {
            entry.retain(|o| o.peer != peer);
        }
    }

    async fn next_sequence(&self, path: &[String]) -> u32 {
        let mut sequence = self.sequence.lock().await;
        let counter = sequence.entry(path.to_vec()).or_insert(0);
        *counter = (*counter + 1) & 0x00FF_FFFF;
        *counter
    }

    /// Push a notification carrying `payload` to every observer of
    /// `path`, each as its own confirmable exchange on `endpoint`.
    pub async fn notify(
        self: &Arc<Self>,
        endpoint: &Arc<Endpoint>,
        path: &[String],
        content_format: u16,
        payload: Vec<u8>,
    ) {
        let observers = {
            let observers = self.observers.lock().await;
            observers.get(path).cloned().unwrap_or_default()
        };
        if observers.is_empty() {
            return;
        }
        let seq = self.next_sequence(path).await;

        for observer in observers {
            let mut msg = Message::new(MessageType::Confirmable, Code::CONTENT, endpoint.next_message_id())
                .with_token(observer.token.clone())
                .with_payload(payload.clone());
            msg.options.push_uint(crate::options::OptionNumber::Observe, seq);
            msg.options
                .push_uint(crate::options::OptionNumber::ContentFormat, content_format as u32);

            let endpoint = Arc::clone(endpoint);
            let registry_path = path.to_vec();
            let registry = Arc::clone(self);
            tokio::spawn(async move {
                match endpoint.send_confirmable(msg, observer.peer).await {
                    Ok(()) => {}
                    Err(crate::transport::TransportError::Reset) => {
                        // RFC 7641 §3.6: an RST response cancels the observation.
                        registry.unregister(&registry_path, observer.peer).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, peer = %observer.peer, "observe notification undelivered");
                    }
                }
            });
        }
    }
}

/// Exact-path resource table: a request's Uri-Path segments must match
/// a registered path verbatim.
#[derive(Default)]
pub struct Site {
    resources: HashMap<Vec<String>, Arc<dyn Resource>>,
}

impl Site {
    pub fn new() -> Site {
        Site::default()
    }

    pub fn add_resource(&mut self, path: &[&str], resource: Arc<dyn Resource>) {
        self.resources
            .insert(path.iter().map(|s| s.to_string()).collect(), resource);
    }

    pub fn lookup(&self, path: &[String]) -> Option<Arc<dyn Resource>> {
        self.resources.get(path).cloned()
    }

    pub async fn dispatch(&self, message: Message, peer: SocketAddr) -> Message {
        let path = message.options.uri_path();
        let mid = message.message_id;
        let token = message.token.clone();
        let Some(resource) = self.lookup(&path) else {
            return not_found(mid, token);
        };
        let req = Request { message: message.clone(), peer };
        let mut response = match message.code {
            Code::GET => resource.render_get(&req).await,
            Code::POST => resource.render_post(&req).await,
            Code::PUT => resource.render_put(&req).await,
            Code::DELETE => resource.render_delete(&req).await,
            _ => Message::new(MessageType::Acknowledgement, Code::METHOD_NOT_ALLOWED, mid),
        };
        response.message_id = mid;
        response.token = token;
        if response.kind != MessageType::Reset {
            response.kind = if message.kind == MessageType::Confirmable {
                MessageType::Acknowledgement
            } else {
                MessageType::NonConfirmable
            };
        }
        response
    }
}

fn not_found(mid: u16, token: Vec<u8>) -> Message {
    Message::new(MessageType::Acknowledgement, Code::NOT_FOUND, mid).with_token(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Resource for Echo {
        async fn render_get(&self, _req: &Request) -> Message {
            Message::new(MessageType::Acknowledgement, Code::CONTENT, 0).with_payload(b"echo".to_vec())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_resource() {
        let mut site = Site::new();
        site.add_resource(&["3", "0", "0"], Arc::new(Echo));

        let mut req = Message::new(MessageType::Confirmable, Code::GET, 9);
        req.options.push_uri_path("3/0/0");
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let response = site.dispatch(req, peer).await;
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"echo");
        assert_eq!(response.kind, MessageType::Acknowledgement);
    }

    #[tokio::test]
    async fn dispatch_unregistered_path_is_not_found() {
        let site = Site::new();
        let req = Message::new(MessageType::Confirmable, Code::GET, 1);
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let response = site.dispatch(req, peer).await;
        assert_eq!(response.code, Code::NOT_FOUND);
    }

    #[tokio::test]
    async fn method_not_allowed_for_unsupported_verb() {
        let mut site = Site::new();
        site.add_resource(&["3", "0", "0"], Arc::new(Echo));
        let mut req = Message::new(MessageType::Confirmable, Code::DELETE, 2);
        req.options.push_uri_path("3/0/0");
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let response = site.dispatch(req, peer).await;
        assert_eq!(response.code, Code::METHOD_NOT_ALLOWED);
    }
}
