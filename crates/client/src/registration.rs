//! Registration driver: initial `POST /rd`, `Location-Path` capture,
//! and a refresh loop that races the lifetime timer against a
//! topology-change signal, falling back to a fresh register on failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lwm2m_coap::client::RequestBuilder;
use lwm2m_coap::{Code, Endpoint, MediaType};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{RegistrationError, TransportError};
use crate::tree::Tree;

/// One active registration: the token the server handed back in its
/// `Location-Path` and the lifetime currently in force.
struct Registration {
    token: String,
    lifetime: Duration,
}

async fn links_payload(tree: &Arc<AsyncMutex<Tree>>) -> Vec<u8> {
    let guard = tree.lock().await;
    guard.registration_links().join(",").into_bytes()
}

/// `POST /rd?ep=&b=U&lt=&lwm2m=1.0` with the current link-format body,
/// expecting `Created` and a `("rd", "<token>")` Location-Path.
async fn initial_register(
    endpoint: &Arc<Endpoint>,
    peer: SocketAddr,
    tree: &Arc<AsyncMutex<Tree>>,
    endpoint_name: &str,
    lifetime: Duration,
) -> Result<Registration, RegistrationError> {
    let payload = links_payload(tree).await;
    let request = RequestBuilder::new(endpoint, Code::POST, "rd")
        .query(&format!("ep={endpoint_name}"))
        .query("b=U")
        .query(&format!("lt={}", lifetime.as_secs()))
        .query("lwm2m=1.0")
        .content_format(MediaType::LinkFormat)
        .payload(payload);
    let response = request
        .send(endpoint, peer)
        .await
        .map_err(|e| RegistrationError::Transport(TransportError::Coap(e)))?;
    if response.code != Code::CREATED {
        return Err(RegistrationError::UnexpectedResponse(response.code));
    }
    let location = response.options.location_path();
    let token = location.last().cloned().unwrap_or_default();
    Ok(Registration { token, lifetime })
}

/// `POST /rd/<token>` with the given payload (empty for a plain
/// keep-alive, a fresh links list after a topology change).
async fn update(
    endpoint: &Arc<Endpoint>,
    peer: SocketAddr,
    token: &str,
    payload: Vec<u8>,
) -> Result<(), RegistrationError> {
    let mut request = RequestBuilder::new(endpoint, Code::POST, &format!("rd/{token}"));
    if !payload.is_empty() {
        request = request.content_format(MediaType::LinkFormat).payload(payload);
    }
    let response = request
        .send(endpoint, peer)
        .await
        .map_err(|e| RegistrationError::Transport(TransportError::Coap(e)))?;
    if !response.code.is_successful() {
        return Err(RegistrationError::UnexpectedResponse(response.code));
    }
    Ok(())
}

/// Drives registration for the lifetime of one bearer-supervisor attempt:
/// registers once, then refreshes forever, racing `lifetime - 1` seconds
/// against `Tree::topology_changed` and falling back to a fresh initial
/// register whenever a refresh comes back non-2.xx. Returns only on a
/// transport error the caller should treat as a restart signal.
pub async fn run(
    endpoint: &Arc<Endpoint>,
    peer: SocketAddr,
    tree: &Arc<AsyncMutex<Tree>>,
    endpoint_name: &str,
    initial_lifetime: Duration,
) -> Result<(), RegistrationError> {
    let mut registration = initial_register(endpoint, peer, tree, endpoint_name, initial_lifetime).await?;

    loop {
        let refresh_after = registration.lifetime.saturating_sub(Duration::from_secs(1));
        let topology_changed = tree.lock().await.topology_changed.clone();

        tokio::select! {
            _ = tokio::time::sleep(refresh_after) => {
                match update(endpoint, peer, &registration.token, Vec::new()).await {
                    Ok(()) => {}
                    Err(_) => {
                        registration = initial_register(endpoint, peer, tree, endpoint_name, registration.lifetime).await?;
                    }
                }
            }
            _ = topology_changed.notified() => {
                let payload = links_payload(tree).await;
                match update(endpoint, peer, &registration.token, payload).await {
                    Ok(()) => {}
                    Err(_) => {
                        registration = initial_register(endpoint, peer, tree, endpoint_name, registration.lifetime).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::base_object::BaseObject;
    use crate::tree::instance::ObjectInstance;
    use lwm2m_coap::{Message, MessageType};
    use std::collections::BTreeMap;

    async fn device_tree() -> Arc<AsyncMutex<Tree>> {
        let mut tree = Tree::new();
        let mut instances = BTreeMap::new();
        instances.insert(0, ObjectInstance::new());
        tree.insert_object(3, BaseObject::static_object(instances));
        Arc::new(AsyncMutex::new(tree))
    }

    #[tokio::test]
    async fn initial_register_captures_location_path_token() {
        let tree = device_tree().await;
        let client = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            server
                .serve(|req, _peer| async move {
                    assert_eq!(req.code, Code::POST);
                    assert_eq!(req.options.uri_path(), vec!["rd".to_string()]);
                    let mut response = Message::new(MessageType::Acknowledgement, Code::CREATED, req.message_id)
                        .with_token(req.token.clone());
                    response.options.push(lwm2m_coap::OptionNumber::LocationPath, b"rd".to_vec());
                    response.options.push(lwm2m_coap::OptionNumber::LocationPath, b"abc123".to_vec());
                    Some(response)
                })
                .await
        });

        let registration = initial_register(&client, server_addr, &tree, "urn:imei:123", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(registration.token, "abc123");
        server_task.abort();
    }

    #[tokio::test]
    async fn non_created_response_is_an_error() {
        let tree = device_tree().await;
        let client = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            server
                .serve(|req, _peer| async move {
                    Some(Message::ack(req.message_id, req.token.clone(), Code::BAD_REQUEST))
                })
                .await
        });

        let result = initial_register(&client, server_addr, &tree, "urn:imei:123", Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(RegistrationError::UnexpectedResponse(Code::BAD_REQUEST))));
        server_task.abort();
    }
}
