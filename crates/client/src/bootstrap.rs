//! Bootstrap handler: drives the client side of
//! `NONE -> REQUEST_SENT -> WRITING -> FINISHED` while the
//! bootstrap server resets Objects 0/1 and writes fresh security/server
//! resources through the same CoAP site the management server talks to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lwm2m_coap::client::RequestBuilder;
use lwm2m_coap::{Code, Endpoint, MediaType};
use lwm2m_core::{Path, Value};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{BootstrapError, TransportError};
use crate::objects::{security, server};
use crate::tree::Tree;

/// The credentials and lifetime the bootstrap server hands back,
/// overriding whatever the CLI passed in as a starting point: read
/// back from `/0/1/0` (server URI), `/0/1/3` and `/0/1/5` (PSK
/// identity and secret), and `/1/0/1` (lifetime) once the bootstrap
/// server finishes writing.
pub struct BootstrapResult {
    pub server_uri: String,
    pub psk_identity: Vec<u8>,
    pub psk: Vec<u8>,
    pub lifetime: Option<u32>,
}

/// How long to wait for the bootstrap server to POST `/bs` once the
/// initial `/bs?ep=` request has been acknowledged. The server-side CoAP
/// site (carrying `BootstrapFinishResource`) must already be serving by
/// the time this is called, or the POST has nowhere to land.
const FINISH_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs one bootstrap attempt: POST `/bs?ep=<endpoint>` to `peer`, wait
/// for the bootstrap server to finish writing into the tree and POST
/// back to the local `/bs`, then read the result out of Objects 0/1.
///
/// `finished` is the same `Notify` the site's `BootstrapFinishResource`
/// holds — the caller must have it registered in the site being served
/// on `endpoint` before calling this.
pub async fn run(
    endpoint: &Arc<Endpoint>,
    peer: SocketAddr,
    tree: &Arc<AsyncMutex<Tree>>,
    endpoint_name: &str,
    finished: Arc<tokio::sync::Notify>,
) -> Result<BootstrapResult, BootstrapError> {
    let waiter = finished.notified();
    tokio::pin!(waiter);

    let request = RequestBuilder::new(endpoint, Code::POST, "bs").query(&format!("ep={endpoint_name}"));
    let response = request
        .send(endpoint, peer)
        .await
        .map_err(|e| BootstrapError::Transport(TransportError::Coap(e)))?;
    if response.code != Code::CHANGED {
        return Err(BootstrapError::UnexpectedResponse(response.code));
    }

    match tokio::time::timeout(FINISH_IDLE_TIMEOUT, &mut waiter).await {
        Ok(()) => {}
        Err(_elapsed) => return Err(BootstrapError::IdleTimeout),
    }

    let guard = tree.lock().await;
    let server_uri = read_string(&guard, Path::Resource(0, 1, security::RES_LWM2M_SERVER_URI)).unwrap_or_default();
    let psk_identity = read_opaque(&guard, Path::Resource(0, 1, security::RES_PUBLIC_KEY_OR_IDENTITY)).unwrap_or_default();
    let psk = read_opaque(&guard, Path::Resource(0, 1, security::RES_SECRET_KEY)).unwrap_or_default();
    let lifetime = guard.object(1).and_then(server::read_lifetime);
    drop(guard);

    Ok(BootstrapResult {
        server_uri,
        psk_identity,
        psk,
        lifetime,
    })
}

fn read_string(tree: &Tree, path: Path) -> Option<String> {
    let bytes = tree.read(path).ok()?;
    let (_, _, value_bytes, _) = lwm2m_core::tlv::decode_tlv(&bytes).ok()?;
    match lwm2m_core::tlv::decode_value(lwm2m_core::ValueKind::String, value_bytes).ok()? {
        Value::String(s) => Some(s),
        _ => None,
    }
}

fn read_opaque(tree: &Tree, path: Path) -> Option<Vec<u8>> {
    let bytes = tree.read(path).ok()?;
    let (_, _, value_bytes, _) = lwm2m_core::tlv::decode_tlv(&bytes).ok()?;
    match lwm2m_core::tlv::decode_value(lwm2m_core::ValueKind::Opaque, value_bytes).ok()? {
        Value::Opaque(v) => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap_site::{build_site, BootstrapFinishResource, FixedResources};
    use crate::objects::{security, server};
    use crate::tree::observe::Notifier;
    use async_trait::async_trait;

    fn noop_fixed() -> FixedResources {
        struct NotFound;
        #[async_trait]
        impl lwm2m_coap::Resource for NotFound {}
        FixedResources {
            bootstrap_finish: None,
            firmware_package: Arc::new(NotFound),
            software_package: Arc::new(NotFound),
            syslog_read_all: Arc::new(NotFound),
            syslog_read_incremental: Arc::new(NotFound),
        }
    }

    async fn client_tree() -> Arc<AsyncMutex<Tree>> {
        let mut tree = Tree::new();
        tree.insert_object(0, security::new_base_object("coap://bs:5683", "urn:imei:test"));
        tree.insert_object(1, server::new_base_object(86_400));
        Arc::new(AsyncMutex::new(tree))
    }

    #[tokio::test]
    async fn successful_bootstrap_reads_back_credentials_after_finish() {
        let tree = client_tree().await;
        let client_endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let bs_server_endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let bs_addr = bs_server_endpoint.local_addr().unwrap();

        let registry = Arc::new(lwm2m_coap::ObserveRegistry::new());
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry), Arc::clone(&client_endpoint)));
        let finished = Arc::new(tokio::sync::Notify::new());
        let mut fixed = noop_fixed();
        fixed.bootstrap_finish = Some(Arc::new(BootstrapFinishResource::new(Arc::clone(&finished))));
        let site = build_site(Arc::clone(&tree), Arc::clone(&notifier), Arc::clone(&registry), fixed).await;
        let site = Arc::new(crate::coap_site::SiteHandle::new(site));

        let serve_task = tokio::spawn({
            let endpoint = Arc::clone(&client_endpoint);
            let site = Arc::clone(&site);
            async move {
                let _ = endpoint.serve(|msg, peer| {
                    let site = Arc::clone(&site);
                    async move { Some(site.dispatch(msg, peer).await) }
                }).await;
            }
        });

        let client_addr = client_endpoint.local_addr().unwrap();
        let bootstrap_server_task = tokio::spawn(async move {
            // Simulate the bootstrap server: write a fresh server URI/PSK
            // into /0/1, a lifetime into /1/0, then signal finish.
            let write_uri = RequestBuilder::new(&bs_server_endpoint, Code::PUT, "0/1/0")
                .content_format(MediaType::Tlv)
                .payload(lwm2m_core::tlv::pack_resource_value(
                    security::RES_LWM2M_SERVER_URI,
                    &Value::String("coap://srv:5683".into()),
                ));
            write_uri.send(&bs_server_endpoint, client_addr).await.unwrap();

            let write_secret = RequestBuilder::new(&bs_server_endpoint, Code::PUT, "0/1/5")
                .content_format(MediaType::Tlv)
                .payload(lwm2m_core::tlv::pack_resource_value(
                    security::RES_SECRET_KEY,
                    &Value::Opaque(b"sekrit".to_vec()),
                ));
            write_secret.send(&bs_server_endpoint, client_addr).await.unwrap();

            let write_lifetime = RequestBuilder::new(&bs_server_endpoint, Code::PUT, "1/0/1")
                .content_format(MediaType::Tlv)
                .payload(lwm2m_core::tlv::pack_resource_value(server::RES_LIFETIME, &Value::Integer(600)));
            write_lifetime.send(&bs_server_endpoint, client_addr).await.unwrap();

            let finish = RequestBuilder::new(&bs_server_endpoint, Code::POST, "bs");
            finish.send(&bs_server_endpoint, client_addr).await.unwrap();
        });

        let result = run(&client_endpoint, bs_addr, &tree, "urn:imei:test", finished).await.unwrap();
        assert_eq!(result.server_uri, "coap://srv:5683");
        assert_eq!(result.psk, b"sekrit".to_vec());
        assert_eq!(result.lifetime, Some(600));

        bootstrap_server_task.await.unwrap();
        serve_task.abort();
    }

    #[tokio::test]
    async fn unexpected_response_to_the_bs_post_is_fatal() {
        let tree = client_tree().await;
        let client = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let finished = Arc::new(tokio::sync::Notify::new());

        let server_task = tokio::spawn(async move {
            server
                .serve(|req, _peer| async move {
                    Some(lwm2m_coap::Message::ack(req.message_id, req.token.clone(), Code::BAD_REQUEST))
                })
                .await
        });

        let result = run(&client, server_addr, &tree, "urn:imei:test", finished).await;
        assert!(matches!(result, Err(BootstrapError::UnexpectedResponse(Code::BAD_REQUEST))));
        server_task.abort();
    }
}
