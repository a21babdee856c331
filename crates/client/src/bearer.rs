//! Bearer supervisor: walk the Object 13 preferred-bearer list
//! against whatever interfaces NetworkManager currently reports, pick
//! the first one that gets through bootstrap and registration, and run
//! until something stops it — a bearer-resource write, a
//! software-install activation, or the server giving up on us.
//!
//! The CoAP endpoint itself is bound once in `main` and shared across
//! every attempt rather than rebound per candidate: the default bind
//! address is the wildcard (`0.0.0.0`), so a fresh socket per interface
//! buys nothing, and a UDP endpoint is connectionless anyway. What
//! actually changes per attempt is which connection/address the
//! connectivity-monitor object reports and which server peer bootstrap
//! and registration are run against.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use lwm2m_coap::Endpoint;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;

use crate::bootstrap;
use crate::coap_site::{build_site, BootstrapFinishResource, FixedResources, SiteHandle};
use crate::collaborators::network::NetworkInfo;
use crate::error::{BootstrapError, RegistrationError, SupervisorError};
use crate::objects::bearer::{self as bearer_object, Bearer};
use crate::objects::connmon;
use crate::registration;
use crate::tree::observe::Notifier;
use crate::tree::Tree;

/// Static configuration the supervisor does not re-derive from the
/// tree on every loop iteration (the CLI arguments it was started
/// with).
pub struct Config {
    pub endpoint_name: String,
    pub bootstrap_peer: Option<SocketAddr>,
    pub server_peer: Option<SocketAddr>,
    pub default_lifetime: Duration,
}

/// How the supervisor loop ended.
pub enum Outcome {
    /// Every candidate was exhausted without exiting for another reason.
    NoNetwork,
    /// Exit cleanly so an external manager can swap the running binary
    /// (the swmgmt "activate" write).
    SoftwareInstallActivated,
}

/// A candidate bearer/connection failed for a reason the supervisor
/// treats as "try the next one" rather than fatal.
enum AttemptError {
    Bootstrap(BootstrapError),
    Registration(RegistrationError),
    UnresolvedServer,
}

/// One connect/bootstrap/register attempt ran long enough to be
/// stopped rather than to fail outright.
enum Attempt {
    BearerRestart,
    SoftwareInstallActivated,
}

fn interface_matches(bearer: Bearer, interface: &str) -> bool {
    match bearer {
        Bearer::Lte => interface.starts_with("usb"),
        Bearer::Wlan => interface.starts_with("wlan"),
        Bearer::Ethernet => !interface.starts_with("usb") && !interface.starts_with("wlan"),
    }
}

/// Parses a `coap://host:port[/path]` server URI into the socket
/// address the client talks to, the same `strip_prefix` + `parse`
/// shape `objects::fwupdate::download` and `objects::swmgmt::download`
/// use for download URIs.
fn resolve_coap_uri(uri: &str) -> Option<SocketAddr> {
    let rest = uri.strip_prefix("coap://").or_else(|| uri.strip_prefix("coaps://"))?;
    let host = rest.split('/').next()?;
    host.parse().ok()
}

async fn current_server_peer(tree: &Arc<AsyncMutex<Tree>>, config: &Config) -> Option<SocketAddr> {
    if let Some(peer) = config.server_peer {
        return Some(peer);
    }
    let guard = tree.lock().await;
    let base = guard.object(0)?;
    let inst = base.get(1)?;
    let uri = match inst.get(crate::objects::security::RES_LWM2M_SERVER_URI)?.read_single().ok()? {
        lwm2m_core::Value::String(s) if !s.is_empty() => s,
        _ => return None,
    };
    resolve_coap_uri(&uri)
}

async fn server_uri_is_empty(tree: &Arc<AsyncMutex<Tree>>) -> bool {
    let guard = tree.lock().await;
    let Some(base) = guard.object(0) else { return true };
    let Some(inst) = base.get(1) else { return true };
    match inst.get(crate::objects::security::RES_LWM2M_SERVER_URI).and_then(|r| r.read_single().ok()) {
        Some(lwm2m_core::Value::String(s)) => s.is_empty(),
        _ => true,
    }
}

async fn apply_bootstrap_result(tree: &Arc<AsyncMutex<Tree>>, result: &bootstrap::BootstrapResult) {
    use crate::objects::{security, server};
    use lwm2m_core::Value;

    let mut guard = tree.lock().await;
    if let Some(base) = guard.object_mut(0) {
        if let Some(inst) = base.get_mut(1) {
            if let Some(r) = inst.get_mut(security::RES_LWM2M_SERVER_URI) {
                let _ = r.write_single(Value::String(result.server_uri.clone()));
            }
            if let Some(r) = inst.get_mut(security::RES_PUBLIC_KEY_OR_IDENTITY) {
                let _ = r.write_single(Value::Opaque(result.psk_identity.clone()));
            }
            if let Some(r) = inst.get_mut(security::RES_SECRET_KEY) {
                let _ = r.write_single(Value::Opaque(result.psk.clone()));
            }
        }
    }
    if let (Some(lifetime), Some(base)) = (result.lifetime, guard.object_mut(1)) {
        if let Some(inst) = base.get_mut(0) {
            if let Some(r) = inst.get_mut(server::RES_LIFETIME) {
                let _ = r.write_single(Value::Integer(lifetime as i64));
            }
        }
    }
}

async fn current_lifetime(tree: &Arc<AsyncMutex<Tree>>, default: Duration) -> Duration {
    let guard = tree.lock().await;
    guard
        .object(1)
        .and_then(crate::objects::server::read_lifetime)
        .map(|secs| Duration::from_secs(secs as u64))
        .unwrap_or(default)
}

/// Binds bootstrap (if needed) and registration against one candidate
/// connection, running until the server stops refreshing it, a
/// bearer-resource write fires `restart_signal`, or a software install
/// fires `activate_signal`.
async fn run_one_attempt(
    config: &Config,
    tree: &Arc<AsyncMutex<Tree>>,
    endpoint: &Arc<Endpoint>,
    notifier: &Arc<Notifier>,
    registry: &Arc<lwm2m_coap::ObserveRegistry>,
    site: &Arc<SiteHandle>,
    fixed: &FixedResources,
    interface: &str,
    address: &str,
    restart_signal: &Arc<Notify>,
    activate_signal: &Arc<Notify>,
) -> Result<Attempt, AttemptError> {
    {
        let mut guard = tree.lock().await;
        if let Some(base) = guard.object_mut(connmon::OBJECT_ID) {
            connmon::set_current_bearer(base, interface, address);
        }
    }
    {
        let guard = tree.lock().await;
        notifier.notify_instance_changed(&guard, connmon::OBJECT_ID, 0).await;
    }

    if config.bootstrap_peer.is_some() && server_uri_is_empty(tree).await {
        let finished = Arc::new(Notify::new());
        let mut bootstrap_fixed = fixed.clone();
        bootstrap_fixed.bootstrap_finish = Some(Arc::new(BootstrapFinishResource::new(Arc::clone(&finished))));
        let bootstrap_site = build_site(Arc::clone(tree), Arc::clone(notifier), Arc::clone(registry), bootstrap_fixed).await;
        site.replace(bootstrap_site).await;

        let result = bootstrap::run(
            endpoint,
            config.bootstrap_peer.expect("checked above"),
            tree,
            &config.endpoint_name,
            finished,
        )
        .await
        .map_err(AttemptError::Bootstrap)?;
        apply_bootstrap_result(tree, &result).await;

        let registered_site = build_site(Arc::clone(tree), Arc::clone(notifier), Arc::clone(registry), fixed.clone()).await;
        site.replace(registered_site).await;
    }

    let server_peer = current_server_peer(tree, config).await.ok_or(AttemptError::UnresolvedServer)?;
    let lifetime = current_lifetime(tree, config.default_lifetime).await;

    tokio::select! {
        // `registration::run` only returns through its leading `?`, never
        // through its refresh loop, so it never produces `Ok(())` in
        // practice; treat that case the same as a registration error.
        result = registration::run(endpoint, server_peer, tree, &config.endpoint_name, lifetime) => {
            match result {
                Ok(()) => Err(AttemptError::Registration(RegistrationError::NotFound)),
                Err(e) => Err(AttemptError::Registration(e)),
            }
        }
        _ = restart_signal.notified() => Ok(Attempt::BearerRestart),
        _ = activate_signal.notified() => Ok(Attempt::SoftwareInstallActivated),
    }
}

/// Runs the supervisor loop until it exhausts every candidate (no
/// network) or a software install activates.
///
/// `restart_signal` is the same `Notify` passed into
/// `objects::bearer::new_base_object` — a write to the preference
/// resource stops whatever attempt is running so this loop re-reads
/// preferences from the top. `activate_signal` is
/// `objects::swmgmt`'s install-activation signal.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    config: &Config,
    network: &Arc<dyn NetworkInfo>,
    tree: &Arc<AsyncMutex<Tree>>,
    endpoint: &Arc<Endpoint>,
    notifier: &Arc<Notifier>,
    registry: &Arc<lwm2m_coap::ObserveRegistry>,
    site: &Arc<SiteHandle>,
    fixed: &FixedResources,
    restart_signal: Arc<Notify>,
    activate_signal: Arc<Notify>,
) -> Result<Outcome, SupervisorError> {
    loop {
        let preferences = {
            let guard = tree.lock().await;
            guard
                .object(bearer_object::OBJECT_ID)
                .map(bearer_object::read_preferences)
                .unwrap_or_default()
        };
        let bearers = bearer_object::expand(&preferences);
        let connections = network.available_connections().await;

        let mut tried_any = false;
        let mut restart = false;

        'bearers: for bearer in &bearers {
            for conn in connections.iter().filter(|c| interface_matches(*bearer, &c.interface)) {
                let addresses: Vec<&String> = conn.ipv4_addresses.iter().chain(conn.ipv6_addresses.iter()).collect();
                for address in addresses {
                    tried_any = true;
                    let outcome = run_one_attempt(
                        config,
                        tree,
                        endpoint,
                        notifier,
                        registry,
                        site,
                        fixed,
                        &conn.interface,
                        address,
                        &restart_signal,
                        &activate_signal,
                    )
                    .await;
                    match outcome {
                        Ok(Attempt::BearerRestart) => {
                            restart = true;
                            break 'bearers;
                        }
                        Ok(Attempt::SoftwareInstallActivated) => return Ok(Outcome::SoftwareInstallActivated),
                        Err(_protocol_error) => continue,
                    }
                }
            }
        }

        if restart {
            continue;
        }
        if !tried_any {
            return Err(SupervisorError::NoNetwork);
        }
        // Every candidate was tried and each failed with a protocol
        // error; re-read preferences and try the whole list again.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ethernet_bearer_matches_anything_not_wlan_or_usb() {
        assert!(interface_matches(Bearer::Ethernet, "eth0"));
        assert!(!interface_matches(Bearer::Ethernet, "wlan0"));
        assert!(!interface_matches(Bearer::Ethernet, "usb0"));
    }

    #[test]
    fn lte_bearer_matches_usb_interfaces() {
        assert!(interface_matches(Bearer::Lte, "usb0"));
        assert!(!interface_matches(Bearer::Lte, "eth0"));
    }

    #[test]
    fn wlan_bearer_matches_wlan_interfaces() {
        assert!(interface_matches(Bearer::Wlan, "wlan0"));
        assert!(!interface_matches(Bearer::Wlan, "eth0"));
    }

    #[test]
    fn coap_uri_resolves_host_and_port() {
        assert_eq!(resolve_coap_uri("coap://192.0.2.1:5683"), Some("192.0.2.1:5683".parse().unwrap()));
        assert_eq!(resolve_coap_uri("coap://192.0.2.1:5683/extra"), Some("192.0.2.1:5683".parse().unwrap()));
        assert_eq!(resolve_coap_uri("not-a-uri"), None);
    }
}
