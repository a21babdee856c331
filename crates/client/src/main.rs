//! Process entry point: parses the CLI, wires every collaborator and
//! tree object together, binds the CoAP endpoint, spawns the ambient
//! driver tasks, then hands control to the bearer supervisor until it
//! exits or Ctrl-C arrives.

mod bearer;
mod block;
mod bootstrap;
mod cli;
mod coap_site;
mod collaborators;
mod constants;
mod error;
mod objects;
mod registration;
mod tree;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::Notify;

use block::BlockDownloader;
use cli::{exit_code, Args};
use coap_site::{build_site, FixedResources, SiteHandle};
use collaborators::device_info::HostDeviceInfo;
use collaborators::syslog_reader::JournaldReader;
use collaborators::update_runner::SubprocessRunner;
use collaborators::{CellularInfo, DeviceInfo, NetworkInfo, WifiProfileStore};
use error::SupervisorError;
use lwm2m_coap::{Endpoint, ObserveRegistry};
use tree::observe::Notifier;
use tree::Tree;

/// Top-level failure this process can exit on, grounded on the
/// teacher's `AgentError`: every fallible setup step and every
/// ambient-task panic funnels into one enum so `main` has a single
/// place to map a result onto an exit code.
#[derive(Debug, Error)]
enum ClientError {
    #[error("failed to bind the CoAP endpoint: {0}")]
    Bind(#[from] lwm2m_coap::TransportError),
    #[error("a background task panicked: {0}")]
    TaskPanicked(#[from] tokio::task::JoinError),
    #[error("a background task exited unexpectedly")]
    TaskExited,
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();
    init_tracing(args.debug);

    match run(args).await {
        Ok(()) => std::process::exit(exit_code::SUCCESS),
        Err(Outcome::Interrupted) => {
            tracing::info!("interrupted, shutting down");
            std::process::exit(exit_code::EINTR);
        }
        Err(Outcome::SoftwareInstallActivated) => {
            tracing::info!("software install activated, exiting for the supervisor to swap the binary");
            std::process::exit(exit_code::ENOPKG);
        }
        Err(Outcome::NoNetwork) => {
            tracing::error!("no network interface matched the bearer preference list");
            std::process::exit(exit_code::ENONET);
        }
        Err(Outcome::Failed(e)) => {
            tracing::error!(error = %e, "client exiting after an unrecoverable error");
            std::process::exit(exit_code::EAGAIN);
        }
    }
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::EnvFilter;
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

enum Outcome {
    Interrupted,
    SoftwareInstallActivated,
    NoNetwork,
    Failed(ClientError),
}

impl From<ClientError> for Outcome {
    fn from(e: ClientError) -> Outcome {
        match e {
            ClientError::Supervisor(SupervisorError::NoNetwork) => Outcome::NoNetwork,
            other => Outcome::Failed(other),
        }
    }
}

async fn run(args: Args) -> Result<(), Outcome> {
    let bind_addr: SocketAddr = format!("{}:{}", args.address, args.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], args.port)));
    let endpoint = Endpoint::bind(bind_addr).await.map_err(ClientError::from)?;
    tracing::info!(addr = %endpoint.local_addr().unwrap_or(bind_addr), "CoAP endpoint bound");

    let device_info: Arc<dyn DeviceInfo> = Arc::new(HostDeviceInfo);
    let (network_info, cellular_info, wifi_store) = collaborators_for_feature().await;
    let syslog_reader = Arc::new(JournaldReader);
    let update_runner = Arc::new(SubprocessRunner);

    let restart_signal = Arc::new(Notify::new());
    let activate_signal = Arc::new(Notify::new());

    let mut tree = Tree::new();
    let bootstrap_uri = args
        .bootstrap_address
        .as_ref()
        .map(|addr| format!("coap://{addr}:{}", args.bootstrap_port))
        .unwrap_or_default();
    tree.insert_object(0, objects::security::new_base_object(&bootstrap_uri, &args.endpoint));
    if args.bootstrap_address.is_none() {
        seed_server_psk(&mut tree, &args);
    }
    tree.insert_object(1, objects::server::new_base_object(args.lifetime));
    tree.insert_object(3, objects::device::new_base_object(Arc::clone(&device_info)));
    tree.insert_object(4, objects::connmon::new_base_object());

    let (fw_tx, fw_rx) = objects::fwupdate::make_channel();
    tree.insert_object(5, objects::fwupdate::new_base_object(fw_tx.clone()));

    let (sw_tx, sw_rx) = objects::swmgmt::make_channel();
    tree.insert_object(9, objects::swmgmt::new_base_object(sw_tx.clone()));

    tree.insert_object(10, objects::cellular::new_cellular_base_object());
    let (apn_tx, apn_rx) = objects::cellular::make_channel();
    tree.insert_object(11, objects::cellular::new_apn_base_object(apn_tx));

    let (wlan_tx, wlan_rx) = tokio::sync::mpsc::unbounded_channel::<objects::wlan::Command>();
    let wlan_object = objects::wlan::new_base_object(Arc::clone(&wifi_store), wlan_tx, Arc::clone(&tree.topology_changed)).await;
    tree.insert_object(12, wlan_object);

    tree.insert_object(13, objects::bearer::new_base_object(&["auto"], Arc::clone(&restart_signal)));
    tree.insert_object(objects::syslog::OBJECT_ID, objects::syslog::new_base_object());

    let tree = Arc::new(AsyncMutex::new(tree));
    let registry = Arc::new(ObserveRegistry::new());
    let notifier = Arc::new(Notifier::new(Arc::clone(&registry), Arc::clone(&endpoint)));

    let fixed = FixedResources {
        bootstrap_finish: None,
        firmware_package: Arc::new(coap_site::PackageUploadResource::new(constants::FIRMWARE_UPDATE_PATH, {
            let fw_tx = fw_tx.clone();
            Box::new(move || {
                let _ = fw_tx.send(objects::fwupdate::Command::PackageUploadComplete);
            })
        })),
        software_package: Arc::new(coap_site::PackageUploadResource::new(constants::SOFTWARE_UPDATE_ARCHIVE_PATH, {
            let sw_tx = sw_tx.clone();
            Box::new(move || {
                let _ = sw_tx.send(objects::swmgmt::Command::PackageUploadComplete);
            })
        })),
        syslog_read_all: Arc::new(objects::syslog::SyslogBlock2Resource::new(Arc::clone(&syslog_reader) as _, false)),
        syslog_read_incremental: Arc::new(objects::syslog::SyslogBlock2Resource::new(Arc::clone(&syslog_reader) as _, true)),
    };

    let site = build_site(Arc::clone(&tree), Arc::clone(&notifier), Arc::clone(&registry), fixed.clone()).await;
    let site = Arc::new(SiteHandle::new(site));

    let downloader = Arc::new(BlockDownloader::new(Arc::clone(&endpoint)));

    let serve_task = tokio::spawn({
        let endpoint = Arc::clone(&endpoint);
        let site = Arc::clone(&site);
        async move {
            let _ = endpoint
                .serve(move |msg, peer| {
                    let site = Arc::clone(&site);
                    async move { Some(site.dispatch(msg, peer).await) }
                })
                .await;
        }
    });

    let ambient_tasks = vec![
        tokio::spawn(objects::device::time_tick_task(Arc::clone(&tree), Arc::clone(&notifier), Arc::clone(&device_info))),
        tokio::spawn(objects::fwupdate::run(
            Arc::clone(&tree),
            Arc::clone(&notifier),
            fw_rx,
            Arc::clone(&downloader),
            Arc::clone(&update_runner) as _,
        )),
        tokio::spawn(objects::swmgmt::run(
            Arc::clone(&tree),
            Arc::clone(&notifier),
            sw_rx,
            Arc::clone(&downloader),
            Arc::clone(&update_runner) as _,
            Arc::clone(&activate_signal),
        )),
        tokio::spawn(objects::wlan::run(Arc::clone(&tree), Arc::clone(&notifier), wlan_rx, Arc::clone(&wifi_store))),
        tokio::spawn(objects::cellular::run(Arc::clone(&tree), Arc::clone(&notifier), apn_rx, Arc::clone(&cellular_info))),
        tokio::spawn(objects::cellular::refresh_task(Arc::clone(&tree), Arc::clone(&notifier), Arc::clone(&cellular_info))),
        tokio::spawn(coap_site::rebuild_on_topology_change(
            Arc::clone(&tree),
            Arc::clone(&notifier),
            Arc::clone(&registry),
            fixed.clone(),
            Arc::clone(&site),
        )),
        serve_task,
    ];

    let bearer_config = bearer::Config {
        endpoint_name: args.endpoint.clone(),
        bootstrap_peer: resolve_peer(args.bootstrap_address.as_deref(), args.bootstrap_port),
        server_peer: resolve_peer(args.server_address.as_deref(), args.server_port),
        default_lifetime: std::time::Duration::from_secs(args.lifetime as u64),
    };

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            return Err(Outcome::Interrupted);
        }
        outcome = bearer::run(
            &bearer_config,
            &network_info,
            &tree,
            &endpoint,
            &notifier,
            &registry,
            &site,
            &fixed,
            restart_signal,
            activate_signal,
        ) => outcome.map_err(ClientError::from),
        failure = watch_ambient_tasks(ambient_tasks) => Err(failure),
    };

    // Ambient tasks are intentionally left running for the life of the
    // process; nothing to join here on the happy path.
    match result {
        Ok(bearer::Outcome::NoNetwork) => Err(Outcome::NoNetwork),
        Ok(bearer::Outcome::SoftwareInstallActivated) => Err(Outcome::SoftwareInstallActivated),
        Err(e) => Err(e.into()),
    }
}

fn resolve_peer(address: Option<&str>, port: u16) -> Option<SocketAddr> {
    let address = address?;
    format!("{address}:{port}").parse().ok()
}

/// When the client is pointed straight at a management server (no
/// bootstrap), the PSK credentials a DTLS transport would need never
/// go through the bootstrap WRITING state that normally populates
/// instance 1 — so seed them from `--server-psk` here instead. Identity
/// is the endpoint name's bytes and the key is the hex-decoded secret,
/// per the same one-PSK-per-server rule bootstrap applies.
fn seed_server_psk(tree: &mut Tree, args: &Args) {
    let (Some(server_address), Some(psk_hex)) = (args.server_address.as_deref(), args.server_psk.as_deref()) else {
        return;
    };
    let Some(key) = decode_hex(psk_hex) else {
        tracing::warn!("--server-psk is not valid hex; leaving the security object unpopulated");
        return;
    };
    let uri = format!("coap://{server_address}:{}", args.server_port);
    let Some(base) = tree.object_mut(0) else { return };
    let Some(inst) = base.get_mut(1) else { return };
    use lwm2m_core::Value;
    if let Some(r) = inst.get_mut(objects::security::RES_LWM2M_SERVER_URI) {
        let _ = r.write_single(Value::String(uri));
    }
    if let Some(r) = inst.get_mut(objects::security::RES_PUBLIC_KEY_OR_IDENTITY) {
        let _ = r.write_single(Value::Opaque(args.endpoint.as_bytes().to_vec()));
    }
    if let Some(r) = inst.get_mut(objects::security::RES_SECRET_KEY) {
        let _ = r.write_single(Value::Opaque(key));
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Waits for any ambient driver task to end, which only happens if it
/// panicked (every one of them loops forever on its channel/timer).
async fn watch_ambient_tasks(tasks: Vec<tokio::task::JoinHandle<()>>) -> ClientError {
    use futures::future::select_all;
    let (result, _index, _rest) = select_all(tasks).await;
    match result {
        Ok(()) => ClientError::TaskExited,
        Err(join_error) => ClientError::TaskPanicked(join_error),
    }
}

#[cfg(feature = "dbus")]
async fn collaborators_for_feature() -> (Arc<dyn NetworkInfo>, Arc<dyn CellularInfo>, Arc<dyn WifiProfileStore>) {
    use collaborators::network::dbus_backed::{DbusCellular, DbusNetwork};
    use collaborators::wifi::dbus_backed::DbusWifiProfileStore;

    let network: Arc<dyn NetworkInfo> = match DbusNetwork::connect().await {
        Ok(n) => Arc::new(n),
        Err(e) => {
            tracing::warn!(error = %e, "failed to connect to the system D-Bus for NetworkManager; falling back to an empty network view");
            Arc::new(NullNetwork)
        }
    };
    let cellular: Arc<dyn CellularInfo> = match DbusCellular::connect().await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::warn!(error = %e, "failed to connect to the system D-Bus for oFono; falling back to an empty cellular view");
            Arc::new(NullCellular)
        }
    };
    let wifi: Arc<dyn WifiProfileStore> = match DbusWifiProfileStore::connect().await {
        Ok(w) => Arc::new(w),
        Err(e) => {
            tracing::warn!(error = %e, "failed to connect to the system D-Bus for NetworkManager Wi-Fi profiles; falling back to an empty store");
            Arc::new(NullWifiProfileStore)
        }
    };
    (network, cellular, wifi)
}

#[cfg(not(feature = "dbus"))]
async fn collaborators_for_feature() -> (Arc<dyn NetworkInfo>, Arc<dyn CellularInfo>, Arc<dyn WifiProfileStore>) {
    (Arc::new(NullNetwork), Arc::new(NullCellular), Arc::new(NullWifiProfileStore))
}

/// Reports no connections and no hardware, the same degrade-to-empty
/// shape the D-Bus collaborators fall back to on a bus error — used
/// outright when the `dbus` feature is compiled out.
struct NullNetwork;

#[async_trait::async_trait]
impl NetworkInfo for NullNetwork {
    async fn available_connections(&self) -> Vec<collaborators::network::Connection> {
        Vec::new()
    }
    async fn find_iface_by_addr(&self, _addr: &str) -> Option<String> {
        None
    }
    async fn hw_addr(&self, _interface: &str) -> Option<[u8; 6]> {
        None
    }
}

struct NullCellular;

#[async_trait::async_trait]
impl CellularInfo for NullCellular {
    async fn network_props(&self) -> collaborators::network::CellularNetworkProps {
        Default::default()
    }
    async fn connection_props(&self) -> collaborators::network::CellularConnectionProps {
        Default::default()
    }
    async fn get_lte_prop(&self, _name: &str) -> Option<String> {
        None
    }
    async fn set_lte_prop(&self, _name: &str, _value: &str) -> bool {
        false
    }
}

struct NullWifiProfileStore;

#[async_trait::async_trait]
impl WifiProfileStore for NullWifiProfileStore {
    async fn list_profiles(&self, _interface: &str) -> Vec<u32> {
        Vec::new()
    }
    async fn read_profile(&self, _instance: u32) -> Option<collaborators::wifi::WifiProfile> {
        None
    }
    async fn write_profile(&self, _instance: u32, _profile: &collaborators::wifi::WifiProfile) -> bool {
        false
    }
    async fn delete_profile(&self, _instance: u32) -> bool {
        false
    }
    async fn hw_addr(&self, _interface: &str) -> Option<[u8; 6]> {
        None
    }
    async fn is_connection_active(&self, _instance: u32) -> bool {
        false
    }
}
