//! Object 12 (WLAN Connectivity), grounded on `ig60_wlan.py`: one
//! dynamic instance per saved NetworkManager profile named
//! `lwm2m_conn_<instance>`. A resource write marks the instance dirty
//! and a command-channel driver pushes the whole profile back to the
//! store (NetworkManager has no per-field update verb, only whole
//! replace), POST creates a new profile, DELETE removes it and signals
//! topology change, and the status resource is derived from
//! `autoconnect` plus whether the connection is presently up.

use std::collections::BTreeMap;
use std::sync::Arc;

use lwm2m_core::Value;
use tokio::sync::mpsc;

use crate::collaborators::wifi::{WifiProfile, WifiProfileStore};
use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::observe::Notifier;
use crate::tree::resource::{Resource, SingleResource};
use crate::tree::Tree;

pub const OBJECT_ID: u16 = 12;

pub const RES_ENABLE: u16 = 0;
pub const RES_STATUS: u16 = 1;
pub const RES_IFNAME: u16 = 2;
pub const RES_BSSID: u16 = 3;
pub const RES_SSID: u16 = 4;
pub const RES_MODE: u16 = 5;
pub const RES_CHANNEL: u16 = 6;
pub const RES_STANDARD: u16 = 7;
pub const RES_AUTH_MODE: u16 = 8;
pub const RES_WPA_KEY_PHRASE: u16 = 9;

pub const STATUS_DISABLED: i64 = 0;
pub const STATUS_UP: i64 = 1;
pub const STATUS_ERROR: i64 = 2;

pub const MODE_CLIENT: i64 = 0;
pub const STANDARD_80211_AC: i64 = 4;
pub const AUTH_MODE_OPEN: i64 = 0;
pub const AUTH_MODE_PSK: i64 = 1;

pub const WLAN_INTERFACE: &str = "wlan0";

pub enum Command {
    Modified(u32),
    Deleted(u32),
}

fn instance_from_profile(id: u32, profile: &WifiProfile, bssid: Option<[u8; 6]>) -> ObjectInstance {
    let mut inst = ObjectInstance::new();
    inst.insert(
        RES_IFNAME,
        Resource::Single(SingleResource::new(Value::String(profile.interface.clone()))),
    );
    inst.insert(
        RES_ENABLE,
        Resource::Single(SingleResource::new(Value::Boolean(profile.enabled))),
    );
    inst.insert(RES_STATUS, Resource::Single(SingleResource::new(Value::Integer(STATUS_DISABLED))));
    inst.insert(
        RES_BSSID,
        Resource::Single(SingleResource::new(Value::String(
            bssid.map(format_mac).unwrap_or_default(),
        ))),
    );
    inst.insert(RES_SSID, Resource::Single(SingleResource::new(Value::String(profile.ssid.clone()))));
    inst.insert(RES_MODE, Resource::Single(SingleResource::new(Value::Integer(MODE_CLIENT))));
    inst.insert(
        RES_CHANNEL,
        Resource::Single(SingleResource::new(Value::Integer(profile.channel as i64))),
    );
    inst.insert(
        RES_STANDARD,
        Resource::Single(SingleResource::new(Value::Integer(STANDARD_80211_AC))),
    );
    inst.insert(
        RES_AUTH_MODE,
        Resource::Single(SingleResource::new(Value::Integer(if profile.psk_auth {
            AUTH_MODE_PSK
        } else {
            AUTH_MODE_OPEN
        }))),
    );
    inst.insert(
        RES_WPA_KEY_PHRASE,
        Resource::Single(SingleResource::new(Value::String(profile.psk.clone()))),
    );
    let _ = id;
    inst
}

fn format_mac(mac: [u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

/// Reads a profile's resources back into the `WifiProfile` shape the
/// store wants, mirroring `get_nm_connection_settings`.
pub fn profile_from_instance(inst: &ObjectInstance) -> WifiProfile {
    WifiProfile {
        interface: inst
            .get(RES_IFNAME)
            .and_then(|r| r.read_single().ok())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| WLAN_INTERFACE.to_string()),
        enabled: inst
            .get(RES_ENABLE)
            .and_then(|r| r.read_single().ok())
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        ssid: inst
            .get(RES_SSID)
            .and_then(|r| r.read_single().ok())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
        channel: inst
            .get(RES_CHANNEL)
            .and_then(|r| r.read_single().ok())
            .and_then(|v| v.as_integer())
            .unwrap_or(0) as u16,
        psk_auth: inst
            .get(RES_AUTH_MODE)
            .and_then(|r| r.read_single().ok())
            .and_then(|v| v.as_integer())
            == Some(AUTH_MODE_PSK),
        psk: inst
            .get(RES_WPA_KEY_PHRASE)
            .and_then(|r| r.read_single().ok())
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default(),
    }
}

async fn with_write_hooks(mut inst: ObjectInstance, id: u32, tx: mpsc::UnboundedSender<Command>) -> ObjectInstance {
    for res_id in [
        RES_ENABLE,
        RES_IFNAME,
        RES_SSID,
        RES_MODE,
        RES_CHANNEL,
        RES_AUTH_MODE,
        RES_WPA_KEY_PHRASE,
    ] {
        if let Some(resource) = inst.get_mut(res_id) {
            if let Resource::Single(single) = resource {
                // `SingleResource` hooks are set at construction, so
                // rebuild this resource with its write hook attached.
                let current = single.read();
                let tx = tx.clone();
                *resource = Resource::Single(SingleResource::new(current).with_write_hook(Box::new(move |_value| {
                    let _ = tx.send(Command::Modified(id));
                    Ok(())
                })));
            }
        }
    }
    inst
}

/// Populates the base object from every saved profile on `wlan0` at
/// startup.
pub async fn new_base_object(
    store: Arc<dyn WifiProfileStore>,
    tx: mpsc::UnboundedSender<Command>,
    topology_notify: Arc<tokio::sync::Notify>,
) -> BaseObject {
    let mut instances = BTreeMap::new();
    for instance_id in store.list_profiles(WLAN_INTERFACE).await {
        if let Some(profile) = store.read_profile(instance_id).await {
            let bssid = store.hw_addr(&profile.interface).await;
            let inst = instance_from_profile(instance_id, &profile, bssid);
            let inst = with_write_hooks(inst, instance_id, tx.clone()).await;
            instances.insert(instance_id, inst);
        }
    }

    let factory = Box::new(ObjectInstance::new);
    let hook_notify = Arc::clone(&topology_notify);
    BaseObject::dynamic_object(
        instances,
        factory,
        Box::new(move || {
            hook_notify.notify_waiters();
        }),
    )
}

/// Drives profile persistence: re-reads the dirtied instance's
/// resources and pushes the whole profile to the store, since NM has
/// no field-level update verb.
pub async fn run(
    tree: Arc<tokio::sync::Mutex<Tree>>,
    notifier: Arc<Notifier>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    store: Arc<dyn WifiProfileStore>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Modified(id) => {
                let profile = {
                    let guard = tree.lock().await;
                    guard.object(OBJECT_ID).and_then(|base| base.get(id)).map(profile_from_instance)
                };
                if let Some(profile) = profile {
                    if !store.write_profile(id, &profile).await {
                        tracing::warn!(instance = id, "failed to push a WLAN profile write to NetworkManager");
                    }
                    refresh_status(&tree, &notifier, &store, id).await;
                }
            }
            Command::Deleted(id) => {
                let _ = store.delete_profile(id).await;
            }
        }
    }
}

async fn refresh_status(tree: &tokio::sync::Mutex<Tree>, notifier: &Notifier, store: &Arc<dyn WifiProfileStore>, id: u32) {
    let enabled_and_active = {
        let guard = tree.lock().await;
        guard
            .object(OBJECT_ID)
            .and_then(|base| base.get(id))
            .and_then(|inst| inst.get(RES_ENABLE))
            .and_then(|r| r.read_single().ok())
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    let status = if !enabled_and_active {
        STATUS_DISABLED
    } else if store.is_connection_active(id).await {
        STATUS_UP
    } else {
        STATUS_ERROR
    };

    let mut guard = tree.lock().await;
    if let Some(base) = guard.object_mut(OBJECT_ID) {
        if let Some(inst) = base.get_mut(id) {
            if let Some(r) = inst.get_mut(RES_STATUS) {
                let _ = r.write_single(Value::Integer(status));
            }
        }
    }
    notifier.notify_resource_changed(&guard, OBJECT_ID, id, RES_STATUS).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_profile() -> WifiProfile {
        WifiProfile {
            interface: WLAN_INTERFACE.to_string(),
            enabled: true,
            ssid: "guest".to_string(),
            channel: 6,
            psk_auth: true,
            psk: "hunter2".to_string(),
        }
    }

    #[test]
    fn instance_round_trips_through_profile_conversion() {
        let inst = instance_from_profile(0, &sample_profile(), None);
        let profile = profile_from_instance(&inst);
        assert_eq!(profile, sample_profile());
    }

    #[test]
    fn bssid_formats_as_colon_separated_hex() {
        let inst = instance_from_profile(0, &sample_profile(), Some([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert_eq!(
            inst.get(RES_BSSID).unwrap().read_single().unwrap(),
            Value::String("00:11:22:33:44:55".to_string())
        );
    }
}
