//! Object 10 (Cellular Connectivity) and Object 11 (APN Connection
//! Profile), grounded on `ig60_cellular.py`: an activated-profiles
//! multi-resource pointing at the APN instance while a connection is
//! up, APN/auth-type/PDN-type get-set against oFono's LTE properties,
//! and read-only connection-setting resources (address/gateway/
//! netmask/DNS[0..1]).
//!
//! The oFono accessors are async (D-Bus round trips), so writes to
//! these resources are dispatched through a command channel the same
//! way `objects::fwupdate` dispatches downloads — the write hook only
//! validates and enqueues; `run` performs the actual property set and
//! writes the outcome back into the tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use lwm2m_core::{Value, ValueKind};
use tokio::sync::mpsc;

use crate::collaborators::network::{CellularConnectionProps, CellularInfo, CellularNetworkProps};
use crate::error::CoreError;
use crate::objects::connmon;
use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::observe::Notifier;
use crate::tree::resource::{MultiResource, Resource, SingleResource};
use crate::tree::Tree;

pub const CELLULAR_OBJECT_ID: u16 = 10;
pub const RES_ACTIVATED_PROFILES: u16 = 11;

pub const APN_OBJECT_ID: u16 = 11;
pub const RES_PROFILE_NAME: u16 = 0;
pub const RES_APN: u16 = 1;
pub const RES_AUTH_TYPE: u16 = 4;
pub const RES_USERNAME: u16 = 5;
pub const RES_SECRET: u16 = 6;
pub const RES_IP_ADDRESS: u16 = 15;
pub const RES_SUBNET_MASK: u16 = 17;
pub const RES_GATEWAY: u16 = 18;
pub const RES_PRIMARY_DNS_ADDR: u16 = 19;
pub const RES_SECONDARY_DNS_ADDR: u16 = 20;
pub const RES_PDN_TYPE: u16 = 24;

pub const APN_AUTH_TYPE_PAP: i64 = 0;
pub const APN_AUTH_TYPE_CHAP: i64 = 1;
pub const APN_AUTH_TYPE_PAP_OR_CHAP: i64 = 2;
pub const APN_AUTH_TYPE_NONE: i64 = 3;

/// The corrected PDN-type mapping (open question (a)): a total
/// function both directions, never mixing the oFono and LwM2M value
/// spaces the way `IG60OfonoPDNTypeResource.set_pdn_cb` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdnType {
    NonIp,
    Ipv4,
    Ipv6,
    Ipv4v6,
}

impl PdnType {
    pub fn from_lwm2m(value: i64) -> Option<PdnType> {
        match value {
            0 => Some(PdnType::NonIp),
            1 => Some(PdnType::Ipv4),
            2 => Some(PdnType::Ipv6),
            3 => Some(PdnType::Ipv4v6),
            _ => None,
        }
    }

    pub fn to_lwm2m(self) -> i64 {
        match self {
            PdnType::NonIp => 0,
            PdnType::Ipv4 => 1,
            PdnType::Ipv6 => 2,
            PdnType::Ipv4v6 => 3,
        }
    }

    pub fn from_ofono(value: &str) -> Option<PdnType> {
        match value {
            "ip" => Some(PdnType::Ipv4),
            "ipv6" => Some(PdnType::Ipv6),
            "dual" => Some(PdnType::Ipv4v6),
            _ => None,
        }
    }

    pub fn to_ofono(self) -> &'static str {
        match self {
            PdnType::NonIp => "none",
            PdnType::Ipv4 => "ip",
            PdnType::Ipv6 => "ipv6",
            PdnType::Ipv4v6 => "dual",
        }
    }
}

fn auth_type_from_ofono(value: &str) -> Option<i64> {
    match value {
        "none" => Some(APN_AUTH_TYPE_NONE),
        "chap" => Some(APN_AUTH_TYPE_CHAP),
        "pap" => Some(APN_AUTH_TYPE_PAP),
        _ => None,
    }
}

fn auth_type_to_ofono(value: i64) -> Option<&'static str> {
    match value {
        APN_AUTH_TYPE_NONE => Some("none"),
        APN_AUTH_TYPE_CHAP => Some("chap"),
        APN_AUTH_TYPE_PAP | APN_AUTH_TYPE_PAP_OR_CHAP => Some("pap"),
        _ => None,
    }
}

pub enum Command {
    SetApn(String),
    SetAuthType(i64),
    SetPdnType(i64),
    SetUsername(String),
    SetSecret(String),
}

pub fn make_channel() -> (mpsc::UnboundedSender<Command>, mpsc::UnboundedReceiver<Command>) {
    mpsc::unbounded_channel()
}

pub fn new_cellular_base_object() -> BaseObject {
    let mut inst = ObjectInstance::new();
    inst.insert(
        RES_ACTIVATED_PROFILES,
        Resource::Multi(MultiResource::new(ValueKind::ObjectLink)),
    );
    let mut instances = BTreeMap::new();
    instances.insert(0, inst);
    BaseObject::static_object(instances)
}

/// Reflects whether a connection is currently active into the
/// activated-profiles resource, the way `IG60ActivatedProfilesResource`
/// reports the APN instance only while `get_ofono_conn_props()` is
/// non-empty.
pub fn set_connection_active(base: &mut BaseObject, active: bool) {
    if let Some(inst) = base.get_mut(0) {
        if let Some(r) = inst.get_mut(RES_ACTIVATED_PROFILES) {
            let items = if active {
                vec![(0, Value::ObjectLink(APN_OBJECT_ID, 0))]
            } else {
                vec![]
            };
            let _ = r.write_multi(items);
        }
    }
}

pub fn new_apn_base_object(tx: mpsc::UnboundedSender<Command>) -> BaseObject {
    let mut inst = ObjectInstance::new();
    inst.insert(
        RES_PROFILE_NAME,
        Resource::Single(SingleResource::new(Value::String(String::new()))),
    );
    {
        let tx = tx.clone();
        inst.insert(
            RES_APN,
            Resource::Single(SingleResource::new(Value::String(String::new())).with_write_hook(Box::new(move |value| {
                let apn = value.as_str().ok_or_else(|| CoreError::ValidationFailed("APN must be a string".into()))?;
                let _ = tx.send(Command::SetApn(apn.to_string()));
                Ok(())
            }))),
        );
    }
    {
        let tx = tx.clone();
        inst.insert(
            RES_AUTH_TYPE,
            Resource::Single(
                SingleResource::new(Value::Integer(APN_AUTH_TYPE_NONE)).with_write_hook(Box::new(move |value| {
                    let raw = value
                        .as_integer()
                        .ok_or_else(|| CoreError::ValidationFailed("auth type must be an integer".into()))?;
                    if auth_type_to_ofono(raw).is_none() {
                        return Err(CoreError::ValidationFailed("invalid LTE auth type".into()));
                    }
                    let _ = tx.send(Command::SetAuthType(raw));
                    Ok(())
                })),
            ),
        );
    }
    {
        let tx = tx.clone();
        inst.insert(
            RES_USERNAME,
            Resource::Single(SingleResource::new(Value::String(String::new())).with_write_hook(Box::new(move |value| {
                let s = value.as_str().ok_or_else(|| CoreError::ValidationFailed("username must be a string".into()))?;
                let _ = tx.send(Command::SetUsername(s.to_string()));
                Ok(())
            }))),
        );
    }
    {
        let tx = tx.clone();
        inst.insert(
            RES_SECRET,
            Resource::Single(SingleResource::new(Value::String(String::new())).with_write_hook(Box::new(move |value| {
                let s = value.as_str().ok_or_else(|| CoreError::ValidationFailed("secret must be a string".into()))?;
                let _ = tx.send(Command::SetSecret(s.to_string()));
                Ok(())
            }))),
        );
    }
    inst.insert(
        RES_PDN_TYPE,
        Resource::Single(
            SingleResource::new(Value::Integer(PdnType::NonIp.to_lwm2m())).with_write_hook(Box::new(move |value| {
                let raw = value
                    .as_integer()
                    .ok_or_else(|| CoreError::ValidationFailed("PDN type must be an integer".into()))?;
                if PdnType::from_lwm2m(raw).is_none() {
                    return Err(CoreError::ValidationFailed("invalid PDN type".into()));
                }
                let _ = tx.send(Command::SetPdnType(raw));
                Ok(())
            })),
        ),
    );
    inst.insert(RES_IP_ADDRESS, Resource::Single(SingleResource::new(Value::String(String::new()))));
    inst.insert(RES_SUBNET_MASK, Resource::Single(SingleResource::new(Value::String(String::new()))));
    inst.insert(RES_GATEWAY, Resource::Single(SingleResource::new(Value::String(String::new()))));
    inst.insert(
        RES_PRIMARY_DNS_ADDR,
        Resource::Single(SingleResource::new(Value::String(String::new()))),
    );
    inst.insert(
        RES_SECONDARY_DNS_ADDR,
        Resource::Single(SingleResource::new(Value::String(String::new()))),
    );

    let mut instances = BTreeMap::new();
    instances.insert(0, inst);
    BaseObject::static_object(instances)
}

async fn apply_apn_write(cellular_info: &Arc<dyn CellularInfo>, cmd: Command) -> bool {
    match cmd {
        Command::SetApn(apn) => cellular_info.set_lte_prop("DefaultAccessPointName", &apn).await,
        Command::SetAuthType(raw) => match auth_type_to_ofono(raw) {
            Some(ofono) => cellular_info.set_lte_prop("AuthenticationMethod", ofono).await,
            None => false,
        },
        Command::SetPdnType(raw) => match PdnType::from_lwm2m(raw) {
            Some(pdn) => cellular_info.set_lte_prop("Protocol", pdn.to_ofono()).await,
            None => false,
        },
        Command::SetUsername(s) => cellular_info.set_lte_prop("Username", &s).await,
        Command::SetSecret(s) => cellular_info.set_lte_prop("Password", &s).await,
    }
}

pub async fn run(
    tree: Arc<tokio::sync::Mutex<Tree>>,
    notifier: Arc<Notifier>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    cellular_info: Arc<dyn CellularInfo>,
) {
    while let Some(cmd) = rx.recv().await {
        let ok = apply_apn_write(&cellular_info, cmd).await;
        if !ok {
            tracing::warn!("failed to push an APN profile write through to oFono");
        }
        refresh_once(&tree, &notifier, &cellular_info).await;
    }
}

/// Periodic poll of network/connection properties into the tree
/// (spec §4.7's connmon RSSI/cell-identity resources plus the APN
/// profile's read-only connection-setting resources).
pub async fn refresh_task(tree: Arc<tokio::sync::Mutex<Tree>>, notifier: Arc<Notifier>, cellular_info: Arc<dyn CellularInfo>) {
    loop {
        refresh_once(&tree, &notifier, &cellular_info).await;
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    }
}

async fn refresh_once(tree: &tokio::sync::Mutex<Tree>, notifier: &Notifier, cellular_info: &Arc<dyn CellularInfo>) {
    let network_props = cellular_info.network_props().await;
    let connection_props = cellular_info.connection_props().await;

    let mut guard = tree.lock().await;
    write_network_props(&mut guard, &network_props);
    write_connection_props(&mut guard, &connection_props);
    drop(guard);

    let guard = tree.lock().await;
    notifier.notify_resource_changed(&guard, connmon::OBJECT_ID, 0, connmon::RES_RADIO_SIGNAL_STRENGTH).await;
    notifier.notify_instance_changed(&guard, APN_OBJECT_ID, 0).await;
}

fn write_network_props(tree: &mut Tree, props: &CellularNetworkProps) {
    if let Some(base) = tree.object_mut(connmon::OBJECT_ID) {
        if let Some(pct) = props.rssi_percent {
            connmon::set_rssi_dbm(base, crate::collaborators::network::rssi_percent_to_dbm(pct) as i64);
        }
        if let Some(inst) = base.get_mut(0) {
            if let Some(cell_id) = props.cell_id {
                if let Some(r) = inst.get_mut(connmon::RES_CELL_ID) {
                    let _ = r.write_single(Value::Integer(cell_id));
                }
            }
            if let Some(mnc) = props.mnc {
                if let Some(r) = inst.get_mut(connmon::RES_SMNC) {
                    let _ = r.write_single(Value::Integer(mnc));
                }
            }
            if let Some(mcc) = props.mcc {
                if let Some(r) = inst.get_mut(connmon::RES_SMCC) {
                    let _ = r.write_single(Value::Integer(mcc));
                }
            }
            if let Some(lac) = props.lac {
                if let Some(r) = inst.get_mut(connmon::RES_LAC) {
                    let _ = r.write_single(Value::Integer(lac));
                }
            }
        }
    }
}

fn write_connection_props(tree: &mut Tree, props: &CellularConnectionProps) {
    if let Some(base) = tree.object_mut(APN_OBJECT_ID) {
        if let Some(inst) = base.get_mut(0) {
            if let Some(apn) = &props.apn {
                if let Some(r) = inst.get_mut(RES_APN) {
                    let _ = r.write_single(Value::String(apn.clone()));
                }
            }
            if let Some(address) = &props.address {
                if let Some(r) = inst.get_mut(RES_IP_ADDRESS) {
                    let _ = r.write_single(Value::String(address.clone()));
                }
            }
            if let Some(gateway) = &props.gateway {
                if let Some(r) = inst.get_mut(RES_GATEWAY) {
                    let _ = r.write_single(Value::String(gateway.clone()));
                }
            }
            if let Some(netmask) = &props.netmask {
                if let Some(r) = inst.get_mut(RES_SUBNET_MASK) {
                    let _ = r.write_single(Value::String(netmask.clone()));
                }
            }
            if let Some(primary) = props.dns.first() {
                if let Some(r) = inst.get_mut(RES_PRIMARY_DNS_ADDR) {
                    let _ = r.write_single(Value::String(primary.clone()));
                }
            }
            if let Some(secondary) = props.dns.get(1) {
                if let Some(r) = inst.get_mut(RES_SECONDARY_DNS_ADDR) {
                    let _ = r.write_single(Value::String(secondary.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdn_type_round_trips_through_lwm2m_and_ofono_without_mixing_namespaces() {
        for pdn in [PdnType::NonIp, PdnType::Ipv4, PdnType::Ipv6, PdnType::Ipv4v6] {
            assert_eq!(PdnType::from_lwm2m(pdn.to_lwm2m()), Some(pdn));
        }
        assert_eq!(PdnType::from_ofono(PdnType::Ipv6.to_ofono()), Some(PdnType::Ipv6));
        assert_eq!(PdnType::from_ofono(PdnType::Ipv4v6.to_ofono()), Some(PdnType::Ipv4v6));
    }

    #[test]
    fn unknown_pdn_type_is_rejected_rather_than_guessed() {
        assert_eq!(PdnType::from_lwm2m(99), None);
    }

    #[test]
    fn auth_type_maps_pap_or_chap_onto_ofono_pap() {
        assert_eq!(auth_type_to_ofono(APN_AUTH_TYPE_PAP_OR_CHAP), Some("pap"));
        assert_eq!(auth_type_from_ofono("chap"), Some(APN_AUTH_TYPE_CHAP));
    }

    #[test]
    fn activated_profiles_reports_apn_instance_only_when_active() {
        let mut base = new_cellular_base_object();
        set_connection_active(&mut base, true);
        assert_eq!(
            base.get(0).unwrap().get(RES_ACTIVATED_PROFILES).unwrap().read_multi().unwrap(),
            vec![(0, Value::ObjectLink(APN_OBJECT_ID, 0))]
        );
        set_connection_active(&mut base, false);
        assert!(base.get(0).unwrap().get(RES_ACTIVATED_PROFILES).unwrap().read_multi().unwrap().is_empty());
    }
}
