//! Object 4 (Connectivity Monitoring), grounded on `ig60_connmon.py`:
//! current-bearer resource derived from the bound interface name,
//! available-bearers multi-resource, RSSI (oFono percent -> dBm), and
//! cellular identity resources (cell id/MNC/MCC/LAC).

use std::collections::BTreeMap;

use lwm2m_core::Value;

use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::resource::{MultiResource, Resource, SingleResource};

pub const OBJECT_ID: u16 = 4;

pub const RES_NETWORK_BEARER: u16 = 0;
pub const RES_AVAILABLE_NETWORK_BEARER: u16 = 1;
pub const RES_RADIO_SIGNAL_STRENGTH: u16 = 2;
pub const RES_IP_ADDRESSES: u16 = 4;
pub const RES_APN: u16 = 7;
pub const RES_CELL_ID: u16 = 8;
pub const RES_SMNC: u16 = 9;
pub const RES_SMCC: u16 = 10;
pub const RES_LAC: u16 = 11;

/// OMA Network Bearer enum values this gateway can report.
pub const BEARER_LTE_FDD: i64 = 6;
pub const BEARER_WLAN: i64 = 21;
pub const BEARER_ETHERNET: i64 = 41;

/// Derives the OMA Network Bearer code from the interface name the
/// client is bound to, the same prefix sniffing `ig60_connmon.py`
/// does (`usb*` is the cellular modem's network device on this
/// gateway family, `wlan*` is Wi-Fi, anything else is Ethernet).
pub fn bearer_for_interface(interface: &str) -> i64 {
    if interface.starts_with("usb") {
        BEARER_LTE_FDD
    } else if interface.starts_with("wlan") {
        BEARER_WLAN
    } else {
        BEARER_ETHERNET
    }
}

pub fn new_base_object() -> BaseObject {
    let mut inst = ObjectInstance::new();
    inst.insert(
        RES_NETWORK_BEARER,
        Resource::Single(SingleResource::new(Value::Integer(BEARER_ETHERNET))),
    );
    inst.insert(
        RES_AVAILABLE_NETWORK_BEARER,
        Resource::Multi(MultiResource::new(lwm2m_core::ValueKind::Integer)),
    );
    inst.insert(
        RES_RADIO_SIGNAL_STRENGTH,
        Resource::Single(SingleResource::new(Value::Integer(0))),
    );
    inst.insert(
        RES_IP_ADDRESSES,
        Resource::Multi(MultiResource::new(lwm2m_core::ValueKind::String)),
    );
    inst.insert(RES_APN, Resource::Single(SingleResource::new(Value::String(String::new()))));
    inst.insert(RES_CELL_ID, Resource::Single(SingleResource::new(Value::Integer(0))));
    inst.insert(RES_SMNC, Resource::Single(SingleResource::new(Value::Integer(0))));
    inst.insert(RES_SMCC, Resource::Single(SingleResource::new(Value::Integer(0))));
    inst.insert(RES_LAC, Resource::Single(SingleResource::new(Value::Integer(0))));

    let mut instances = BTreeMap::new();
    instances.insert(0, inst);
    BaseObject::static_object(instances)
}

/// Set the current bearer and its bound IP, called by the bearer
/// supervisor right after it picks a candidate interface and address.
pub fn set_current_bearer(base: &mut BaseObject, interface: &str, ip: &str) {
    if let Some(inst) = base.get_mut(0) {
        if let Some(r) = inst.get_mut(RES_NETWORK_BEARER) {
            let _ = r.write_single(Value::Integer(bearer_for_interface(interface)));
        }
        if let Some(r) = inst.get_mut(RES_IP_ADDRESSES) {
            let _ = r.write_multi(vec![(0, Value::String(ip.to_string()))]);
        }
    }
}

pub fn set_rssi_dbm(base: &mut BaseObject, dbm: i64) {
    if let Some(inst) = base.get_mut(0) {
        if let Some(r) = inst.get_mut(RES_RADIO_SIGNAL_STRENGTH) {
            let _ = r.write_single(Value::Integer(dbm));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_derivation_follows_interface_prefix() {
        assert_eq!(bearer_for_interface("usb0"), BEARER_LTE_FDD);
        assert_eq!(bearer_for_interface("wlan0"), BEARER_WLAN);
        assert_eq!(bearer_for_interface("eth0"), BEARER_ETHERNET);
    }

    #[test]
    fn set_current_bearer_updates_both_resources() {
        let mut base = new_base_object();
        set_current_bearer(&mut base, "wlan0", "192.0.2.5");
        let inst = base.get(0).unwrap();
        assert_eq!(
            inst.get(RES_NETWORK_BEARER).unwrap().read_single().unwrap(),
            Value::Integer(BEARER_WLAN)
        );
        assert_eq!(
            inst.get(RES_IP_ADDRESSES).unwrap().read_multi().unwrap(),
            vec![(0, Value::String("192.0.2.5".to_string()))]
        );
    }
}
