//! Object 13 (Bearer Selection), grounded on `ig60_bearer.py`: a
//! preferred-bearer multi-resource ordered by instance id, where
//! `auto` expands to the concrete list `[ethernet, wlan, lte]`, and a
//! write callback that stops the running client so the bearer
//! supervisor (`crate::bearer`) re-evaluates its candidate list (spec
//! §4.8).

use std::collections::BTreeMap;
use std::sync::Arc;

use lwm2m_core::{Value, ValueKind};

use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::resource::{MultiResource, Resource};

pub const OBJECT_ID: u16 = 13;
pub const RES_PREFERRED_BEARER: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bearer {
    Ethernet,
    Wlan,
    Lte,
}

/// One raw entry in the preferred-bearer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    Auto,
    Ethernet,
    Wlan,
    Lte3gpp,
}

impl Preference {
    pub fn parse(s: &str) -> Option<Preference> {
        match s {
            "auto" => Some(Preference::Auto),
            "ethernet" => Some(Preference::Ethernet),
            "wlan" => Some(Preference::Wlan),
            "3gpp-lte" => Some(Preference::Lte3gpp),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Preference::Auto => "auto",
            Preference::Ethernet => "ethernet",
            Preference::Wlan => "wlan",
            Preference::Lte3gpp => "3gpp-lte",
        }
    }
}

/// Flattens a raw preference list into concrete bearers in priority
/// order, expanding `auto` to `[ethernet, wlan, lte]` in place and
/// dropping duplicates so a repeated candidate is only tried once.
pub fn expand(preferences: &[Preference]) -> Vec<Bearer> {
    let mut out = Vec::new();
    for pref in preferences {
        let expanded: &[Bearer] = match pref {
            Preference::Auto => &[Bearer::Ethernet, Bearer::Wlan, Bearer::Lte],
            Preference::Ethernet => &[Bearer::Ethernet],
            Preference::Wlan => &[Bearer::Wlan],
            Preference::Lte3gpp => &[Bearer::Lte],
        };
        for bearer in expanded {
            if !out.contains(bearer) {
                out.push(*bearer);
            }
        }
    }
    out
}

pub fn new_base_object(default_preferences: &[&str], restart_signal: Arc<tokio::sync::Notify>) -> BaseObject {
    let mut values = BTreeMap::new();
    for (i, pref) in default_preferences.iter().enumerate() {
        values.insert(i as u16, Value::String(pref.to_string()));
    }
    let resource = MultiResource::from_instances(ValueKind::String, values).with_write_hook(Box::new(move |_items| {
        restart_signal.notify_one();
    }));

    let mut inst = ObjectInstance::new();
    inst.insert(RES_PREFERRED_BEARER, Resource::Multi(resource));
    let mut instances = BTreeMap::new();
    instances.insert(0, inst);
    BaseObject::static_object(instances)
}

/// Reads the resource back as the ordered, parsed preference list the
/// supervisor walks (spec §4.8 step "reads the Object 13
/// preferred-bearer multi-resource ... ordered by instance id").
/// Entries that fail to parse are skipped.
pub fn read_preferences(base: &BaseObject) -> Vec<Preference> {
    let Some(inst) = base.get(0) else {
        return Vec::new();
    };
    let Some(resource) = inst.get(RES_PREFERRED_BEARER) else {
        return Vec::new();
    };
    let Ok(items) = resource.read_multi() else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|(_, value)| value.as_str().and_then(Preference::parse))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    #[test]
    fn auto_expands_to_ethernet_wlan_lte_in_order() {
        assert_eq!(
            expand(&[Preference::Auto]),
            vec![Bearer::Ethernet, Bearer::Wlan, Bearer::Lte]
        );
    }

    #[test]
    fn explicit_preferences_are_not_reordered() {
        assert_eq!(
            expand(&[Preference::Wlan, Preference::Ethernet]),
            vec![Bearer::Wlan, Bearer::Ethernet]
        );
    }

    #[test]
    fn duplicate_candidates_are_deduped() {
        assert_eq!(
            expand(&[Preference::Ethernet, Preference::Auto]),
            vec![Bearer::Ethernet, Bearer::Wlan, Bearer::Lte]
        );
    }

    #[test]
    fn write_to_preference_resource_signals_restart() {
        let signal = Arc::new(tokio::sync::Notify::new());
        let mut base = new_base_object(&["auto"], Arc::clone(&signal));
        let notified = signal.notified();
        tokio::pin!(notified);

        let mut items = base.get(0).unwrap().get(RES_PREFERRED_BEARER).unwrap().read_multi().unwrap();
        items.push((1, Value::String("ethernet".into())));
        base.get_mut(0)
            .unwrap()
            .get_mut(RES_PREFERRED_BEARER)
            .unwrap()
            .write_multi(items)
            .unwrap();

        assert!(notified.now_or_never().is_some());
    }
}
