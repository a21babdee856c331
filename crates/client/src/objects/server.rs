//! Object 1 (Server), grounded on the same bootstrap flow as
//! `objects::security`: resets to a single default instance on DELETE,
//! ends up holding exactly one instance at index 0 post-bootstrap.

use std::collections::BTreeMap;

use lwm2m_core::Value;

use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::resource::{Resource, SingleResource};

pub const RES_SHORT_SERVER_ID: u16 = 0;
pub const RES_LIFETIME: u16 = 1;
pub const RES_NOTIFICATION_STORING: u16 = 6;
pub const RES_BINDING: u16 = 7;

fn instance(short_id: i64, lifetime: i64) -> ObjectInstance {
    let mut inst = ObjectInstance::new();
    inst.insert(
        RES_SHORT_SERVER_ID,
        Resource::Single(SingleResource::new(Value::Integer(short_id))),
    );
    inst.insert(RES_LIFETIME, Resource::Single(SingleResource::new(Value::Integer(lifetime))));
    inst.insert(
        RES_NOTIFICATION_STORING,
        Resource::Single(SingleResource::new(Value::Boolean(false))),
    );
    inst.insert(
        RES_BINDING,
        Resource::Single(SingleResource::new(Value::String("U".to_string()))),
    );
    inst
}

pub fn default_instances(lifetime_secs: u32) -> BTreeMap<u16, ObjectInstance> {
    let mut map = BTreeMap::new();
    map.insert(0, instance(0, lifetime_secs as i64));
    map
}

pub fn new_base_object(lifetime_secs: u32) -> BaseObject {
    BaseObject::bootstrappable(Box::new(move || default_instances(lifetime_secs)))
}

/// Read the lifetime back out of instance 0, as the bootstrap handler
/// does once `FINISHED` arrives (spec §4.5) — a positive value
/// overrides the CLI default.
pub fn read_lifetime(base: &BaseObject) -> Option<u32> {
    let inst = base.get(0)?;
    match inst.get(RES_LIFETIME)?.read_single().ok()? {
        Value::Integer(v) if v > 0 => Some(v as u32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_instance_carries_the_given_lifetime() {
        let base = new_base_object(3600);
        assert_eq!(read_lifetime(&base), Some(3600));
    }
}
