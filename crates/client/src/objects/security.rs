//! Object 0 (Security): a bootstrappable base object that resets to a
//! single bootstrap-server instance on DELETE and ends up,
//! post-bootstrap, holding exactly one LwM2M-server instance at
//! index 1.

use std::collections::BTreeMap;

use lwm2m_core::Value;

use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::resource::{Resource, SingleResource};

pub const RES_LWM2M_SERVER_URI: u16 = 0;
pub const RES_BOOTSTRAP_SERVER: u16 = 1;
pub const RES_SECURITY_MODE: u16 = 2;
pub const RES_PUBLIC_KEY_OR_IDENTITY: u16 = 3;
pub const RES_SECRET_KEY: u16 = 5;
pub const RES_SHORT_SERVER_ID: u16 = 10;

/// PSK is security mode 0 in the OMA registry; this client never
/// negotiates RPK or X.509.
pub const SECURITY_MODE_PSK: i64 = 0;

fn instance(uri: &str, is_bootstrap_server: bool, identity: &[u8], secret: &[u8], short_id: i64) -> ObjectInstance {
    let mut inst = ObjectInstance::new();
    inst.insert(
        RES_LWM2M_SERVER_URI,
        Resource::Single(SingleResource::new(Value::String(uri.to_string()))),
    );
    inst.insert(
        RES_BOOTSTRAP_SERVER,
        Resource::Single(SingleResource::new(Value::Boolean(is_bootstrap_server))),
    );
    inst.insert(
        RES_SECURITY_MODE,
        Resource::Single(SingleResource::new(Value::Integer(SECURITY_MODE_PSK))),
    );
    inst.insert(
        RES_PUBLIC_KEY_OR_IDENTITY,
        Resource::Single(SingleResource::new(Value::Opaque(identity.to_vec()))),
    );
    inst.insert(
        RES_SECRET_KEY,
        Resource::Single(SingleResource::new(Value::Opaque(secret.to_vec()))),
    );
    inst.insert(
        RES_SHORT_SERVER_ID,
        Resource::Single(SingleResource::new(Value::Integer(short_id))),
    );
    inst
}

/// The object's shape right after `DELETE /0` resets it: a bootstrap-
/// server entry at instance 0, plus an empty placeholder at instance 1
/// for the LwM2M server entry the bootstrap server writes during
/// `WRITING`. There is no create-on-PUT path anywhere in
/// the CoAP site, so instance 1 must already exist before the
/// bootstrap server's `PUT /0/1` can land.
pub fn default_instances(bootstrap_uri: &str, endpoint: &str) -> BTreeMap<u16, ObjectInstance> {
    let mut map = BTreeMap::new();
    map.insert(0, instance(bootstrap_uri, true, endpoint.as_bytes(), &[], 0));
    map.insert(1, instance("", false, &[], &[], 0));
    map
}

pub fn new_base_object(bootstrap_uri: &str, endpoint: &str) -> BaseObject {
    let bootstrap_uri = bootstrap_uri.to_string();
    let endpoint = endpoint.to_string();
    BaseObject::bootstrappable(Box::new(move || default_instances(&bootstrap_uri, &endpoint)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_instance_is_the_bootstrap_server_entry() {
        let instances = default_instances("coap://bs:5683", "urn:imei:123");
        assert_eq!(instances.len(), 2);
        let inst = &instances[&0];
        assert_eq!(
            inst.get(RES_BOOTSTRAP_SERVER).unwrap().read_single().unwrap(),
            Value::Boolean(true)
        );
    }
}
