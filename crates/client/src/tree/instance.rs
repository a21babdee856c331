//! `ObjectInstance`: an ordered `ResourceId -> Resource` map with the
//! atomic whole-instance write spec'd in §4.2.

use std::collections::BTreeMap;

use lwm2m_core::tlv::{self, TlvKind};
use lwm2m_core::{ResourceId, Value};

use crate::error::CoreError;
use crate::tree::resource::Resource;

pub struct ObjectInstance {
    resources: BTreeMap<ResourceId, Resource>,
}

impl ObjectInstance {
    pub fn new() -> ObjectInstance {
        ObjectInstance {
            resources: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, id: ResourceId, resource: Resource) {
        self.resources.insert(id, resource);
    }

    pub fn get(&self, id: ResourceId) -> Option<&Resource> {
        self.resources.get(&id)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut Resource> {
        self.resources.get_mut(&id)
    }

    pub fn resource_ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.resources.keys().copied()
    }

    /// Pack this instance's resources as concatenated TLVs, ascending
    /// id, with no ObjectInstance wrapper — the wire form when
    /// addressed directly by GET `/O/I`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (id, resource) in &self.resources {
            out.extend(resource.encode(*id));
        }
        out
    }

    /// Apply a PUT/POST payload of resource/multi-resource TLVs
    /// atomically: every item is decoded and variant-checked against
    /// the existing resource before any mutation; unknown resource ids
    /// are silently skipped (forward compatibility), any other failure
    /// aborts with no mutation at all.
    pub fn write_atomic(&mut self, payload: &[u8]) -> Result<(), CoreError> {
        enum Pending {
            Single(ResourceId, Value),
            Multi(ResourceId, Vec<(lwm2m_core::ResourceInstanceId, Value)>),
        }

        let mut pending = Vec::new();
        let mut rest = payload;
        while !rest.is_empty() {
            let (kind, id, value_bytes, remain) = tlv::decode_tlv(rest)?;
            rest = remain;

            let Some(resource) = self.resources.get(&id) else {
                continue;
            };
            let Some(value_kind) = resource.kind() else {
                return Err(CoreError::MethodNotAllowed);
            };

            match kind {
                TlvKind::ResourceValue => {
                    let value = tlv::decode_value(value_kind, value_bytes)?;
                    if value.kind() != value_kind {
                        return Err(CoreError::VariantMismatch {
                            expected: value_kind,
                            got: value.kind(),
                        });
                    }
                    pending.push(Pending::Single(id, value));
                }
                TlvKind::MultipleResource => {
                    let instances = tlv::decode_multi_resource(value_kind, value_bytes)?;
                    pending.push(Pending::Multi(id, instances));
                }
                TlvKind::ObjectInstance | TlvKind::ResourceInstance => {
                    return Err(CoreError::ValidationFailed(
                        "object-instance payload must contain only resource-level TLVs".into(),
                    ));
                }
            }
        }

        for item in pending {
            match item {
                Pending::Single(id, value) => {
                    self.resources.get_mut(&id).unwrap().write_single(value)?;
                }
                Pending::Multi(id, instances) => {
                    self.resources.get_mut(&id).unwrap().write_multi(instances)?;
                }
            }
        }
        Ok(())
    }
}

impl Default for ObjectInstance {
    fn default() -> Self {
        ObjectInstance::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::resource::SingleResource;
    use lwm2m_core::tlv::pack_resource_value;

    fn instance_with(id0: Value, id1: Value) -> ObjectInstance {
        let mut inst = ObjectInstance::new();
        inst.insert(0, Resource::Single(SingleResource::new(id0)));
        inst.insert(1, Resource::Single(SingleResource::new(id1)));
        inst
    }

    #[test]
    fn atomic_write_applies_all_or_nothing() {
        let mut inst = instance_with(Value::String("a".into()), Value::Integer(1));
        let mut payload = pack_resource_value(0, &Value::String("b".into()));
        payload.extend(pack_resource_value(1, &Value::String("wrong-variant".into())));

        let result = inst.write_atomic(&payload);
        assert!(result.is_err());
        assert_eq!(inst.get(0).unwrap().read_single().unwrap(), Value::String("a".into()));
        assert_eq!(inst.get(1).unwrap().read_single().unwrap(), Value::Integer(1));
    }

    #[test]
    fn atomic_write_succeeds_when_all_items_valid() {
        let mut inst = instance_with(Value::String("a".into()), Value::Integer(1));
        let mut payload = pack_resource_value(0, &Value::String("b".into()));
        payload.extend(pack_resource_value(1, &Value::Integer(2)));

        inst.write_atomic(&payload).unwrap();
        assert_eq!(inst.get(0).unwrap().read_single().unwrap(), Value::String("b".into()));
        assert_eq!(inst.get(1).unwrap().read_single().unwrap(), Value::Integer(2));
    }

    #[test]
    fn unknown_resource_id_is_silently_ignored() {
        let mut inst = instance_with(Value::String("a".into()), Value::Integer(1));
        let payload = pack_resource_value(99, &Value::Integer(7));
        inst.write_atomic(&payload).unwrap();
        assert_eq!(inst.get(0).unwrap().read_single().unwrap(), Value::String("a".into()));
    }
}
