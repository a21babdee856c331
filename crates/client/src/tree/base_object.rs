//! `BaseObject`: an ordered `InstanceId -> ObjectInstance` map with
//! create-on-POST, delete-on-DELETE, and the bootstrap reset-to-default
//! behavior spec'd in §4.2/§4.5.

use std::collections::BTreeMap;

use lwm2m_core::tlv::pack_object_instance;
use lwm2m_core::InstanceId;

use crate::error::CoreError;
use crate::tree::instance::ObjectInstance;

pub type InstanceFactory = Box<dyn Fn() -> ObjectInstance + Send + Sync>;
pub type DefaultFactory = Box<dyn Fn() -> BTreeMap<InstanceId, ObjectInstance> + Send + Sync>;
pub type TopologyChangeHook = Box<dyn Fn() + Send + Sync>;

pub struct BaseObject {
    instances: BTreeMap<InstanceId, ObjectInstance>,
    dynamic: bool,
    factory: Option<InstanceFactory>,
    default_factory: Option<DefaultFactory>,
    on_topology_change: Option<TopologyChangeHook>,
}

impl BaseObject {
    /// A static base object: fixed instances, no create/delete.
    pub fn static_object(instances: BTreeMap<InstanceId, ObjectInstance>) -> BaseObject {
        BaseObject {
            instances,
            dynamic: false,
            factory: None,
            default_factory: None,
            on_topology_change: None,
        }
    }

    /// A dynamic base object (e.g. Wi-Fi profiles): supports POST
    /// create / DELETE instance, and signals topology change on either.
    pub fn dynamic_object(
        instances: BTreeMap<InstanceId, ObjectInstance>,
        factory: InstanceFactory,
        on_topology_change: TopologyChangeHook,
    ) -> BaseObject {
        BaseObject {
            instances,
            dynamic: true,
            factory: Some(factory),
            default_factory: None,
            on_topology_change: Some(on_topology_change),
        }
    }

    /// A bootstrappable base object (Security/Server): static from the
    /// client's perspective (no server-visible create/delete of
    /// instances outside bootstrap) but resettable to its default
    /// single instance on DELETE `/O`.
    pub fn bootstrappable(default_factory: DefaultFactory) -> BaseObject {
        let instances = default_factory();
        BaseObject {
            instances,
            dynamic: false,
            factory: None,
            default_factory: Some(default_factory),
            on_topology_change: None,
        }
    }

    pub fn get(&self, id: InstanceId) -> Option<&ObjectInstance> {
        self.instances.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut ObjectInstance> {
        self.instances.get_mut(&id)
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.instances.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Pack every instance as an OBJECT_INSTANCE TLV, ascending id —
    /// the wire form when addressed by GET `/O`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (id, instance) in &self.instances {
            out.extend(pack_object_instance(*id, &instance.encode()));
        }
        out
    }

    /// POST with no payload: create a default instance at
    /// `max(existing)+1` (0 if empty).
    pub fn create_default(&mut self) -> Result<InstanceId, CoreError> {
        self.create(None)
    }

    /// POST with a TLV payload: create then atomically apply the
    /// payload, the same way an ObjectInstance PUT would.
    pub fn create(&mut self, payload: Option<&[u8]>) -> Result<InstanceId, CoreError> {
        let factory = self
            .factory
            .as_ref()
            .ok_or(CoreError::MethodNotAllowed)?;
        let next_id = self.instances.keys().next_back().map(|id| id + 1).unwrap_or(0);
        let mut instance = factory();
        if let Some(payload) = payload {
            instance.write_atomic(payload)?;
        }
        self.instances.insert(next_id, instance);
        if let Some(hook) = &self.on_topology_change {
            hook();
        }
        Ok(next_id)
    }

    /// DELETE on a dynamic instance. Static instances (including
    /// bootstrappable Security/Server ones) answer MethodNotAllowed.
    pub fn delete_instance(&mut self, id: InstanceId) -> Result<(), CoreError> {
        if !self.dynamic {
            return Err(CoreError::MethodNotAllowed);
        }
        if self.instances.remove(&id).is_none() {
            return Err(CoreError::NotFound);
        }
        if let Some(hook) = &self.on_topology_change {
            hook();
        }
        Ok(())
    }

    /// DELETE `/O`: reset to the post-bootstrap default instance set.
    /// Only meaningful for bootstrappable base objects.
    pub fn reset_to_default(&mut self) -> Result<(), CoreError> {
        let default_factory = self.default_factory.as_ref().ok_or(CoreError::MethodNotAllowed)?;
        self.instances = default_factory();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_default_picks_max_plus_one() {
        let mut base = BaseObject::dynamic_object(BTreeMap::new(), Box::new(ObjectInstance::new), Box::new(|| {}));
        assert_eq!(base.create_default().unwrap(), 0);
        assert_eq!(base.create_default().unwrap(), 1);
        base.delete_instance(0).unwrap();
        assert_eq!(base.create_default().unwrap(), 2);
    }

    #[test]
    fn delete_on_static_instance_is_not_allowed() {
        let mut instances = BTreeMap::new();
        instances.insert(0, ObjectInstance::new());
        let mut base = BaseObject::static_object(instances);
        assert!(matches!(base.delete_instance(0), Err(CoreError::MethodNotAllowed)));
    }

    #[test]
    fn reset_to_default_restores_initial_instances() {
        let mut base = BaseObject::bootstrappable(Box::new(|| {
            let mut m = BTreeMap::new();
            m.insert(0, ObjectInstance::new());
            m
        }));
        base.create(None).unwrap_err(); // no factory registered for bootstrappable objects
        assert_eq!(base.instance_ids().count(), 1);
        base.reset_to_default().unwrap();
        assert_eq!(base.instance_ids().count(), 1);
    }
}
