//! The LwM2M object tree: `BaseObject -> ObjectInstance -> Resource`,
//! a plain owned structure with no internal locking or back-pointers.
//! Concurrent access goes through the single `Arc<Mutex<Tree>>` the
//! caller wraps it in, not through anything in here.

pub mod base_object;
pub mod instance;
pub mod observe;
pub mod resource;

use std::collections::BTreeMap;

use lwm2m_core::{InstanceId, ObjectId, Path, ResourceId};

use crate::error::CoreError;
use base_object::BaseObject;

pub struct Tree {
    objects: BTreeMap<ObjectId, BaseObject>,
    /// Raised whenever a dynamic base object gains or loses an
    /// instance, so the registration driver can re-register its
    /// updated object-links list.
    pub topology_changed: std::sync::Arc<tokio::sync::Notify>,
}

impl Tree {
    pub fn new() -> Tree {
        Tree {
            objects: BTreeMap::new(),
            topology_changed: std::sync::Arc::new(tokio::sync::Notify::new()),
        }
    }

    pub fn insert_object(&mut self, id: ObjectId, object: BaseObject) {
        self.objects.insert(id, object);
    }

    pub fn object(&self, id: ObjectId) -> Option<&BaseObject> {
        self.objects.get(&id)
    }

    pub fn object_mut(&mut self, id: ObjectId) -> Option<&mut BaseObject> {
        self.objects.get_mut(&id)
    }

    /// Every registered object id, including ones with zero instances
    /// (the registration driver still lists them as `</O>`).
    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    pub fn encode_base_object(&self, object: ObjectId) -> Result<Vec<u8>, CoreError> {
        Ok(self.objects.get(&object).ok_or(CoreError::NotFound)?.encode())
    }

    pub fn encode_instance(&self, object: ObjectId, instance: InstanceId) -> Result<Vec<u8>, CoreError> {
        let base = self.objects.get(&object).ok_or(CoreError::NotFound)?;
        let inst = base.get(instance).ok_or(CoreError::NotFound)?;
        Ok(inst.encode())
    }

    pub fn encode_resource(
        &self,
        object: ObjectId,
        instance: InstanceId,
        res: ResourceId,
    ) -> Result<Vec<u8>, CoreError> {
        let base = self.objects.get(&object).ok_or(CoreError::NotFound)?;
        let inst = base.get(instance).ok_or(CoreError::NotFound)?;
        let resource = inst.get(res).ok_or(CoreError::NotFound)?;
        Ok(resource.encode(res))
    }

    pub fn read(&self, path: Path) -> Result<Vec<u8>, CoreError> {
        match path {
            Path::Object(o) => self.encode_base_object(o),
            Path::Instance(o, i) => self.encode_instance(o, i),
            Path::Resource(o, i, r) => self.encode_resource(o, i, r),
            Path::ResourceInstance(o, i, r, ri) => {
                let base = self.objects.get(&o).ok_or(CoreError::NotFound)?;
                let inst = base.get(i).ok_or(CoreError::NotFound)?;
                let resource = inst.get(r).ok_or(CoreError::NotFound)?;
                let value = resource
                    .read_multi()?
                    .into_iter()
                    .find(|(id, _)| *id == ri)
                    .map(|(_, v)| v)
                    .ok_or(CoreError::NotFound)?;
                Ok(lwm2m_core::tlv::pack_resource_instance(ri, &value))
            }
        }
    }

    /// Paths registered to the tree, in the link-format the
    /// registration driver needs: every object with instances
    /// contributes `</O/I>` per instance; an object with none
    /// contributes a single `</O>`.
    pub fn registration_links(&self) -> Vec<String> {
        let mut links = Vec::new();
        for (object, base) in &self.objects {
            if base.is_empty() {
                links.push(format!("</{object}>"));
            } else {
                for instance in base.instance_ids() {
                    links.push(format!("</{object}/{instance}>"));
                }
            }
        }
        links
    }
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::instance::ObjectInstance;
    use crate::tree::resource::{Resource, SingleResource};
    use lwm2m_core::Value;

    fn device_tree() -> Tree {
        let mut tree = Tree::new();
        let mut inst = ObjectInstance::new();
        inst.insert(0, Resource::Single(SingleResource::new(Value::String("Laird Connectivity, Inc.".into()))));
        inst.insert(1, Resource::Single(SingleResource::new(Value::String("IG60".into()))));
        inst.insert(3, Resource::Single(SingleResource::new(Value::String("1.0".into()))));
        let mut instances = BTreeMap::new();
        instances.insert(0, inst);
        tree.insert_object(3, BaseObject::static_object(instances));
        tree
    }

    #[test]
    fn get_object_instance_lists_resources_ascending() {
        let tree = device_tree();
        let bytes = tree.read(Path::Instance(3, 0)).unwrap();
        let (kind, id, _, rest) = lwm2m_core::tlv::decode_tlv(&bytes).unwrap();
        assert_eq!(kind, lwm2m_core::TlvKind::ResourceValue);
        assert_eq!(id, 0);
        assert!(!rest.is_empty());
    }

    #[test]
    fn registration_links_use_object_only_form_when_empty() {
        let mut tree = Tree::new();
        tree.insert_object(4, BaseObject::static_object(BTreeMap::new()));
        assert_eq!(tree.registration_links(), vec!["</4>".to_string()]);
    }

    #[test]
    fn registration_links_list_each_instance() {
        let tree = device_tree();
        assert_eq!(tree.registration_links(), vec!["</3/0>".to_string()]);
    }
}
