//! Observation fan-out: a changed resource notifies subscribers at the
//! resource, its owning instance, and its owning base object, each
//! with the TLV encoding of the node *they* subscribed to, not of the
//! node that changed.

use std::sync::Arc;

use lwm2m_core::{InstanceId, ObjectId, ResourceId};
use lwm2m_coap::{Endpoint, MediaType, ObserveRegistry};

use super::Tree;

pub struct Notifier {
    registry: Arc<ObserveRegistry>,
    endpoint: Arc<Endpoint>,
}

impl Notifier {
    pub fn new(registry: Arc<ObserveRegistry>, endpoint: Arc<Endpoint>) -> Notifier {
        Notifier { registry, endpoint }
    }

    pub fn registry(&self) -> &Arc<ObserveRegistry> {
        &self.registry
    }

    /// Called after a resource-level write's response has been
    /// prepared: mutate, encode the response, then notify, so an
    /// observer never sees a notification race ahead of the writer's
    /// own ACK. Fans out to observers of the resource, the instance,
    /// and the base object in turn.
    pub async fn notify_resource_changed(&self, tree: &Tree, object: ObjectId, instance: InstanceId, resource: ResourceId) {
        if let Ok(bytes) = tree.encode_resource(object, instance, resource) {
            let path = vec![object.to_string(), instance.to_string(), resource.to_string()];
            self.registry.notify(&self.endpoint, &path, MediaType::Tlv.code(), bytes).await;
        }
        self.notify_instance_changed(tree, object, instance).await;
    }

    pub async fn notify_instance_changed(&self, tree: &Tree, object: ObjectId, instance: InstanceId) {
        if let Ok(bytes) = tree.encode_instance(object, instance) {
            let path = vec![object.to_string(), instance.to_string()];
            self.registry.notify(&self.endpoint, &path, MediaType::Tlv.code(), bytes).await;
        }
        self.notify_base_object_changed(tree, object).await;
    }

    pub async fn notify_base_object_changed(&self, tree: &Tree, object: ObjectId) {
        if let Ok(bytes) = tree.encode_base_object(object) {
            let path = vec![object.to_string()];
            self.registry.notify(&self.endpoint, &path, MediaType::Tlv.code(), bytes).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::base_object::BaseObject;
    use crate::tree::instance::ObjectInstance;
    use crate::tree::resource::{Resource, SingleResource};
    use lwm2m_core::Value;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn resource_change_notifies_all_three_granularities() {
        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let registry = Arc::new(ObserveRegistry::new());
        let peer: std::net::SocketAddr = "127.0.0.1:9999".parse().unwrap();
        registry.register(vec!["3".into(), "0".into(), "13".into()], peer, vec![1]).await;
        registry.register(vec!["3".into(), "0".into()], peer, vec![2]).await;
        registry.register(vec!["3".into()], peer, vec![3]).await;

        let mut tree = Tree::new();
        let mut inst = ObjectInstance::new();
        inst.insert(13, Resource::Single(SingleResource::new(Value::Integer(1000))));
        let mut instances = BTreeMap::new();
        instances.insert(0, inst);
        tree.insert_object(3, BaseObject::static_object(instances));

        let notifier = Notifier::new(registry, endpoint);
        notifier.notify_resource_changed(&tree, 3, 0, 13).await;
        // No panics and no observers left dangling is the main property
        // under test here; the socket-level delivery is covered in
        // lwm2m-coap's own transport tests.
    }
}
