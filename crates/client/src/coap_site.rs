//! Bridges the object tree into a `lwm2m_coap::Site`: one routable
//! node per current tree path plus the handful of fixed
//! endpoints that never go through the tree at all — Bootstrap-Finish
//! at `/bs` (`lwm2m.client.LwM2MBootstrapFinish`) and the Block1
//! package-upload resources for Objects 5/9 (`lwm2m.block`). A
//! dynamic object (Object 12's Wi-Fi profiles) gaining or losing an
//! instance makes the whole site stale, so it is rebuilt from scratch
//! on every `Tree::topology_changed` signal rather than patched in
//! place.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use lwm2m_core::tlv::{self, TlvKind};
use lwm2m_core::{Path, ResourceId};
use tokio::sync::Mutex as AsyncMutex;

use crate::block::{Block1Assembler, FileSink};
use crate::error::CoreError;
use crate::tree::observe::Notifier;
use crate::tree::Tree;

fn error_response(err: CoreError) -> lwm2m_coap::Message {
    lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, err.response_code(), 0)
}

fn path_segments(path: Path) -> Vec<String> {
    match path {
        Path::Object(o) => vec![o.to_string()],
        Path::Instance(o, i) => vec![o.to_string(), i.to_string()],
        Path::Resource(o, i, r) => vec![o.to_string(), i.to_string(), r.to_string()],
        Path::ResourceInstance(o, i, r, ri) => vec![o.to_string(), i.to_string(), r.to_string(), ri.to_string()],
    }
}

async fn notify_for_path(notifier: &Notifier, tree: &Tree, path: Path) {
    match path {
        Path::Object(o) => notifier.notify_base_object_changed(tree, o).await,
        Path::Instance(o, i) => notifier.notify_instance_changed(tree, o, i).await,
        Path::Resource(o, i, r) => notifier.notify_resource_changed(tree, o, i, r).await,
        Path::ResourceInstance(o, i, r, _) => notifier.notify_resource_changed(tree, o, i, r).await,
    }
}

/// Applies a PUT payload at `path`, the way `ObjectInstance::write_atomic`
/// does it one level up: decode the outer TLV record's own kind
/// (ResourceValue vs MultipleResource) rather than guessing from the
/// target resource's shape, since the wire form already says which one
/// it is.
fn write_resource(tree: &mut Tree, path: Path, payload: &[u8]) -> Result<(), CoreError> {
    match path {
        Path::Object(_) => Err(CoreError::MethodNotAllowed),
        Path::Instance(object, instance) => {
            let base = tree.object_mut(object).ok_or(CoreError::NotFound)?;
            let inst = base.get_mut(instance).ok_or(CoreError::NotFound)?;
            inst.write_atomic(payload)
        }
        Path::Resource(object, instance, resource) => {
            let base = tree.object_mut(object).ok_or(CoreError::NotFound)?;
            let inst = base.get_mut(instance).ok_or(CoreError::NotFound)?;
            let res = inst.get_mut(resource).ok_or(CoreError::NotFound)?;
            let kind = res.kind().ok_or(CoreError::MethodNotAllowed)?;
            let (tlv_kind, id, value_bytes, _rest) = tlv::decode_tlv(payload)?;
            if id != resource {
                return Err(CoreError::ValidationFailed(
                    "resource id in the PUT payload does not match the request path".into(),
                ));
            }
            match tlv_kind {
                TlvKind::ResourceValue => res.write_single(tlv::decode_value(kind, value_bytes)?),
                TlvKind::MultipleResource => res.write_multi(tlv::decode_multi_resource(kind, value_bytes)?),
                TlvKind::ObjectInstance | TlvKind::ResourceInstance => Err(CoreError::ValidationFailed(
                    "expected a resource-level TLV record".into(),
                )),
            }
        }
        Path::ResourceInstance(..) => Err(CoreError::MethodNotAllowed),
    }
}

/// One exact-path node in the object tree. Every depth (object,
/// instance, resource) answers through the same struct, dispatching
/// on which `Path` variant it was registered for — mirroring how
/// `LwM2MBaseObject`/`LwM2MObjectInst`/`LwM2MResourceValue` each
/// answer their own verbs in the original, just collapsed into one
/// Rust type instead of three Python classes.
struct TreeNode {
    tree: Arc<AsyncMutex<Tree>>,
    notifier: Arc<Notifier>,
    registry: Arc<lwm2m_coap::ObserveRegistry>,
    path: Path,
}

#[async_trait]
impl lwm2m_coap::Resource for TreeNode {
    async fn render_get(&self, req: &lwm2m_coap::Request) -> lwm2m_coap::Message {
        let guard = self.tree.lock().await;
        let bytes = match guard.read(self.path) {
            Ok(bytes) => bytes,
            Err(e) => return error_response(e),
        };
        drop(guard);

        let mut msg = lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, lwm2m_coap::Code::CONTENT, 0)
            .with_payload(bytes);
        msg.options.push_uint(
            lwm2m_coap::OptionNumber::ContentFormat,
            lwm2m_coap::MediaType::Tlv.code() as u32,
        );
        if req.wants_observe() {
            self.registry
                .register(path_segments(self.path), req.peer, req.message.token.clone())
                .await;
            msg.options.push_uint(lwm2m_coap::OptionNumber::Observe, 0);
        }
        msg
    }

    async fn render_put(&self, req: &lwm2m_coap::Request) -> lwm2m_coap::Message {
        if req.content_format() != Some(lwm2m_coap::MediaType::Tlv.code()) {
            return error_response(CoreError::WrongContentFormat(req.content_format()));
        }
        let result = {
            let mut guard = self.tree.lock().await;
            write_resource(&mut guard, self.path, req.payload())
        };
        match result {
            Ok(()) => {
                let guard = self.tree.lock().await;
                notify_for_path(&self.notifier, &guard, self.path).await;
                lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, lwm2m_coap::Code::CHANGED, 0)
            }
            Err(e) => error_response(e),
        }
    }

    async fn render_post(&self, req: &lwm2m_coap::Request) -> lwm2m_coap::Message {
        match self.path {
            Path::Object(object) => {
                let mut guard = self.tree.lock().await;
                let Some(base) = guard.object_mut(object) else {
                    return error_response(CoreError::NotFound);
                };
                let payload = req.payload();
                let created = if payload.is_empty() {
                    base.create_default()
                } else {
                    base.create(Some(payload))
                };
                match created {
                    Ok(instance) => {
                        notify_for_path(&self.notifier, &guard, Path::Object(object)).await;
                        let mut msg =
                            lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, lwm2m_coap::Code::CREATED, 0);
                        msg.options
                            .push(lwm2m_coap::OptionNumber::LocationPath, object.to_string().into_bytes());
                        msg.options
                            .push(lwm2m_coap::OptionNumber::LocationPath, instance.to_string().into_bytes());
                        msg
                    }
                    Err(e) => error_response(e),
                }
            }
            Path::Resource(object, instance, resource) => {
                let mut guard = self.tree.lock().await;
                let Some(base) = guard.object_mut(object) else {
                    return error_response(CoreError::NotFound);
                };
                let Some(inst) = base.get_mut(instance) else {
                    return error_response(CoreError::NotFound);
                };
                let Some(res) = inst.get_mut(resource) else {
                    return error_response(CoreError::NotFound);
                };
                match res.execute() {
                    Ok(()) => lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, lwm2m_coap::Code::CHANGED, 0),
                    Err(e) => error_response(e),
                }
            }
            _ => lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, lwm2m_coap::Code::METHOD_NOT_ALLOWED, 0),
        }
    }

    async fn render_delete(&self, _req: &lwm2m_coap::Request) -> lwm2m_coap::Message {
        let mut guard = self.tree.lock().await;
        let result = match self.path {
            Path::Object(object) => guard
                .object_mut(object)
                .ok_or(CoreError::NotFound)
                .and_then(|base| base.reset_to_default()),
            Path::Instance(object, instance) => guard
                .object_mut(object)
                .ok_or(CoreError::NotFound)
                .and_then(|base| base.delete_instance(instance)),
            _ => Err(CoreError::MethodNotAllowed),
        };
        match result {
            Ok(()) => {
                notify_for_path(&self.notifier, &guard, Path::Object(self.path.object())).await;
                lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, lwm2m_coap::Code::DELETED, 0)
            }
            Err(e) => error_response(e),
        }
    }
}

/// `/bs`: the bootstrap server's Bootstrap-Finish POST, grounded on
/// `lwm2m.client.LwM2MBootstrapFinish`. Registered for the
/// lifetime of one bootstrap attempt only; `main` drops it from the
/// post-bootstrap site.
pub struct BootstrapFinishResource {
    finished: Arc<tokio::sync::Notify>,
}

impl BootstrapFinishResource {
    pub fn new(finished: Arc<tokio::sync::Notify>) -> BootstrapFinishResource {
        BootstrapFinishResource { finished }
    }
}

#[async_trait]
impl lwm2m_coap::Resource for BootstrapFinishResource {
    async fn render_post(&self, _req: &lwm2m_coap::Request) -> lwm2m_coap::Message {
        self.finished.notify_one();
        lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, lwm2m_coap::Code::CHANGED, 0)
    }
}

/// A Block1 PUT target for a package resource (`/5/0/0`, `/9/0/2`),
/// grounded on `lwm2m.block.LwM2MBlockwiseFileResource`: every block
/// lands through one shared `Block1Assembler` so out-of-order or
/// restarted sequences are rejected the same way a single Python
/// instance attribute (`self.last_block_number`) would catch them.
/// `on_complete` fires once the final block has been written, the
/// server-side counterpart to the URI-triggered download completing.
pub struct PackageUploadResource {
    assembler: AsyncMutex<Block1Assembler>,
    dest: PathBuf,
    on_complete: Box<dyn Fn() + Send + Sync>,
}

impl PackageUploadResource {
    pub fn new(dest: impl Into<PathBuf>, on_complete: Box<dyn Fn() + Send + Sync>) -> PackageUploadResource {
        PackageUploadResource {
            assembler: AsyncMutex::new(Block1Assembler::new()),
            dest: dest.into(),
            on_complete,
        }
    }
}

#[async_trait]
impl lwm2m_coap::Resource for PackageUploadResource {
    async fn render_put(&self, req: &lwm2m_coap::Request) -> lwm2m_coap::Message {
        let block1 = match req.message.options.block1() {
            Some(Ok(block)) => Some(block),
            Some(Err(_)) => return lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, lwm2m_coap::Code::BAD_OPTION, 0),
            None => None,
        };

        let mut sink = FileSink::new(self.dest.clone());
        let mut assembler = self.assembler.lock().await;
        match assembler.accept(&mut sink, req.content_format(), block1, req.payload()).await {
            Ok((code, response_block)) => {
                let mut msg = lwm2m_coap::Message::new(lwm2m_coap::MessageType::Acknowledgement, code, 0);
                if let Some(block) = response_block {
                    msg.options.push_block1(block);
                }
                if code == lwm2m_coap::Code::CHANGED {
                    (self.on_complete)();
                }
                msg
            }
            Err(e) => error_response(e),
        }
    }
}

/// The fixed (non-tree) resources every site build carries along.
#[derive(Clone)]
pub struct FixedResources {
    pub bootstrap_finish: Option<Arc<dyn lwm2m_coap::Resource>>,
    pub firmware_package: Arc<dyn lwm2m_coap::Resource>,
    pub software_package: Arc<dyn lwm2m_coap::Resource>,
    pub syslog_read_all: Arc<dyn lwm2m_coap::Resource>,
    pub syslog_read_incremental: Arc<dyn lwm2m_coap::Resource>,
}

/// Builds a fresh `Site` from the tree's present shape: one `TreeNode`
/// per object/instance/resource path it currently has, plus the fixed
/// resources. Called once at startup and again every time
/// `Tree::topology_changed` fires.
pub async fn build_site(
    tree: Arc<AsyncMutex<Tree>>,
    notifier: Arc<Notifier>,
    registry: Arc<lwm2m_coap::ObserveRegistry>,
    fixed: FixedResources,
) -> lwm2m_coap::Site {
    let mut site = lwm2m_coap::Site::new();

    if let Some(bootstrap_finish) = fixed.bootstrap_finish {
        site.add_resource(&["bs"], bootstrap_finish);
    }
    let firmware_package_path = [crate::objects::fwupdate::OBJECT_ID.to_string(), "0".to_string(), crate::objects::fwupdate::RES_PACKAGE.to_string()];
    site.add_resource(
        &firmware_package_path.each_ref().map(String::as_str),
        fixed.firmware_package,
    );
    let software_package_path = [crate::objects::swmgmt::OBJECT_ID.to_string(), "0".to_string(), crate::objects::swmgmt::RES_PACKAGE.to_string()];
    site.add_resource(
        &software_package_path.each_ref().map(String::as_str),
        fixed.software_package,
    );
    let syslog_read_all_path = [crate::objects::syslog::OBJECT_ID.to_string(), "0".to_string(), crate::objects::syslog::RES_READ_ALL.to_string()];
    site.add_resource(
        &syslog_read_all_path.each_ref().map(String::as_str),
        fixed.syslog_read_all,
    );
    let syslog_read_path = [crate::objects::syslog::OBJECT_ID.to_string(), "0".to_string(), crate::objects::syslog::RES_READ.to_string()];
    site.add_resource(
        &syslog_read_path.each_ref().map(String::as_str),
        fixed.syslog_read_incremental,
    );

    let guard = tree.lock().await;
    let object_ids: Vec<_> = guard.object_ids().collect();
    for object_id in object_ids {
        let base = guard.object(object_id).expect("object_id came from object_ids()");

        site.add_resource(
            &[&object_id.to_string()],
            Arc::new(TreeNode {
                tree: Arc::clone(&tree),
                notifier: Arc::clone(&notifier),
                registry: Arc::clone(&registry),
                path: Path::Object(object_id),
            }),
        );

        let instance_ids: Vec<_> = base.instance_ids().collect();
        for instance_id in instance_ids {
            site.add_resource(
                &[&object_id.to_string(), &instance_id.to_string()],
                Arc::new(TreeNode {
                    tree: Arc::clone(&tree),
                    notifier: Arc::clone(&notifier),
                    registry: Arc::clone(&registry),
                    path: Path::Instance(object_id, instance_id),
                }),
            );

            let inst = base.get(instance_id).expect("instance_id came from instance_ids()");
            let resource_ids: Vec<ResourceId> = inst.resource_ids().collect();
            for resource_id in resource_ids {
                site.add_resource(
                    &[&object_id.to_string(), &instance_id.to_string(), &resource_id.to_string()],
                    Arc::new(TreeNode {
                        tree: Arc::clone(&tree),
                        notifier: Arc::clone(&notifier),
                        registry: Arc::clone(&registry),
                        path: Path::Resource(object_id, instance_id, resource_id),
                    }),
                );
            }
        }
    }
    drop(guard);

    site
}

/// Holds the live `Site` behind a lock so `main`'s rebuild task can
/// swap it out from under the request-dispatch loop without a gap.
pub struct SiteHandle {
    site: AsyncMutex<lwm2m_coap::Site>,
}

impl SiteHandle {
    pub fn new(site: lwm2m_coap::Site) -> SiteHandle {
        SiteHandle {
            site: AsyncMutex::new(site),
        }
    }

    pub async fn dispatch(&self, message: lwm2m_coap::Message, peer: SocketAddr) -> lwm2m_coap::Message {
        self.site.lock().await.dispatch(message, peer).await
    }

    pub async fn replace(&self, new_site: lwm2m_coap::Site) {
        *self.site.lock().await = new_site;
    }
}

/// Rebuilds and swaps in a new site every time the tree's topology
/// changes (Object 12 profile create/delete). Runs for the lifetime of
/// one bearer-supervisor attempt, cancelled like the other per-attempt
/// tasks when the client restarts.
pub async fn rebuild_on_topology_change(
    tree: Arc<AsyncMutex<Tree>>,
    notifier: Arc<Notifier>,
    registry: Arc<lwm2m_coap::ObserveRegistry>,
    fixed: FixedResources,
    handle: Arc<SiteHandle>,
) {
    let topology_changed = tree.lock().await.topology_changed.clone();
    loop {
        topology_changed.notified().await;
        let site = build_site(Arc::clone(&tree), Arc::clone(&notifier), Arc::clone(&registry), fixed.clone()).await;
        handle.replace(site).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::base_object::BaseObject;
    use crate::tree::instance::ObjectInstance;
    use crate::tree::resource::{Resource, SingleResource};
    use lwm2m_coap::{Code, Endpoint, Message, MessageType, ObserveRegistry};
    use lwm2m_core::{tlv, Value};
    use std::collections::BTreeMap;

    async fn device_tree() -> Arc<AsyncMutex<Tree>> {
        let mut tree = Tree::new();
        let mut inst = ObjectInstance::new();
        inst.insert(0, Resource::Single(SingleResource::new(Value::String("Laird Connectivity, Inc.".into()))));
        let mut instances = BTreeMap::new();
        instances.insert(0, inst);
        tree.insert_object(3, BaseObject::static_object(instances));
        Arc::new(AsyncMutex::new(tree))
    }

    fn noop_fixed() -> FixedResources {
        struct NotFound;
        #[async_trait]
        impl lwm2m_coap::Resource for NotFound {}
        FixedResources {
            bootstrap_finish: None,
            firmware_package: Arc::new(NotFound),
            software_package: Arc::new(NotFound),
            syslog_read_all: Arc::new(NotFound),
            syslog_read_incremental: Arc::new(NotFound),
        }
    }

    #[tokio::test]
    async fn get_on_a_resource_path_returns_its_tlv_encoding() {
        let tree = device_tree().await;
        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let registry = Arc::new(ObserveRegistry::new());
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry), endpoint));
        let site = build_site(Arc::clone(&tree), notifier, registry, noop_fixed()).await;

        let mut req = Message::new(MessageType::Confirmable, Code::GET, 1);
        req.options.push_uri_path("3/0/0");
        let response = site.dispatch(req, "127.0.0.1:9999".parse().unwrap()).await;
        assert_eq!(response.code, Code::CONTENT);
        let (_, id, value_bytes, _) = tlv::decode_tlv(&response.payload).unwrap();
        assert_eq!(id, 0);
        assert_eq!(
            tlv::decode_value(lwm2m_core::ValueKind::String, value_bytes).unwrap(),
            Value::String("Laird Connectivity, Inc.".into())
        );
    }

    #[tokio::test]
    async fn put_with_wrong_content_format_is_rejected() {
        let tree = device_tree().await;
        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let registry = Arc::new(ObserveRegistry::new());
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry), endpoint));
        let site = build_site(Arc::clone(&tree), notifier, registry, noop_fixed()).await;

        let mut req = Message::new(MessageType::Confirmable, Code::PUT, 2);
        req.options.push_uri_path("3/0/0");
        req.payload = b"not tlv".to_vec();
        let response = site.dispatch(req, "127.0.0.1:9999".parse().unwrap()).await;
        assert_eq!(response.code, Code::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn put_writes_through_and_get_reflects_it() {
        let tree = device_tree().await;
        let endpoint = Endpoint::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let registry = Arc::new(ObserveRegistry::new());
        let notifier = Arc::new(Notifier::new(Arc::clone(&registry), endpoint));
        let site = build_site(Arc::clone(&tree), notifier, registry, noop_fixed()).await;

        let mut put = Message::new(MessageType::Confirmable, Code::PUT, 3);
        put.options.push_uri_path("3/0/0");
        put.options
            .push_uint(lwm2m_coap::OptionNumber::ContentFormat, lwm2m_coap::MediaType::Tlv.code() as u32);
        put.payload = tlv::pack_resource_value(0, &Value::String("Acme".into()));
        let response = site.dispatch(put, "127.0.0.1:9999".parse().unwrap()).await;
        assert_eq!(response.code, Code::CHANGED);

        let mut get = Message::new(MessageType::Confirmable, Code::GET, 4);
        get.options.push_uri_path("3/0/0");
        let response = site.dispatch(get, "127.0.0.1:9999".parse().unwrap()).await;
        let (_, _, value_bytes, _) = tlv::decode_tlv(&response.payload).unwrap();
        assert_eq!(
            tlv::decode_value(lwm2m_core::ValueKind::String, value_bytes).unwrap(),
            Value::String("Acme".into())
        );
    }

    #[tokio::test]
    async fn bootstrap_finish_post_notifies_the_waiter() {
        let finished = Arc::new(tokio::sync::Notify::new());
        let resource = BootstrapFinishResource::new(Arc::clone(&finished));
        let waiter = finished.notified();
        tokio::pin!(waiter);

        let req = lwm2m_coap::Request {
            message: Message::new(MessageType::Confirmable, Code::POST, 1),
            peer: "127.0.0.1:9999".parse().unwrap(),
        };
        let response = lwm2m_coap::Resource::render_post(&resource, &req).await;
        assert_eq!(response.code, Code::CHANGED);
        assert!(futures::FutureExt::now_or_never(waiter).is_some());
    }
}
