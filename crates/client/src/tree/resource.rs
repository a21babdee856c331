//! A single tree node below an `ObjectInstance`: `Single`,
//! `MultiResource`, or `Executable`, each with its own read/write/execute
//! behavior.
//!
//! Hooks never receive the tree; they close over whatever collaborator
//! handle they need. The tree itself is owned by the single task that
//! drives the CoAP server loop, so a hook can't reach back into it
//! without risking a deadlock against that task's own lock.

use std::collections::BTreeMap;

use lwm2m_core::{ResourceInstanceId, Value, ValueKind};

use crate::error::CoreError;

pub type ReadHook = Box<dyn Fn() -> Value + Send + Sync>;
pub type WriteHook = Box<dyn Fn(&Value) -> Result<(), CoreError> + Send + Sync>;
pub type ExecuteHook = Box<dyn Fn() + Send + Sync>;

pub struct SingleResource {
    kind: ValueKind,
    value: Value,
    read_hook: Option<ReadHook>,
    write_hook: Option<WriteHook>,
}

impl SingleResource {
    pub fn new(value: Value) -> SingleResource {
        SingleResource {
            kind: value.kind(),
            value,
            read_hook: None,
            write_hook: None,
        }
    }

    pub fn with_read_hook(mut self, hook: ReadHook) -> SingleResource {
        self.read_hook = Some(hook);
        self
    }

    pub fn with_write_hook(mut self, hook: WriteHook) -> SingleResource {
        self.write_hook = Some(hook);
        self
    }

    pub fn read(&self) -> Value {
        match &self.read_hook {
            Some(hook) => hook(),
            None => self.value.clone(),
        }
    }

    pub fn write(&mut self, value: Value) -> Result<(), CoreError> {
        if value.kind() != self.kind {
            return Err(CoreError::VariantMismatch {
                expected: self.kind,
                got: value.kind(),
            });
        }
        if let Some(hook) = &self.write_hook {
            hook(&value)?;
        }
        self.value = value;
        Ok(())
    }

    pub fn is_writable(&self) -> bool {
        true
    }
}

pub type MultiWriteHook = Box<dyn Fn(&[(ResourceInstanceId, Value)]) + Send + Sync>;

pub struct MultiResource {
    kind: ValueKind,
    instances: BTreeMap<ResourceInstanceId, Value>,
    write_hook: Option<MultiWriteHook>,
}

impl MultiResource {
    pub fn new(kind: ValueKind) -> MultiResource {
        MultiResource {
            kind,
            instances: BTreeMap::new(),
            write_hook: None,
        }
    }

    pub fn from_instances(kind: ValueKind, instances: BTreeMap<ResourceInstanceId, Value>) -> MultiResource {
        MultiResource {
            kind,
            instances,
            write_hook: None,
        }
    }

    /// Fires after a successful `write_all`, the multi-resource
    /// counterpart to `SingleResource::with_write_hook` — used where a
    /// write needs to signal something beyond storing the value (e.g.
    /// the bearer-preference resource stopping the running client).
    pub fn with_write_hook(mut self, hook: MultiWriteHook) -> MultiResource {
        self.write_hook = Some(hook);
        self
    }

    pub fn read(&self) -> Vec<(ResourceInstanceId, Value)> {
        self.instances.iter().map(|(id, v)| (*id, v.clone())).collect()
    }

    pub fn set(&mut self, id: ResourceInstanceId, value: Value) {
        self.instances.insert(id, value);
    }

    pub fn get(&self, id: ResourceInstanceId) -> Option<&Value> {
        self.instances.get(&id)
    }

    /// Replace every instance in `items` in one pass. Caller must
    /// already have validated every item's variant before calling this
    /// — validation happens before any mutation, so a bad item never
    /// leaves the map half-written.
    pub fn write_all(&mut self, items: Vec<(ResourceInstanceId, Value)>) -> Result<(), CoreError> {
        for (_id, value) in &items {
            if value.kind() != self.kind {
                return Err(CoreError::VariantMismatch {
                    expected: self.kind,
                    got: value.kind(),
                });
            }
        }
        for (id, value) in &items {
            self.instances.insert(*id, value.clone());
        }
        if let Some(hook) = &self.write_hook {
            hook(&items);
        }
        Ok(())
    }
}

pub struct ExecutableResource {
    hook: ExecuteHook,
}

impl ExecutableResource {
    pub fn new(hook: ExecuteHook) -> ExecutableResource {
        ExecutableResource { hook }
    }

    pub fn execute(&self) {
        (self.hook)()
    }
}

pub enum Resource {
    Single(SingleResource),
    Multi(MultiResource),
    Executable(ExecutableResource),
}

impl Resource {
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Resource::Single(r) => Some(r.kind),
            Resource::Multi(r) => Some(r.kind),
            Resource::Executable(_) => None,
        }
    }

    pub fn read_single(&self) -> Result<Value, CoreError> {
        match self {
            Resource::Single(r) => Ok(r.read()),
            _ => Err(CoreError::MethodNotAllowed),
        }
    }

    pub fn read_multi(&self) -> Result<Vec<(ResourceInstanceId, Value)>, CoreError> {
        match self {
            Resource::Multi(r) => Ok(r.read()),
            _ => Err(CoreError::MethodNotAllowed),
        }
    }

    pub fn write_single(&mut self, value: Value) -> Result<(), CoreError> {
        match self {
            Resource::Single(r) => r.write(value),
            Resource::Multi(_) | Resource::Executable(_) => Err(CoreError::ValidationFailed(
                "RESOURCE_VALUE write targets a non-single resource".into(),
            )),
        }
    }

    pub fn write_multi(&mut self, items: Vec<(ResourceInstanceId, Value)>) -> Result<(), CoreError> {
        match self {
            Resource::Multi(r) => r.write_all(items),
            Resource::Single(_) | Resource::Executable(_) => Err(CoreError::ValidationFailed(
                "MULTIPLE_RESOURCE write targets a non-multi resource".into(),
            )),
        }
    }

    pub fn execute(&self) -> Result<(), CoreError> {
        match self {
            Resource::Executable(r) => {
                r.execute();
                Ok(())
            }
            Resource::Single(_) | Resource::Multi(_) => Err(CoreError::MethodNotAllowed),
        }
    }

    /// Encode this node's current value(s) to its TLV wire form, as
    /// addressed either directly (`/O/I/R`) or folded into the parent
    /// instance's packed payload.
    pub fn encode(&self, id: lwm2m_core::ResourceId) -> Vec<u8> {
        match self {
            Resource::Single(r) => lwm2m_core::tlv::pack_resource_value(id, &r.value),
            Resource::Multi(r) => lwm2m_core::tlv::pack_multi_resource(id, &r.read()),
            Resource::Executable(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_write_rejects_variant_mismatch() {
        let mut r = SingleResource::new(Value::Integer(1));
        assert!(matches!(
            r.write(Value::String("oops".into())),
            Err(CoreError::VariantMismatch { .. })
        ));
        assert_eq!(r.read(), Value::Integer(1));
    }

    #[test]
    fn single_write_hook_can_reject() {
        let mut r = SingleResource::new(Value::Integer(1))
            .with_write_hook(Box::new(|_| Err(CoreError::ValidationFailed("no".into()))));
        assert!(r.write(Value::Integer(2)).is_err());
        assert_eq!(r.read(), Value::Integer(1));
    }

    #[test]
    fn multi_write_all_or_nothing() {
        let mut m = MultiResource::new(ValueKind::Integer);
        m.set(0, Value::Integer(1));
        let items = vec![(1u16, Value::Integer(2)), (2u16, Value::String("bad".into()))];
        assert!(m.write_all(items).is_err());
        assert_eq!(m.read(), vec![(0, Value::Integer(1))]);
    }

    #[test]
    fn executable_runs_hook() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let r = Resource::Executable(ExecutableResource::new(Box::new(move || {
            flag2.store(true, Ordering::SeqCst);
        })));
        r.execute().unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
