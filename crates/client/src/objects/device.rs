//! Object 3 (Device), grounded on `ig60_device.py`: manufacturer/model
//! constants, a firmware-version read callback, memory read callbacks
//! over `DeviceInfo::memory()`, a reboot executable, a 1 Hz current-time
//! tick task, and a UTC-offset resource seeded from `TZ`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lwm2m_core::Value;

use crate::collaborators::DeviceInfo;
use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::observe::Notifier;
use crate::tree::resource::{ExecutableResource, MultiResource, Resource, SingleResource};
use crate::tree::Tree;

pub const OBJECT_ID: u16 = 3;

pub const RES_MANUFACTURER: u16 = 0;
pub const RES_MODEL_NUMBER: u16 = 1;
pub const RES_FIRMWARE_VERSION: u16 = 3;
pub const RES_REBOOT: u16 = 4;
pub const RES_AVAILABLE_POWER_SOURCES: u16 = 6;
pub const RES_MEMORY_FREE: u16 = 10;
pub const RES_CURRENT_TIME: u16 = 13;
pub const RES_UTC_OFFSET: u16 = 14;
pub const RES_BINDING_MODES: u16 = 16;
pub const RES_MEMORY_TOTAL: u16 = 21;

pub const MANUFACTURER: &str = "Laird Connectivity, Inc.";
pub const MODEL_NUMBER: &str = "IG60";

/// OMA Available Power Sources enum: this gateway is always mains-fed.
pub const POWER_SOURCE_DC: i64 = 0;

fn read_firmware_version() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|contents| {
            contents.lines().find_map(|line| {
                line.strip_prefix("VERSION_ID=")
                    .map(|v| v.trim_matches('"').to_string())
            })
        })
        .unwrap_or_else(|| "unknown".to_string())
}

fn default_utc_offset() -> String {
    match std::env::var("TZ") {
        Ok(tz) if !tz.is_empty() => tz,
        _ => "UTC+00:00".to_string(),
    }
}

pub fn new_base_object(device_info: Arc<dyn DeviceInfo>) -> BaseObject {
    let mut inst = ObjectInstance::new();
    inst.insert(
        RES_MANUFACTURER,
        Resource::Single(SingleResource::new(Value::String(MANUFACTURER.to_string()))),
    );
    inst.insert(
        RES_MODEL_NUMBER,
        Resource::Single(SingleResource::new(Value::String(MODEL_NUMBER.to_string()))),
    );
    inst.insert(
        RES_FIRMWARE_VERSION,
        Resource::Single(
            SingleResource::new(Value::String(read_firmware_version())).with_read_hook(Box::new(|| {
                Value::String(read_firmware_version())
            })),
        ),
    );
    inst.insert(
        RES_REBOOT,
        Resource::Executable(ExecutableResource::new(Box::new(|| {
            tracing::info!("Device/Reboot executed; platform-level reboot action is out of scope here");
        }))),
    );
    {
        let device_info = Arc::clone(&device_info);
        inst.insert(
            RES_MEMORY_FREE,
            Resource::Single(
                SingleResource::new(Value::Integer(0)).with_read_hook(Box::new(move || {
                    Value::Integer(device_info.memory().free_kb as i64)
                })),
            ),
        );
    }
    {
        let device_info = Arc::clone(&device_info);
        inst.insert(
            RES_MEMORY_TOTAL,
            Resource::Single(
                SingleResource::new(Value::Integer(0)).with_read_hook(Box::new(move || {
                    Value::Integer(device_info.memory().total_kb as i64)
                })),
            ),
        );
    }
    {
        let device_info = Arc::clone(&device_info);
        inst.insert(
            RES_CURRENT_TIME,
            Resource::Single(SingleResource::new(device_info.now()).with_read_hook(Box::new(move || device_info.now()))),
        );
    }
    inst.insert(
        RES_UTC_OFFSET,
        Resource::Single(SingleResource::new(Value::String(default_utc_offset()))),
    );
    {
        let mut power_sources = BTreeMap::new();
        power_sources.insert(0, Value::Integer(POWER_SOURCE_DC));
        inst.insert(
            RES_AVAILABLE_POWER_SOURCES,
            Resource::Multi(MultiResource::from_instances(lwm2m_core::ValueKind::Integer, power_sources)),
        );
    }
    inst.insert(
        RES_BINDING_MODES,
        Resource::Single(SingleResource::new(Value::String("U".to_string()))),
    );

    let mut instances = BTreeMap::new();
    instances.insert(0, inst);
    BaseObject::static_object(instances)
}

/// Re-reads the current time every second and notifies observers on
/// any change. Runs for the life of the process rather than per bearer
/// attempt, since the clock itself doesn't depend on which interface
/// is currently active.
pub async fn time_tick_task(tree: Arc<tokio::sync::Mutex<Tree>>, notifier: Arc<Notifier>, device_info: Arc<dyn DeviceInfo>) {
    let mut last = None;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let now = device_info.now();
        if Some(&now) != last.as_ref() {
            let mut tree_guard = tree.lock().await;
            if let Some(base) = tree_guard.object_mut(OBJECT_ID) {
                if let Some(inst) = base.get_mut(0) {
                    if let Some(resource) = inst.get_mut(RES_CURRENT_TIME) {
                        let _ = resource.write_single(now.clone());
                    }
                }
            }
            notifier.notify_resource_changed(&tree_guard, OBJECT_ID, 0, RES_CURRENT_TIME).await;
            drop(tree_guard);
            last = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lwm2m_core::tlv;

    struct FixedClock;
    impl DeviceInfo for FixedClock {
        fn now(&self) -> Value {
            Value::Timestamp(1_700_000_000)
        }
        fn memory(&self) -> crate::collaborators::device_info::MemoryInfo {
            crate::collaborators::device_info::MemoryInfo {
                free_kb: 1024,
                total_kb: 4096,
            }
        }
    }

    #[test]
    fn get_object_instance_exposes_manufacturer_first() {
        let base = new_base_object(Arc::new(FixedClock));
        let inst = base.get(0).unwrap();
        let encoded = inst.encode();
        let (_, id, value_bytes, _) = tlv::decode_tlv(&encoded).unwrap();
        assert_eq!(id, RES_MANUFACTURER);
        assert_eq!(
            tlv::decode_value(lwm2m_core::ValueKind::String, value_bytes).unwrap(),
            Value::String(MANUFACTURER.to_string())
        );
    }

    #[test]
    fn utc_offset_is_writable_and_reads_back() {
        let mut base = new_base_object(Arc::new(FixedClock));
        let inst = base.get_mut(0).unwrap();
        inst.get_mut(RES_UTC_OFFSET)
            .unwrap()
            .write_single(Value::String("UTC+05:00".to_string()))
            .unwrap();
        assert_eq!(
            inst.get(RES_UTC_OFFSET).unwrap().read_single().unwrap(),
            Value::String("UTC+05:00".to_string())
        );
    }

    #[test]
    fn memory_resources_reflect_device_info() {
        let base = new_base_object(Arc::new(FixedClock));
        let inst = base.get(0).unwrap();
        assert_eq!(
            inst.get(RES_MEMORY_FREE).unwrap().read_single().unwrap(),
            Value::Integer(1024)
        );
        assert_eq!(
            inst.get(RES_MEMORY_TOTAL).unwrap().read_single().unwrap(),
            Value::Integer(4096)
        );
    }
}
