//! Device-info collaborator: `now()` and `memory()`, grounded on
//! `ig60_device.py`'s direct `/proc/meminfo` reads.

use std::fs;

use lwm2m_core::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free_kb: u64,
    pub total_kb: u64,
}

pub trait DeviceInfo: Send + Sync {
    /// Current time as LwM2M epoch-seconds.
    fn now(&self) -> Value;

    fn memory(&self) -> MemoryInfo;
}

/// Reads the host's real clock and `/proc/meminfo`.
pub struct HostDeviceInfo;

impl HostDeviceInfo {
    /// `/proc/meminfo` reports KiB; the LwM2M spec's resources are in
    /// decimal kB (1000 bytes), so every reading is rescaled — the
    /// comment in the original source flags this oddity, we just do it.
    fn read_meminfo_kib(field: &str) -> Option<u64> {
        let contents = fs::read_to_string("/proc/meminfo").ok()?;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix(field) {
                let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
                return digits.parse().ok();
            }
        }
        None
    }

    fn kib_to_kb(kib: u64) -> u64 {
        (kib * 1024) / 1000
    }
}

impl DeviceInfo for HostDeviceInfo {
    fn now(&self) -> Value {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Value::Timestamp(secs)
    }

    fn memory(&self) -> MemoryInfo {
        let free_kib = Self::read_meminfo_kib("MemFree:").unwrap_or(0);
        let total_kib = Self::read_meminfo_kib("MemTotal:").unwrap_or(0);
        MemoryInfo {
            free_kb: Self::kib_to_kb(free_kib),
            total_kb: Self::kib_to_kb(total_kib),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kib_to_kb_matches_the_lwm2m_kilobyte_definition() {
        assert_eq!(HostDeviceInfo::kib_to_kb(1000), 1024);
    }
}
