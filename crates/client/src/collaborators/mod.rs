//! Collaborator contracts: the seams the core calls into rather than
//! the platform code the core stops at. Every trait
//! here is a bundle of synchronous accessors plus, where the source
//! hands back a future (`ig60_*.py`'s own `async def`s), `async fn`s
//! mirroring that.

pub mod device_info;
pub mod network;
pub mod syslog_reader;
pub mod update_runner;
pub mod wifi;

pub use device_info::{DeviceInfo, MemoryInfo};
pub use network::{CellularInfo, Connection, NetworkInfo};
pub use syslog_reader::SyslogReader;
pub use update_runner::UpdateRunner;
pub use wifi::{WifiProfile, WifiProfileStore};
