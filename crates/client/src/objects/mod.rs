//! One module per OMA object this client exposes (spec §4.7), each
//! grounded on its `ig60_*.py` counterpart. `security` and `server`
//! back the bootstrappable Object 0/1 pair; the rest are populated
//! once at startup from whatever the platform collaborators report.

pub mod bearer;
pub mod cellular;
pub mod connmon;
pub mod device;
pub mod fwupdate;
pub mod security;
pub mod server;
pub mod swmgmt;
pub mod syslog;
pub mod wlan;
