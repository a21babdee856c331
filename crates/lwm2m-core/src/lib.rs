//! Wire and data model shared by the LwM2M client: identifiers, the
//! `Value` tagged union, and the TLV codec. No I/O lives here.

pub mod path;
pub mod tlv;
pub mod value;

pub use path::{InstanceId, ObjectId, Path, ResourceId, ResourceInstanceId};
pub use tlv::{TlvError, TlvKind};
pub use value::{Value, ValueKind};
