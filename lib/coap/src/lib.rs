//! A small RFC 7252 CoAP implementation scoped to what the LwM2M
//! client needs: message framing, Block1/Block2 (RFC 7959), Observe
//! (RFC 7641), and a DTLS seam rather than a DTLS implementation.
//! No CoAP crate from crates.io is pulled in; the wire format is
//! hand-rolled the same way pcap-ng framing is hand-rolled elsewhere
//! in this codebase's lineage, rather than adopted from a framework.

pub mod client;
pub mod dtls;
pub mod message;
pub mod options;
pub mod server;
pub mod transport;

pub use message::{Code, Message, MessageError, MessageType};
pub use options::{BlockError, BlockValue, MediaType, OptionNumber, Options};
pub use server::{ObserveRegistry, Request, Resource, Site};
pub use transport::{Endpoint, RetransmitConfig, TransportError};
