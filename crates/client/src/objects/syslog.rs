//! Object 10259 (System Log), grounded on `ig60_syslog.py`/
//! `lwm2m/syslog.py`: a tree-resident name/enabled/capture-level
//! triple plus two CoAP-level Block2 resources (full dump and
//! cursor-incremental dump) that regenerate `SYSLOG_DUMP_PATH` via
//! `journalctl` on the first block of a transfer and delete it once
//! the last block has gone out, mirroring
//! `IG60JournaldLogResource.start_payload`/`end_payload`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lwm2m_coap::{BlockValue, Code, MediaType, Message, MessageType, Options};
use lwm2m_core::Value;

use crate::collaborators::syslog_reader::SyslogReader;
use crate::constants::SYSLOG_DUMP_PATH;
use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::resource::{Resource, SingleResource};

pub const OBJECT_ID: u16 = 10259;

pub const RES_NAME: u16 = 0;
pub const RES_READ_ALL: u16 = 1;
pub const RES_READ: u16 = 2;
pub const RES_ENABLED: u16 = 3;
pub const RES_CAPTURE_LEVEL: u16 = 4;

/// The only reader this client has ever shipped, so there is nothing
/// to name beyond this constant.
pub const READER_NAME: &str = "journald";

/// Builds the tree-resident part of the object: the name constant
/// plus the enabled/capture-level settings. `RES_READ_ALL`/`RES_READ`
/// are deliberately absent here — they are served by
/// [`SyslogBlock2Resource`] registered straight into the CoAP `Site`,
/// since a plain tree resource has no way to stream a blockwise file.
pub fn new_base_object() -> BaseObject {
    let mut inst = ObjectInstance::new();
    inst.insert(
        RES_NAME,
        Resource::Single(SingleResource::new(Value::String(READER_NAME.to_string()))),
    );
    inst.insert(RES_ENABLED, Resource::Single(SingleResource::new(Value::Boolean(true))));
    inst.insert(
        RES_CAPTURE_LEVEL,
        Resource::Single(SingleResource::new(Value::Integer(0))),
    );

    let mut instances = BTreeMap::new();
    instances.insert(0, inst);
    BaseObject::static_object(instances)
}

/// A Block2 GET endpoint over one of the two `journalctl` dumps. The
/// first block of a transfer (re)generates the dump file; the last
/// block removes it, so a stalled client never leaves `/tmp/syslog.txt`
/// behind longer than the transfer that is reading it.
pub struct SyslogBlock2Resource {
    reader: Arc<dyn SyslogReader>,
    incremental: bool,
}

impl SyslogBlock2Resource {
    pub fn new(reader: Arc<dyn SyslogReader>, incremental: bool) -> SyslogBlock2Resource {
        SyslogBlock2Resource { reader, incremental }
    }
}

#[async_trait]
impl lwm2m_coap::Resource for SyslogBlock2Resource {
    async fn render_get(&self, req: &lwm2m_coap::Request) -> Message {
        let block = match req.message.options.block2() {
            Some(Ok(block)) => block,
            Some(Err(_)) => return Message::new(MessageType::Acknowledgement, Code::BAD_OPTION, 0),
            None => BlockValue::new(0, false, crate::block::MAX_BLOCK_SIZE_EXPONENT)
                .expect("MAX_BLOCK_SIZE_EXPONENT is in range"),
        };

        if block.block_number == 0 {
            let dump = if self.incremental {
                self.reader.read_incremental().await
            } else {
                self.reader.read_all().await
            };
            if let Err(e) = dump {
                tracing::warn!(error = %e, incremental = self.incremental, "syslog dump regeneration failed");
                return Message::new(MessageType::Acknowledgement, Code::INTERNAL_SERVER_ERROR, 0);
            }
        }

        match crate::block::read_block2(std::path::Path::new(SYSLOG_DUMP_PATH), block).await {
            Ok((payload, more)) => {
                if !more {
                    let _ = tokio::fs::remove_file(SYSLOG_DUMP_PATH).await;
                }
                let response_block = BlockValue::new(block.block_number, more, block.size_exponent)
                    .expect("block_number/size_exponent are echoed back unchanged");
                let mut options = Options::new();
                options.push_block2(response_block);
                options.push_uint(lwm2m_coap::OptionNumber::ContentFormat, MediaType::TextPlain.code() as u32);
                let mut msg = Message::new(MessageType::Acknowledgement, Code::CONTENT, 0).with_payload(payload);
                msg.options = options;
                msg
            }
            Err(e) => {
                tracing::warn!(error = %e, "syslog dump read failed mid-transfer");
                Message::new(MessageType::Acknowledgement, Code::INTERNAL_SERVER_ERROR, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeReader {
        calls: AtomicUsize,
        incremental_calls: AtomicUsize,
    }

    #[async_trait]
    impl SyslogReader for FakeReader {
        async fn read_all(&self) -> io::Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(SYSLOG_DUMP_PATH, b"hello world").await?;
            Ok(PathBuf::from(SYSLOG_DUMP_PATH))
        }

        async fn read_incremental(&self) -> io::Result<PathBuf> {
            self.incremental_calls.fetch_add(1, Ordering::SeqCst);
            tokio::fs::write(SYSLOG_DUMP_PATH, b"hello world").await?;
            Ok(PathBuf::from(SYSLOG_DUMP_PATH))
        }
    }

    fn get_request(block: BlockValue) -> lwm2m_coap::Request {
        let mut msg = Message::new(MessageType::Confirmable, Code::GET, 1);
        msg.options.push_block2(block);
        lwm2m_coap::Request {
            message: msg,
            peer: "127.0.0.1:5683".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn first_block_regenerates_dump_and_serves_content() {
        let reader = Arc::new(FakeReader {
            calls: AtomicUsize::new(0),
            incremental_calls: AtomicUsize::new(0),
        });
        let resource = SyslogBlock2Resource::new(reader.clone(), false);
        let block = BlockValue::new(0, false, 6).unwrap();
        let response = resource.render_get(&get_request(block)).await;
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"hello world");
        assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
        assert!(tokio::fs::metadata(SYSLOG_DUMP_PATH).await.is_err(), "final block removes the dump file");
    }

    #[tokio::test]
    async fn incremental_resource_uses_the_cursor_based_reader() {
        let reader = Arc::new(FakeReader {
            calls: AtomicUsize::new(0),
            incremental_calls: AtomicUsize::new(0),
        });
        let resource = SyslogBlock2Resource::new(reader.clone(), true);
        let block = BlockValue::new(0, false, 6).unwrap();
        let _ = resource.render_get(&get_request(block)).await;
        assert_eq!(reader.incremental_calls.load(Ordering::SeqCst), 1);
        assert_eq!(reader.calls.load(Ordering::SeqCst), 0);
    }
}
