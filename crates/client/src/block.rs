//! Blockwise transfer engine (RFC 7959), grounded on
//! `lwm2m.block.LwM2MBlockwiseResource`/`LwM2MBlockwiseFileResource`
//! (Block1 uploads into Objects 5/9) and `lwm2m.block.CoAPDownloadClient`
//! (Block2 downloads of a firmware/software package).

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lwm2m_coap::{BlockValue, Code, Endpoint, MediaType, Message, MessageType, Options};
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::error::{CoreError, DownloadError};

pub const MAX_BLOCK_SIZE_EXPONENT: u8 = 6;

/// Where a Block1 upload's decoded payload goes as each block arrives.
#[async_trait::async_trait]
pub trait BlockSink: Send {
    async fn start(&mut self) -> io::Result<()>;
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
    async fn finish(&mut self) -> io::Result<()>;
}

/// Writes an incoming Block1 upload straight to a file, truncating any
/// partial upload left over from an aborted sequence the way
/// `start_payload` reopens the file in `'wb'` mode.
pub struct FileSink {
    path: PathBuf,
    file: Option<BufWriter<tokio::fs::File>>,
    pub total_bytes: usize,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> FileSink {
        FileSink {
            path: path.into(),
            file: None,
            total_bytes: 0,
        }
    }
}

#[async_trait::async_trait]
impl BlockSink for FileSink {
    async fn start(&mut self) -> io::Result<()> {
        let file = tokio::fs::File::create(&self.path).await?;
        self.file = Some(BufWriter::new(file));
        self.total_bytes = 0;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(bytes).await?;
            self.total_bytes += bytes.len();
        }
        Ok(())
    }

    async fn finish(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Tracks one Block1 upload's sequence state across a series of
/// CoAP requests to the same resource, mirroring
/// `LwM2MBlockwiseResource.last_block_number`.
pub struct Block1Assembler {
    last_block_number: Option<u32>,
    response_size_exponent: u8,
}

impl Block1Assembler {
    pub fn new() -> Block1Assembler {
        Block1Assembler {
            last_block_number: None,
            response_size_exponent: MAX_BLOCK_SIZE_EXPONENT,
        }
    }

    /// Feeds one request's payload through, writing accepted bytes to
    /// `sink`. Returns the CoAP code and the Block1 option (if any) the
    /// response must carry.
    pub async fn accept(
        &mut self,
        sink: &mut dyn BlockSink,
        content_format: Option<u16>,
        block1: Option<BlockValue>,
        payload: &[u8],
    ) -> Result<(Code, Option<BlockValue>), CoreError> {
        if content_format != Some(MediaType::Opaque.code()) && content_format != Some(MediaType::Tlv.code()) {
            return Err(CoreError::WrongContentFormat(content_format));
        }

        let Some(block) = block1 else {
            // Entire payload arrived in a single request.
            sink.start().await.map_err(|e| CoreError::ValidationFailed(e.to_string()))?;
            sink.write(payload).await.map_err(|e| CoreError::ValidationFailed(e.to_string()))?;
            sink.finish().await.map_err(|e| CoreError::ValidationFailed(e.to_string()))?;
            self.last_block_number = None;
            return Ok((Code::CHANGED, None));
        };

        if block.block_number == 0 {
            sink.start().await.map_err(|e| CoreError::ValidationFailed(e.to_string()))?;
        } else if Some(block.block_number) != self.last_block_number.map(|n| n + 1) {
            return Err(CoreError::BlockOutOfSequence);
        }
        self.last_block_number = Some(block.block_number);

        if block.more {
            if payload.len() != block.size() {
                return Err(CoreError::ValidationFailed("block payload length does not match its size exponent".into()));
            }
            sink.write(payload).await.map_err(|e| CoreError::ValidationFailed(e.to_string()))?;
            let response_block = BlockValue::new(block.block_number, true, self.response_size_exponent)
                .expect("response_size_exponent is bounded by MAX_BLOCK_SIZE_EXPONENT");
            Ok((Code::CONTINUE, Some(response_block)))
        } else {
            sink.write(payload).await.map_err(|e| CoreError::ValidationFailed(e.to_string()))?;
            sink.finish().await.map_err(|e| CoreError::ValidationFailed(e.to_string()))?;
            self.last_block_number = None;
            Ok((Code::CHANGED, None))
        }
    }
}

impl Default for Block1Assembler {
    fn default() -> Block1Assembler {
        Block1Assembler::new()
    }
}

/// Block2 response source for GET on a file-backed resource (the
/// syslog dump, Object 10259): slices the file into blocks on demand
/// so the whole dump need never be held in memory at once.
pub async fn read_block2(path: &Path, block: BlockValue) -> io::Result<(Vec<u8>, bool)> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    let size = block.size();
    let offset = block.block_number as u64 * size as u64;
    file.seek(io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; size];
    let mut read = 0;
    while read < size {
        let n = file.read(&mut buf[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }
    buf.truncate(read);
    let more = read == size;
    Ok((buf, more))
}

/// Streams a Block2 GET from a remote server into a local file, the
/// generalized form of `CoAPDownloadClient.download`: used for firmware
/// (Object 5) and software (Object 9) package retrieval.
pub struct BlockDownloader {
    endpoint: Arc<Endpoint>,
}

impl BlockDownloader {
    pub fn new(endpoint: Arc<Endpoint>) -> BlockDownloader {
        BlockDownloader { endpoint }
    }

    pub async fn download(
        &self,
        peer: SocketAddr,
        uri_path: &str,
        dest: &Path,
        request_size_exponent: u8,
    ) -> Result<u64, DownloadError> {
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|_| DownloadError::ConnLost)?;
        let mut block_number = 0u32;
        let mut total: u64 = 0;
        let mut more = true;

        while more {
            let mut options = Options::new();
            options.push_uri_path(uri_path);
            options.push_block2(
                BlockValue::new(block_number, true, request_size_exponent).map_err(|_| DownloadError::Unsupported)?,
            );
            let request = Message::new(MessageType::Confirmable, Code::GET, self.endpoint.next_message_id())
                .with_token(self.endpoint.next_token());
            let mut request = request;
            request.options = options;

            let response = self
                .endpoint
                .request(request, peer)
                .await
                .map_err(|_| DownloadError::ConnLost)?;

            if !response.code.is_successful() {
                return Err(DownloadError::ConnLost);
            }

            match response.options.block2() {
                Some(Ok(block)) => more = block.more,
                Some(Err(_)) => return Err(DownloadError::Unsupported),
                None => more = false,
            }

            if !response.payload.is_empty() {
                file.write_all(&response.payload)
                    .await
                    .map_err(|_| DownloadError::ConnLost)?;
                total += response.payload.len() as u64;
            }
            block_number += 1;
        }
        file.flush().await.map_err(|_| DownloadError::ConnLost)?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecSink {
        buf: Vec<u8>,
        started: bool,
        finished: bool,
    }

    impl VecSink {
        fn new() -> VecSink {
            VecSink { buf: Vec::new(), started: false, finished: false }
        }
    }

    #[async_trait::async_trait]
    impl BlockSink for VecSink {
        async fn start(&mut self) -> io::Result<()> {
            self.buf.clear();
            self.started = true;
            Ok(())
        }
        async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
            self.buf.extend_from_slice(bytes);
            Ok(())
        }
        async fn finish(&mut self) -> io::Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn single_request_upload_with_no_block1_option() {
        let mut sink = VecSink::new();
        let mut assembler = Block1Assembler::new();
        let (code, block) = assembler
            .accept(&mut sink, Some(MediaType::Opaque.code()), None, b"hello")
            .await
            .unwrap();
        assert_eq!(code, Code::CHANGED);
        assert!(block.is_none());
        assert_eq!(sink.buf, b"hello");
        assert!(sink.started && sink.finished);
    }

    #[tokio::test]
    async fn sequenced_upload_continues_then_completes() {
        let mut sink = VecSink::new();
        let mut assembler = Block1Assembler::new();

        let block0 = BlockValue::new(0, true, 0).unwrap(); // size 16
        let payload0 = vec![0xAAu8; 16];
        let (code, resp_block) = assembler
            .accept(&mut sink, Some(MediaType::Opaque.code()), Some(block0), &payload0)
            .await
            .unwrap();
        assert_eq!(code, Code::CONTINUE);
        assert!(resp_block.unwrap().more);

        let block1 = BlockValue::new(1, false, 0).unwrap();
        let payload1 = vec![0xBBu8; 4];
        let (code, resp_block) = assembler
            .accept(&mut sink, Some(MediaType::Opaque.code()), Some(block1), &payload1)
            .await
            .unwrap();
        assert_eq!(code, Code::CHANGED);
        assert!(resp_block.is_none());
        assert_eq!(sink.buf.len(), 20);
    }

    #[tokio::test]
    async fn out_of_sequence_block_is_rejected() {
        let mut sink = VecSink::new();
        let mut assembler = Block1Assembler::new();

        let block0 = BlockValue::new(0, true, 0).unwrap();
        assembler
            .accept(&mut sink, Some(MediaType::Opaque.code()), Some(block0), &vec![0u8; 16])
            .await
            .unwrap();

        let block2 = BlockValue::new(2, false, 0).unwrap();
        let err = assembler
            .accept(&mut sink, Some(MediaType::Opaque.code()), Some(block2), &vec![0u8; 4])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::BlockOutOfSequence));
    }

    #[tokio::test]
    async fn wrong_content_format_is_rejected() {
        let mut sink = VecSink::new();
        let mut assembler = Block1Assembler::new();
        let err = assembler
            .accept(&mut sink, Some(MediaType::TextPlain.code()), None, b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::WrongContentFormat(_)));
    }
}
