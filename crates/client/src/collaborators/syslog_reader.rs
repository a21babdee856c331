//! System-log collaborator backing Object 10259, grounded on
//! `ig60_syslog.py`'s two `journalctl` invocations: a full dump and
//! a cursor-file-based incremental dump. The cursor file is never
//! reset by this trait — a rotated/truncated journal is read from
//! whatever position the cursor still names, which means an
//! incremental read after rotation can silently miss entries rather
//! than replaying them; callers that need gap-free delivery must pair
//! this with their own `SyslogResource::resource_changed`-edge
//! bookkeeping exactly as the original relies on `journalctl` itself
//! to just keep working.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::constants::{SYSLOG_CURSOR_PATH, SYSLOG_DUMP_PATH};

#[async_trait]
pub trait SyslogReader: Send + Sync {
    /// Dumps the entire journal to a file and returns its path.
    async fn read_all(&self) -> io::Result<PathBuf>;

    /// Dumps only entries since the last incremental read (by cursor
    /// file) and returns the dump's path.
    async fn read_incremental(&self) -> io::Result<PathBuf>;
}

pub struct JournaldReader;

impl JournaldReader {
    async fn dump(args: &[&str]) -> io::Result<PathBuf> {
        let mut child = Command::new("journalctl")
            .args(args)
            .stdout(Stdio::piped())
            .spawn()?;
        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut file = tokio::fs::File::create(SYSLOG_DUMP_PATH).await?;
        tokio::io::copy(&mut stdout, &mut file).await?;
        file.flush().await?;
        child.wait().await?;
        Ok(PathBuf::from(SYSLOG_DUMP_PATH))
    }
}

#[async_trait]
impl SyslogReader for JournaldReader {
    async fn read_all(&self) -> io::Result<PathBuf> {
        Self::dump(&[]).await
    }

    async fn read_incremental(&self) -> io::Result<PathBuf> {
        let cursor_arg = format!("--cursor-file={SYSLOG_CURSOR_PATH}");
        Self::dump(&[cursor_arg.as_str()]).await
    }
}
