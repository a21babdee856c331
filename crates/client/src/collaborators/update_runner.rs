//! External-helper collaborator backing Objects 5/9: firmware and
//! software update are handed off to standalone scripts as a spawned
//! child process rather than reimplemented in-process.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

#[async_trait]
pub trait UpdateRunner: Send + Sync {
    /// Runs `program` with `args`, waiting for it to exit, and reports
    /// its exit status. What the program does (flash a firmware image,
    /// unpack and apply a software tarball) is out of scope here — it
    /// is called into, not reimplemented.
    async fn exec(&self, program: &str, args: &[&str]) -> std::io::Result<ExitStatus>;
}

pub struct SubprocessRunner;

#[async_trait]
impl UpdateRunner for SubprocessRunner {
    async fn exec(&self, program: &str, args: &[&str]) -> std::io::Result<ExitStatus> {
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?
            .wait()
            .await?;
        Ok(status)
    }
}
