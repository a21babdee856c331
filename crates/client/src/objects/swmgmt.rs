//! Object 9 (Software Management), grounded on `ig60_swmgmt.py`: state
//! machine `INITIAL -> DOWNLOAD_STARTED -> DOWNLOADED -> DELIVERED ->
//! INSTALLED`, the same URI/Block1 download entry `fwupdate` uses, an
//! unpack-and-checksum-verify step that runs automatically once the
//! download completes, install/activate executables, and an activate
//! signal the bearer supervisor watches for a binary swap.

use std::collections::BTreeMap;
use std::sync::Arc;

use lwm2m_core::Value;
use tokio::sync::mpsc;

use crate::block::BlockDownloader;
use crate::collaborators::UpdateRunner;
use crate::constants::{SOFTWARE_UPDATE_ARCHIVE_PATH, SOFTWARE_UPDATE_WORKDIR};
use crate::error::DownloadError;
use crate::tree::base_object::BaseObject;
use crate::tree::instance::ObjectInstance;
use crate::tree::observe::Notifier;
use crate::tree::resource::{ExecutableResource, Resource, SingleResource};
use crate::tree::Tree;

pub const OBJECT_ID: u16 = 9;

pub const RES_PKG_NAME: u16 = 0;
pub const RES_PKG_VERSION: u16 = 1;
/// Block1 upload target (`/9/0/2`), wired in `coap_site` rather than
/// modeled as a tree resource — see `objects::fwupdate::RES_PACKAGE`.
pub const RES_PACKAGE: u16 = 2;
pub const RES_PACKAGE_URI: u16 = 3;
pub const RES_INSTALL: u16 = 4;
pub const RES_UNINSTALL: u16 = 6;
pub const RES_UPDATE_STATE: u16 = 7;
pub const RES_UPDATE_RESULT: u16 = 9;
pub const RES_ACTIVATE: u16 = 10;
pub const RES_DEACTIVATE: u16 = 11;
pub const RES_ACTIVATION_STATE: u16 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum State {
    Initial = 1,
    DownloadStarted = 2,
    Downloaded = 3,
    Delivered = 4,
    Installed = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum UpdateResult {
    Initial = 0,
    DownloadSuccess = 1,
    UnsupportedPackage = 2,
    InvalidUri = 3,
    ConnectionLost = 4,
    IntegrityCheckFailed = 5,
    InstallSuccess = 6,
    InstallFailure = 7,
}

impl From<DownloadError> for UpdateResult {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::InvalidUri => UpdateResult::InvalidUri,
            DownloadError::ConnLost => UpdateResult::ConnectionLost,
            DownloadError::IntegrityFailed => UpdateResult::IntegrityCheckFailed,
            DownloadError::Unsupported => UpdateResult::UnsupportedPackage,
        }
    }
}

pub enum Command {
    DownloadFromUri(String),
    ResetToInitial,
    PackageUploadComplete,
    Install,
    Uninstall,
    Activate,
    Deactivate,
}

pub fn parse_uri_write(value: &Value) -> Result<Command, UpdateResult> {
    let Some(s) = value.as_str() else {
        return Err(UpdateResult::InvalidUri);
    };
    if s.as_bytes() == [0u8] {
        return Ok(Command::ResetToInitial);
    }
    if s.starts_with("coap://") || s.starts_with("coaps://") || s.starts_with("http://") || s.starts_with("https://") {
        Ok(Command::DownloadFromUri(s.to_string()))
    } else {
        Err(UpdateResult::InvalidUri)
    }
}

pub fn make_channel() -> (mpsc::UnboundedSender<Command>, mpsc::UnboundedReceiver<Command>) {
    mpsc::unbounded_channel()
}

pub fn new_base_object(tx: mpsc::UnboundedSender<Command>) -> BaseObject {
    let mut inst = ObjectInstance::new();
    inst.insert(RES_INSTALL, install_hook(tx.clone()));
    inst.insert(RES_UNINSTALL, uninstall_hook(tx.clone()));
    inst.insert(RES_ACTIVATE, activate_hook(tx.clone()));
    inst.insert(RES_DEACTIVATE, deactivate_hook(tx.clone()));
    inst.insert(
        RES_PKG_NAME,
        Resource::Single(SingleResource::new(Value::String(String::new()))),
    );
    inst.insert(
        RES_PKG_VERSION,
        Resource::Single(SingleResource::new(Value::String(String::new()))),
    );
    inst.insert(
        RES_PACKAGE_URI,
        Resource::Single(SingleResource::new(Value::String(String::new())).with_write_hook(Box::new(move |value| {
            match parse_uri_write(value) {
                Ok(cmd) => {
                    let _ = tx.send(cmd);
                    Ok(())
                }
                Err(_) => Err(crate::error::CoreError::ValidationFailed("invalid software package URI".into())),
            }
        }))),
    );
    inst.insert(
        RES_UPDATE_STATE,
        Resource::Single(SingleResource::new(Value::Integer(State::Initial as i64))),
    );
    inst.insert(
        RES_UPDATE_RESULT,
        Resource::Single(SingleResource::new(Value::Integer(UpdateResult::Initial as i64))),
    );
    inst.insert(
        RES_ACTIVATION_STATE,
        Resource::Single(SingleResource::new(Value::Boolean(false))),
    );

    let mut instances = BTreeMap::new();
    instances.insert(0, inst);
    BaseObject::static_object(instances)
}

pub fn install_hook(tx: mpsc::UnboundedSender<Command>) -> Resource {
    Resource::Executable(ExecutableResource::new(Box::new(move || {
        let _ = tx.send(Command::Install);
    })))
}

pub fn uninstall_hook(tx: mpsc::UnboundedSender<Command>) -> Resource {
    Resource::Executable(ExecutableResource::new(Box::new(move || {
        let _ = tx.send(Command::Uninstall);
    })))
}

pub fn activate_hook(tx: mpsc::UnboundedSender<Command>) -> Resource {
    Resource::Executable(ExecutableResource::new(Box::new(move || {
        let _ = tx.send(Command::Activate);
    })))
}

pub fn deactivate_hook(tx: mpsc::UnboundedSender<Command>) -> Resource {
    Resource::Executable(ExecutableResource::new(Box::new(move || {
        let _ = tx.send(Command::Deactivate);
    })))
}

async fn set_state(tree: &tokio::sync::Mutex<Tree>, notifier: &Notifier, state: State) {
    let mut guard = tree.lock().await;
    if let Some(base) = guard.object_mut(OBJECT_ID) {
        if let Some(inst) = base.get_mut(0) {
            if let Some(r) = inst.get_mut(RES_UPDATE_STATE) {
                let _ = r.write_single(Value::Integer(state as i64));
            }
        }
    }
    notifier.notify_resource_changed(&guard, OBJECT_ID, 0, RES_UPDATE_STATE).await;
}

async fn set_result(tree: &tokio::sync::Mutex<Tree>, notifier: &Notifier, result: UpdateResult) {
    let mut guard = tree.lock().await;
    if let Some(base) = guard.object_mut(OBJECT_ID) {
        if let Some(inst) = base.get_mut(0) {
            if let Some(r) = inst.get_mut(RES_UPDATE_RESULT) {
                let _ = r.write_single(Value::Integer(result as i64));
            }
        }
    }
    notifier.notify_resource_changed(&guard, OBJECT_ID, 0, RES_UPDATE_RESULT).await;
}

async fn set_activation_state(tree: &tokio::sync::Mutex<Tree>, notifier: &Notifier, active: bool) {
    let mut guard = tree.lock().await;
    if let Some(base) = guard.object_mut(OBJECT_ID) {
        if let Some(inst) = base.get_mut(0) {
            if let Some(r) = inst.get_mut(RES_ACTIVATION_STATE) {
                let _ = r.write_single(Value::Boolean(active));
            }
        }
    }
    notifier.notify_resource_changed(&guard, OBJECT_ID, 0, RES_ACTIVATION_STATE).await;
}

/// Drives the install pipeline. `activate_signal` is the same handle
/// the bearer supervisor waits on to perform its binary swap and
/// restart.
pub async fn run(
    tree: Arc<tokio::sync::Mutex<Tree>>,
    notifier: Arc<Notifier>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    downloader: Arc<BlockDownloader>,
    update_runner: Arc<dyn UpdateRunner>,
    activate_signal: Arc<tokio::sync::Notify>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::ResetToInitial => {
                set_state(&tree, &notifier, State::Initial).await;
                set_result(&tree, &notifier, UpdateResult::Initial).await;
            }
            Command::DownloadFromUri(uri) => {
                set_state(&tree, &notifier, State::DownloadStarted).await;
                match download(&downloader, &uri).await {
                    Ok(()) => {
                        set_state(&tree, &notifier, State::Downloaded).await;
                        set_result(&tree, &notifier, UpdateResult::DownloadSuccess).await;
                        verify_and_deliver(&tree, &notifier, &update_runner).await;
                    }
                    Err(e) => {
                        set_state(&tree, &notifier, State::Initial).await;
                        set_result(&tree, &notifier, e.into()).await;
                    }
                }
            }
            Command::PackageUploadComplete => {
                set_state(&tree, &notifier, State::Downloaded).await;
                set_result(&tree, &notifier, UpdateResult::DownloadSuccess).await;
                verify_and_deliver(&tree, &notifier, &update_runner).await;
            }
            Command::Install => {
                let status = update_runner
                    .exec("/usr/sbin/sw_install", &[SOFTWARE_UPDATE_WORKDIR])
                    .await;
                match status {
                    Ok(status) if status.success() => {
                        set_state(&tree, &notifier, State::Installed).await;
                        set_result(&tree, &notifier, UpdateResult::InstallSuccess).await;
                    }
                    _ => {
                        set_result(&tree, &notifier, UpdateResult::InstallFailure).await;
                    }
                }
            }
            Command::Uninstall => {
                set_state(&tree, &notifier, State::Initial).await;
                set_result(&tree, &notifier, UpdateResult::Initial).await;
                set_activation_state(&tree, &notifier, false).await;
            }
            Command::Activate => {
                set_activation_state(&tree, &notifier, true).await;
                activate_signal.notify_one();
            }
            Command::Deactivate => {
                set_activation_state(&tree, &notifier, false).await;
            }
        }
    }
}

async fn verify_and_deliver(tree: &tokio::sync::Mutex<Tree>, notifier: &Notifier, update_runner: &Arc<dyn UpdateRunner>) {
    let status = update_runner
        .exec("/usr/sbin/sw_verify", &[SOFTWARE_UPDATE_ARCHIVE_PATH, SOFTWARE_UPDATE_WORKDIR])
        .await;
    match status {
        Ok(status) if status.success() => {
            set_state(tree, notifier, State::Delivered).await;
        }
        _ => {
            set_state(tree, notifier, State::Initial).await;
            set_result(tree, notifier, UpdateResult::IntegrityCheckFailed).await;
        }
    }
}

async fn download(downloader: &BlockDownloader, uri: &str) -> Result<(), DownloadError> {
    if let Some(rest) = uri.strip_prefix("coap://").or_else(|| uri.strip_prefix("coaps://")) {
        let mut parts = rest.splitn(2, '/');
        let host = parts.next().ok_or(DownloadError::InvalidUri)?;
        let path = parts.next().unwrap_or("");
        let peer: std::net::SocketAddr = host.parse().map_err(|_| DownloadError::InvalidUri)?;
        downloader
            .download(
                peer,
                &format!("/{path}"),
                std::path::Path::new(SOFTWARE_UPDATE_ARCHIVE_PATH),
                crate::block::MAX_BLOCK_SIZE_EXPONENT,
            )
            .await?;
        Ok(())
    } else {
        download_http(uri).await
    }
}

async fn download_http(uri: &str) -> Result<(), DownloadError> {
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(crate::constants::DOWNLOAD_REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|_| DownloadError::ConnLost)?;
    let response = client.get(uri).send().await.map_err(|_| DownloadError::ConnLost)?;
    if !response.status().is_success() {
        return Err(DownloadError::ConnLost);
    }
    let mut file = tokio::fs::File::create(SOFTWARE_UPDATE_ARCHIVE_PATH)
        .await
        .map_err(|_| DownloadError::ConnLost)?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|_| DownloadError::ConnLost)?;
        file.write_all(&chunk).await.map_err(|_| DownloadError::ConnLost)?;
    }
    file.flush().await.map_err(|_| DownloadError::ConnLost)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_write_recognizes_supported_schemes() {
        assert!(matches!(
            parse_uri_write(&Value::String("coaps://h/x".into())),
            Ok(Command::DownloadFromUri(_))
        ));
    }

    #[test]
    fn nul_byte_resets_to_initial() {
        assert!(matches!(
            parse_uri_write(&Value::String("\0".into())),
            Ok(Command::ResetToInitial)
        ));
    }

    #[test]
    fn unsupported_scheme_is_invalid_uri() {
        assert!(matches!(
            parse_uri_write(&Value::String("ftp://h/x".into())),
            Err(UpdateResult::InvalidUri)
        ));
    }
}
