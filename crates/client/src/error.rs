//! Error kinds for each layer of the client, every one mapped to the
//! CoAP status or control-flow consequence it carries there.

use lwm2m_coap::Code;
use thiserror::Error;

/// Errors local to one request's decode/validate/mutate step. Never
/// surfaced past the request that produced them — `into_response_code`
/// is how the CoAP site turns one into an answer.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed TLV: {0}")]
    MalformedTlv(#[from] lwm2m_core::TlvError),
    #[error("wrong content format {0:?}")]
    WrongContentFormat(Option<u16>),
    #[error("unknown resource id {0}")]
    UnknownResource(u16),
    #[error("value variant mismatch: expected {expected:?}, got {got:?}")]
    VariantMismatch {
        expected: lwm2m_core::ValueKind,
        got: lwm2m_core::ValueKind,
    },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("method not allowed on this node")]
    MethodNotAllowed,
    #[error("no such path")]
    NotFound,
    #[error("block out of sequence")]
    BlockOutOfSequence,
}

impl CoreError {
    pub fn response_code(&self) -> Code {
        match self {
            CoreError::MalformedTlv(_)
            | CoreError::UnknownResource(_)
            | CoreError::VariantMismatch { .. }
            | CoreError::ValidationFailed(_) => Code::BAD_REQUEST,
            CoreError::WrongContentFormat(_) => Code::NOT_ACCEPTABLE,
            CoreError::MethodNotAllowed => Code::METHOD_NOT_ALLOWED,
            CoreError::NotFound => Code::NOT_FOUND,
            CoreError::BlockOutOfSequence => Code::REQUEST_ENTITY_INCOMPLETE,
        }
    }
}

/// Errors from the CoAP transport layer. Logged at warn; the caller
/// advances to the next candidate address rather than treating these
/// as fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Coap(#[from] lwm2m_coap::TransportError),
    #[error("request timed out")]
    Timeout,
}

/// Cause carried in an update object's result field.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DownloadError {
    #[error("invalid URI")]
    InvalidUri,
    #[error("connection lost")]
    ConnLost,
    #[error("integrity check failed")]
    IntegrityFailed,
    #[error("unsupported package type")]
    Unsupported,
}

/// Errors surfaced to the bootstrap handler.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("bootstrap server responded {0}")]
    UnexpectedResponse(Code),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("bootstrap finish never arrived before the idle timeout")]
    IdleTimeout,
}

/// Errors surfaced to the registration driver.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("registration server responded {0}")]
    UnexpectedResponse(Code),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("server has forgotten this registration")]
    NotFound,
}

/// Errors surfaced to the bearer supervisor's run-once attempt.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no network interfaces match the bearer preference list")]
    NoNetwork,
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("client was cancelled")]
    Cancelled,
    #[error("a software install was activated")]
    SoftwareInstallActivated,
    #[error("no management server address is configured or available")]
    UnresolvedServer,
}
