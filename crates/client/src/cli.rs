//! CLI flags and the process exit codes the supervisor maps its
//! outcomes to.

use clap::Parser;

use crate::constants::{DEFAULT_BOOTSTRAP_PORT, DEFAULT_COAP_PORT, DEFAULT_LIFETIME_SECS};

#[derive(Debug, Parser, Clone)]
#[command(name = "lwm2m-client", about = "LwM2M client for an IG60-class gateway")]
pub struct Args {
    /// Local address to bind the CoAP endpoint to.
    #[arg(long, default_value = "0.0.0.0")]
    pub address: String,

    /// Local port to bind the CoAP endpoint to.
    #[arg(long, default_value_t = DEFAULT_COAP_PORT)]
    pub port: u16,

    /// Bootstrap server address, when bootstrapping is configured.
    #[arg(long)]
    pub bootstrap_address: Option<String>,

    /// Bootstrap server port.
    #[arg(long, default_value_t = DEFAULT_BOOTSTRAP_PORT)]
    pub bootstrap_port: u16,

    /// Bootstrap PSK, hex-encoded.
    #[arg(long)]
    pub bootstrap_psk: Option<String>,

    /// Management server address, when bootstrap is not configured.
    #[arg(long)]
    pub server_address: Option<String>,

    /// Management server port.
    #[arg(long, default_value_t = DEFAULT_COAP_PORT)]
    pub server_port: u16,

    /// Management server PSK, hex-encoded.
    #[arg(long)]
    pub server_psk: Option<String>,

    /// LwM2M endpoint client name.
    #[arg(long)]
    pub endpoint: String,

    /// Registration lifetime in seconds (overridden by bootstrap if the
    /// server writes a positive lifetime into `/1/0/1`).
    #[arg(long, default_value_t = DEFAULT_LIFETIME_SECS)]
    pub lifetime: u32,

    /// Enable debug-level logging.
    #[arg(long)]
    pub debug: bool,
}

/// `errno`-style exit codes rather than raw numbers, matching the
/// platform's values for anyone grepping a failing service's exit
/// status.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    /// Ctrl-C / cancellation.
    pub const EINTR: i32 = 4;
    /// No network interfaces matched the bearer preference list.
    pub const ENONET: i32 = 64;
    /// A software install was activated; an external manager should
    /// swap the binary and restart it.
    pub const ENOPKG: i32 = 65;
    /// Any other failure after exhausting retries.
    pub const EAGAIN: i32 = 11;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_required_flags() {
        let args = Args::parse_from(["lwm2m-client", "--endpoint", "urn:imei:123"]);
        assert_eq!(args.endpoint, "urn:imei:123");
        assert_eq!(args.port, DEFAULT_COAP_PORT);
        assert!(!args.debug);
    }
}
