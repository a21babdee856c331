/// Default CoAP port when `--port` is not given.
pub const DEFAULT_COAP_PORT: u16 = 5683;

/// Default CoAP bootstrap port when `--bootstrap-port` is not given.
pub const DEFAULT_BOOTSTRAP_PORT: u16 = 5683;

/// Default registration lifetime in seconds when `--lifetime` is not given.
pub const DEFAULT_LIFETIME_SECS: u32 = 86_400;

/// HTTP/CoAP download request timeout.
pub const DOWNLOAD_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default blockwise size exponent: `1 << (4+6) = 1024` bytes.
pub const DEFAULT_BLOCK_SIZE_EXPONENT: u8 = 6;

/// Firmware package download/staging path (Object 5).
pub const FIRMWARE_UPDATE_PATH: &str = "/tmp/update.bin";

/// Software package tarball download path (Object 9).
pub const SOFTWARE_UPDATE_ARCHIVE_PATH: &str = "/tmp/swupdate.tar.gz";

/// Software package unpack working directory (Object 9).
pub const SOFTWARE_UPDATE_WORKDIR: &str = "/tmp/swupdate/";

/// journald cursor file for incremental syslog reads (Object 10259).
pub const SYSLOG_CURSOR_PATH: &str = "/tmp/lwm2m-cursor";

/// Full syslog dump destination (Object 10259).
pub const SYSLOG_DUMP_PATH: &str = "/tmp/syslog.txt";

/// Wi-Fi profile name prefix, followed by the Object 12 instance id.
pub const WLAN_PROFILE_PREFIX: &str = "lwm2m_conn_";
