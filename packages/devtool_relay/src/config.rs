use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / relay.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   relay.toml:      [server]
//                    port = 9000
//
//   env var:         RELAY_SERVER__PORT=9000   (double underscore = nesting)
//
//   CLI flag:        relay --port 9000         (highest priority)

/// Default config file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub logging: LoggingFileConfig,
    #[serde(default)]
    pub long_poll: LongPollFileConfig,
}

/// Listener settings (lives under `[server]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Prefix every route is mounted under.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Directory served for any path no relay route claims.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
            static_dir: None,
        }
    }
}

/// Logging settings (lives under `[logging]`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LoggingFileConfig {
    /// Debug-level logs plus a log line for every channel transition.
    #[serde(default)]
    pub verbose: bool,
}

/// Long-poll bridge timings (lives under `[long_poll]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LongPollFileConfig {
    /// Pause after a superseded session's socket closes, before reconnecting.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Session lifetime granted by each POST.
    #[serde(default = "default_poll_expiry_ms")]
    pub poll_expiry_ms: u64,
    /// Session lifetime granted by each push over an attached stream.
    #[serde(default = "default_push_expiry_ms")]
    pub push_expiry_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for LongPollFileConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            poll_expiry_ms: default_poll_expiry_ms(),
            push_expiry_ms: default_push_expiry_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_base_path() -> String {
    "/".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_poll_expiry_ms() -> u64 {
    30_000
}
fn default_push_expiry_ms() -> u64 {
    10_000
}
fn default_sweep_interval_ms() -> u64 {
    10_000
}

/// Build a figment that layers: defaults → config file → RELAY_* env vars.
///
/// A missing config file is not an error; its layer is simply empty.
///
/// Env vars use double-underscore for nesting into sections:
///   `RELAY_SERVER__PORT=9000`  →  `server.port = 9000`
///   `RELAY_LOGGING__VERBOSE=true`  →  `logging.verbose = true`
pub fn load_config(config_file: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let path = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("RELAY_").split("__"))
}

/// Command-line values that win over every other layer.
#[derive(Clone, Debug, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub verbose: bool,
    pub base_path: Option<String>,
    pub static_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn apply(&mut self, overrides: CliOverrides) {
        if let Some(host) = overrides.host {
            self.server.host = host;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if overrides.verbose {
            self.logging.verbose = true;
        }
        if let Some(base_path) = overrides.base_path {
            self.server.base_path = base_path;
        }
        if let Some(static_dir) = overrides.static_dir {
            self.server.static_dir = Some(static_dir);
        }
    }
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Normalized: leading slash, no trailing slash unless it is just "/".
    pub base_path: String,
    pub static_dir: Option<PathBuf>,
    pub verbose: bool,
    pub long_poll: LongPollConfig,
}

#[derive(Clone, Debug)]
pub struct LongPollConfig {
    pub reconnect_delay: Duration,
    pub poll_expiry: Duration,
    pub push_expiry: Duration,
    pub sweep_interval: Duration,
}

impl LongPollConfig {
    pub fn from_file(fc: &LongPollFileConfig) -> Self {
        Self {
            reconnect_delay: Duration::from_millis(fc.reconnect_delay_ms),
            poll_expiry: Duration::from_millis(fc.poll_expiry_ms),
            push_expiry: Duration::from_millis(fc.push_expiry_ms),
            sweep_interval: Duration::from_millis(fc.sweep_interval_ms.max(1)),
        }
    }
}

impl RelayConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.server.host.clone(),
            port: fc.server.port,
            base_path: normalize_base_path(&fc.server.base_path),
            static_dir: fc.server.static_dir.clone(),
            verbose: fc.logging.verbose,
            long_poll: LongPollConfig::from_file(&fc.long_poll),
        }
    }

    /// Join the base path with a route path that starts with `/`.
    pub fn route(&self, path: &str) -> String {
        if self.base_path == "/" {
            path.to_string()
        } else {
            format!("{}{}", self.base_path, path)
        }
    }
}

fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_server_file_config_defaults() {
        let d = ServerFileConfig::default();
        assert_eq!(d.host, "0.0.0.0");
        assert_eq!(d.port, 8080);
        assert_eq!(d.base_path, "/");
        assert!(d.static_dir.is_none());
    }

    #[test]
    fn test_long_poll_defaults() {
        let lp = LongPollConfig::from_file(&LongPollFileConfig::default());
        assert_eq!(lp.reconnect_delay, Duration::from_millis(1000));
        assert_eq!(lp.poll_expiry, Duration::from_millis(30_000));
        assert_eq!(lp.push_expiry, Duration::from_millis(10_000));
        assert_eq!(lp.sweep_interval, Duration::from_millis(10_000));
    }

    // ── base path ───────────────────────────────────────────────────────

    #[test]
    fn test_normalize_base_path() {
        assert_eq!(normalize_base_path(""), "/");
        assert_eq!(normalize_base_path("/"), "/");
        assert_eq!(normalize_base_path("devtools"), "/devtools");
        assert_eq!(normalize_base_path("/devtools/"), "/devtools");
        assert_eq!(normalize_base_path("/a/b/"), "/a/b");
    }

    #[test]
    fn test_route_joins_base_path() {
        let mut fc = FileConfig::default();
        let root = RelayConfig::from_file(&fc);
        assert_eq!(root.route("/target/abc"), "/target/abc");

        fc.server.base_path = "/relay/".into();
        let nested = RelayConfig::from_file(&fc);
        assert_eq!(nested.route("/target/abc"), "/relay/target/abc");
    }

    // ── overrides ───────────────────────────────────────────────────────

    #[test]
    fn test_cli_overrides_win() {
        let mut fc = FileConfig::default();
        fc.apply(CliOverrides {
            host: Some("127.0.0.1".into()),
            port: Some(9000),
            verbose: true,
            base_path: None,
            static_dir: Some(PathBuf::from("public")),
        });
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 9000);
        assert!(fc.logging.verbose);
        assert_eq!(fc.server.base_path, "/");
        assert_eq!(fc.server.static_dir, Some(PathBuf::from("public")));
    }

    #[test]
    fn test_unset_verbose_flag_keeps_file_value() {
        let mut fc = FileConfig::default();
        fc.logging.verbose = true;
        fc.apply(CliOverrides::default());
        assert!(fc.logging.verbose);
    }

    // ── load_config ─────────────────────────────────────────────────────

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(Some(&tmp.path().join("absent.toml")))
            .extract()
            .unwrap();
        assert_eq!(fc.server.port, 8080);
        assert!(!fc.logging.verbose);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        std::fs::write(
            &path,
            "[server]\nhost = \"127.0.0.1\"\nport = 9222\nbase_path = \"/inspect\"\n\n[long_poll]\nreconnect_delay_ms = 250\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(Some(&path)).extract().unwrap();
        assert_eq!(fc.server.host, "127.0.0.1");
        assert_eq!(fc.server.port, 9222);
        assert_eq!(fc.server.base_path, "/inspect");
        assert_eq!(fc.long_poll.reconnect_delay_ms, 250);
        assert_eq!(fc.long_poll.poll_expiry_ms, 30_000);
    }
}
