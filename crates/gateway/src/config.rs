// BSD-2-Clause

//! Gateway configuration: CLI flags plus the JSON `{agents, adapters}` document.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level CLI configuration for the `tilegate` binary.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "tilegate", version, about = "Device gateway and transport-multiplexing runtime")]
pub struct GatewayConfig {
    /// Host to bind the gateway agent's transport on.
    #[arg(long, default_value = "127.0.0.1", env = "GATEWAY_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 9400, env = "GATEWAY_PORT")]
    pub port: u16,

    /// Path to the gateway document (`{agents, adapters}`).
    #[arg(long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, default_value = "text", env = "GATEWAY_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Maximum bytes buffered while assembling one report.
    #[arg(long, default_value_t = 1024 * 1024, env = "GATEWAY_MAX_REPORT_BYTES")]
    pub max_report_bytes: usize,

    /// Maximum fallback attempts when connecting across aggregated adapters.
    #[arg(long, default_value_t = 5, env = "GATEWAY_MAX_CONNECT_RETRIES")]
    pub max_connect_retries: u32,

    /// Maximum silent reconnect attempts after a mid-flight disconnect.
    #[arg(long, default_value_t = 3, env = "GATEWAY_RECONNECT_ATTEMPTS")]
    pub reconnect_attempts: u32,

    /// Hard upper bound on an in-flight async RPC before it times out.
    #[arg(long, default_value_t = 60_000, env = "GATEWAY_ASYNC_RPC_TIMEOUT_MS")]
    pub async_rpc_timeout_ms: u64,

    /// Per-subscriber bounded queue capacity for report fan-out.
    #[arg(long, default_value_t = 64, env = "GATEWAY_SUBSCRIBER_QUEUE_CAPACITY")]
    pub subscriber_queue_capacity: usize,
}

impl GatewayConfig {
    pub fn async_rpc_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.async_rpc_timeout_ms)
    }

    /// Load the `{agents, adapters}` document, or an empty one if unset.
    pub fn load_document(&self) -> crate::error::GatewayResult<GatewayDocument> {
        let Some(path) = &self.config else {
            return Ok(GatewayDocument::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::error::bad_argument(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| crate::error::bad_argument(format!("invalid gateway config: {e}")))
    }
}

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// The `{agents: [...], adapters: [...]}` configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayDocument {
    #[serde(default)]
    pub agents: Vec<PluginEntry>,
    #[serde(default)]
    pub adapters: Vec<AdapterEntry>,
}

/// One entry naming a plug-in and passing opaque args to its constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,
}

/// One adapter entry; `port` is transport-specific (e.g. a serial device
/// path encoded as a string) and is passed through in `args` unless the
/// adapter factory needs it distinguished for a default binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterEntry {
    pub name: String,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub args: HashMap<String, serde_json::Value>,
}

/// Parse a `transport:param1=value;param2=value` connection string into its
/// scheme and key/value pairs.
pub fn parse_connection_spec(spec: &str) -> (String, HashMap<String, String>) {
    let (scheme, rest) = match spec.split_once(':') {
        Some((s, r)) => (s.to_owned(), r),
        None => return (spec.to_owned(), HashMap::new()),
    };
    let mut params = HashMap::new();
    for pair in rest.split(';') {
        if pair.is_empty() {
            continue;
        }
        if let Some((k, v)) = pair.split_once('=') {
            params.insert(k.to_owned(), v.to_owned());
        } else {
            params.insert(pair.to_owned(), String::new());
        }
    }
    (scheme, params)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
