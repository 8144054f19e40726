use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Top-level `workspaced.toml`. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspacedConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// Parse a humantime string, falling back when it is malformed.
/// `validate` reports malformed values before anything runs.
fn duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ---------------------------------------------------------------------------
// [server]
// ---------------------------------------------------------------------------

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_server_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// [proxy]
// ---------------------------------------------------------------------------

fn default_proxy_port() -> u16 {
    80
}

fn default_worker_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_domain() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// Host the external forwarding ports are reachable on.
    #[serde(default = "default_worker_host")]
    pub worker_host: String,
    /// Public domain fingerprints are prefixed to.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: default_proxy_port(),
            worker_host: default_worker_host(),
            base_domain: default_base_domain(),
        }
    }
}

// ---------------------------------------------------------------------------
// [provisioner]
// ---------------------------------------------------------------------------

fn default_binary() -> String {
    "devpod".to_string()
}

fn default_ide() -> String {
    "openvscode".to_string()
}

fn default_machine_option() -> String {
    "AWS_INSTANCE_TYPE".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionerConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_ide")]
    pub ide: String,
    /// Provider option the workspace machine type is passed through.
    #[serde(default = "default_machine_option")]
    pub machine_option: String,
    /// Extra `--provider-option KEY=VALUE` pairs. Values may reference `$VAR`.
    #[serde(default)]
    pub provider_options: BTreeMap<String, String>,
    #[serde(default)]
    pub env_file: Option<String>,
    /// Commands run once before workers start, e.g. registering the provider.
    #[serde(default)]
    pub setup: Vec<Vec<String>>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            ide: default_ide(),
            machine_option: default_machine_option(),
            provider_options: BTreeMap::new(),
            env_file: None,
            setup: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// [ports]
// ---------------------------------------------------------------------------

fn default_port_base() -> u16 {
    20000
}

fn default_port_window() -> u16 {
    1000
}

fn default_ready_timeout() -> String {
    "30s".to_string()
}

fn default_forward_command() -> String {
    "socat TCP-LISTEN:{external},fork,reuseaddr TCP:127.0.0.1:{internal}".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_port_base")]
    pub base: u16,
    #[serde(default = "default_port_window")]
    pub window: u16,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: String,
    /// Shell command template; `{external}` and `{internal}` are substituted.
    #[serde(default = "default_forward_command")]
    pub forward_command: String,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            base: default_port_base(),
            window: default_port_window(),
            ready_timeout: default_ready_timeout(),
            forward_command: default_forward_command(),
        }
    }
}

impl PortsConfig {
    pub fn ready_timeout(&self) -> Duration {
        duration_or(&self.ready_timeout, Duration::from_secs(30))
    }
}

// ---------------------------------------------------------------------------
// [queue]
// ---------------------------------------------------------------------------

fn default_concurrency() -> usize {
    10
}

fn default_unique_ttl() -> String {
    "5m".to_string()
}

fn default_max_retry() -> u32 {
    3
}

fn default_retry_delay() -> String {
    "1s".to_string()
}

fn default_critical_weight() -> u32 {
    10
}

fn default_default_weight() -> u32 {
    6
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_unique_ttl")]
    pub unique_ttl: String,
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// First retry delay; later retries back off exponentially.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,
    #[serde(default = "default_critical_weight")]
    pub critical_weight: u32,
    #[serde(default = "default_default_weight")]
    pub default_weight: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            unique_ttl: default_unique_ttl(),
            max_retry: default_max_retry(),
            retry_delay: default_retry_delay(),
            critical_weight: default_critical_weight(),
            default_weight: default_default_weight(),
        }
    }
}

impl QueueConfig {
    pub fn unique_ttl(&self) -> Duration {
        duration_or(&self.unique_ttl, Duration::from_secs(300))
    }

    pub fn retry_delay(&self) -> Duration {
        duration_or(&self.retry_delay, Duration::from_secs(1))
    }
}

// ---------------------------------------------------------------------------
// [hub]
// ---------------------------------------------------------------------------

fn default_send_buffer() -> usize {
    256
}

fn default_ping_period() -> String {
    "54s".to_string()
}

fn default_pong_wait() -> String {
    "60s".to_string()
}

fn default_write_wait() -> String {
    "10s".to_string()
}

fn default_max_message_size() -> usize {
    512
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
    #[serde(default = "default_ping_period")]
    pub ping_period: String,
    #[serde(default = "default_pong_wait")]
    pub pong_wait: String,
    #[serde(default = "default_write_wait")]
    pub write_wait: String,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_buffer: default_send_buffer(),
            ping_period: default_ping_period(),
            pong_wait: default_pong_wait(),
            write_wait: default_write_wait(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl HubConfig {
    pub fn ping_period(&self) -> Duration {
        duration_or(&self.ping_period, Duration::from_secs(54))
    }

    pub fn pong_wait(&self) -> Duration {
        duration_or(&self.pong_wait, Duration::from_secs(60))
    }

    pub fn write_wait(&self) -> Duration {
        duration_or(&self.write_wait, Duration::from_secs(10))
    }
}

// ---------------------------------------------------------------------------
// [bus]
// ---------------------------------------------------------------------------

fn default_exchange() -> String {
    "apps.workspaced-v1".to_string()
}

fn default_routing_key() -> String {
    "workspaced-v1.on.workspace.log-handler".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            routing_key: default_routing_key(),
        }
    }
}

// ---------------------------------------------------------------------------
// [reconcile]
// ---------------------------------------------------------------------------

fn default_reconcile_interval() -> String {
    "10s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reconcile_interval")]
    pub interval: String,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_reconcile_interval(),
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        duration_or(&self.interval, Duration::from_secs(10))
    }
}
