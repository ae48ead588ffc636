// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Node Configuration Types
//
// Defines the configuration schema for a team-run node, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Node identity and capabilities
// - Discovery registry timing and static peers
// - Degradation thresholds
// - Envelope transport security
// - Network and observability settings
// - Team definitions served by this node

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::domain::peer::{normalize_base_url, PeerCapabilities, TrustMode};
use crate::domain::team::TeamDefinition;

pub const API_VERSION: &str = "teamgrid.dev/v1";
pub const KIND: &str = "NodeConfig";

/// Top-level Kubernetes-style node configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigManifest {
    /// API version (must be "teamgrid.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "NodeConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: NodeConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Node configuration specification (content under spec:)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfigSpec {
    pub node: NodeIdentity,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub degradation: DegradationConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub runtime: RuntimeEndpointConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,

    /// Team definitions this node can start runs for
    #[serde(default)]
    pub teams: Vec<TeamDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// Unique stable node identifier (UUID recommended)
    pub id: String,

    /// Human-readable node name announced to peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Base URL peers use to reach this node
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Externally visible URL when behind a proxy or NAT
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_base_url: Option<String>,

    #[serde(default)]
    pub capabilities: PeerCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Peers not seen for this long are pruned
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    #[serde(default = "default_degraded_after_ms")]
    pub degraded_after_ms: u64,

    #[serde(default = "default_unreachable_after_ms")]
    pub unreachable_after_ms: u64,

    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Peers announced at startup
    #[serde(default)]
    pub static_peers: Vec<StaticPeerConfig>,

    /// Registry node whose peer list replaces ours on every sync round.
    /// Without it the node heartbeats every known peer directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticPeerConfig {
    pub node_id: String,

    #[serde(default)]
    pub node_name: Option<String>,

    pub base_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertised_base_url: Option<String>,

    #[serde(default)]
    pub capabilities: PeerCapabilities,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    /// Consecutive routing failures after which a run is marked degraded
    #[serde(default = "default_degraded_after_failures")]
    pub degraded_after_failures: u32,

    /// Consecutive routing failures after which a run is stopped
    #[serde(default = "default_stop_after_failures")]
    pub stop_after_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub trust_mode: TrustMode,

    /// Key used to sign outgoing envelopes in strict_signed mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,

    /// keyId -> secret (supports "env:VAR_NAME")
    #[serde(default)]
    pub shared_secrets: HashMap<String, String>,

    /// Nodes allowed to send signed envelopes to this node
    #[serde(default)]
    pub allowed_node_ids: Vec<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeEndpointConfig {
    /// Agent runtime webhook receiving local deliveries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Network bind address (e.g. "0.0.0.0" or "127.0.0.1")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// HTTP API port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_base_url() -> String {
    format!("http://127.0.0.1:{}", default_api_port())
}

fn default_ttl_ms() -> u64 {
    120_000
}

fn default_degraded_after_ms() -> u64 {
    20_000
}

fn default_unreachable_after_ms() -> u64 {
    45_000
}

fn default_maintenance_interval_ms() -> u64 {
    5_000
}

fn default_degraded_after_failures() -> u32 {
    2
}

fn default_stop_after_failures() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8400
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            degraded_after_ms: default_degraded_after_ms(),
            unreachable_after_ms: default_unreachable_after_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            static_peers: vec![],
            upstream_url: None,
        }
    }
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            degraded_after_failures: default_degraded_after_failures(),
            stop_after_failures: default_stop_after_failures(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            trust_mode: TrustMode::TrustedLan,
            key_id: None,
            shared_secrets: HashMap::new(),
            allowed_node_ids: vec![],
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
        }
    }
}

impl Default for NodeConfigSpec {
    fn default() -> Self {
        Self {
            node: NodeIdentity {
                id: uuid::Uuid::new_v4().to_string(),
                name: None,
                base_url: default_base_url(),
                advertised_base_url: None,
                capabilities: PeerCapabilities::default(),
            },
            discovery: DiscoveryConfig::default(),
            degradation: DegradationConfig::default(),
            transport: TransportConfig::default(),
            runtime: RuntimeEndpointConfig::default(),
            network: NetworkConfig::default(),
            observability: None,
            teams: vec![],
        }
    }
}

impl Default for NodeConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "teamgrid-node".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: NodeConfigSpec::default(),
        }
    }
}

/// Resolve a secret value, following "env:VAR_NAME" indirections.
pub fn resolve_secret(value: &str) -> Option<String> {
    match value.strip_prefix("env:") {
        Some(var) => std::env::var(var).ok().filter(|v| !v.is_empty()),
        None if value.is_empty() => None,
        None => Some(value.to_string()),
    }
}

impl NodeConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. TEAMGRID_CONFIG_PATH environment variable
    /// 2. ./teamgrid-config.yaml (working directory)
    /// 3. ~/.teamgrid/config.yaml (user home)
    /// 4. /etc/teamgrid/config.yaml (system, Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("TEAMGRID_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./teamgrid-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".teamgrid").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/teamgrid/config.yaml");
            if system_config.exists() {
                return Some(system_config);
            }
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing/invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path).map_err(|e| {
                anyhow::anyhow!("Failed to load config at {:?}: {}", path, e)
            })?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TEAMGRID_NODE_ID") {
            if !val.trim().is_empty() {
                tracing::info!("Environment override: TEAMGRID_NODE_ID={}", val);
                self.spec.node.id = val;
            }
        }

        if let Ok(val) = std::env::var("TEAMGRID_BASE_URL") {
            if !val.trim().is_empty() {
                tracing::info!("Environment override: TEAMGRID_BASE_URL={}", val);
                self.spec.node.base_url = val;
            }
        }

        if let Ok(val) = std::env::var("TEAMGRID_TRUST_MODE") {
            match val.to_lowercase().as_str() {
                "trusted_lan" => self.spec.transport.trust_mode = TrustMode::TrustedLan,
                "strict_signed" => self.spec.transport.trust_mode = TrustMode::StrictSigned,
                _ => {
                    tracing::warn!(
                        "Invalid value for TEAMGRID_TRUST_MODE: '{}'. Expected trusted_lan/strict_signed. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let node = &self.spec.node;
        if node.id.trim().is_empty() {
            anyhow::bail!("spec.node.id cannot be empty");
        }
        normalize_base_url(&node.base_url)?;
        if let Some(advertised) = &node.advertised_base_url {
            normalize_base_url(advertised)?;
        }

        let discovery = &self.spec.discovery;
        if !(discovery.degraded_after_ms < discovery.unreachable_after_ms
            && discovery.unreachable_after_ms < discovery.ttl_ms)
        {
            anyhow::bail!(
                "spec.discovery thresholds must satisfy degraded_after_ms < unreachable_after_ms < ttl_ms"
            );
        }
        if discovery.maintenance_interval_ms == 0 {
            anyhow::bail!("spec.discovery.maintenance_interval_ms must be positive");
        }
        for peer in &discovery.static_peers {
            if peer.node_id.trim().is_empty() {
                anyhow::bail!("static peer node_id cannot be empty");
            }
            normalize_base_url(&peer.base_url)?;
        }
        if let Some(upstream) = &discovery.upstream_url {
            normalize_base_url(upstream)?;
        }

        let degradation = &self.spec.degradation;
        if degradation.degraded_after_failures == 0
            || degradation.degraded_after_failures > degradation.stop_after_failures
        {
            anyhow::bail!(
                "spec.degradation thresholds must satisfy 0 < degraded_after_failures <= stop_after_failures"
            );
        }

        let transport = &self.spec.transport;
        if transport.trust_mode == TrustMode::StrictSigned {
            let key_id = transport
                .key_id
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("strict_signed transport requires spec.transport.key_id"))?;
            let secret = transport
                .shared_secrets
                .get(key_id)
                .and_then(|value| resolve_secret(value));
            if secret.is_none() {
                anyhow::bail!("No resolvable shared secret for key id '{}'", key_id);
            }
        }

        for team in &self.spec.teams {
            if team.id.is_empty() {
                anyhow::bail!("team definition id cannot be empty");
            }
        }

        if let Some(endpoint) = &self.spec.runtime.endpoint {
            normalize_base_url(endpoint)?;
        }

        Ok(())
    }
}
