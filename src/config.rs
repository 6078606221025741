//! Configuration for modelswap
//!
//! A [`Config`] is an immutable snapshot: once installed on the manager it is
//! never mutated, only replaced wholesale by a reload. Group compatibility
//! between two snapshots is decided field-wise (see `sync.rs`), so every type
//! here derives `PartialEq`.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Group ID assigned to models that no configured group claims.
pub const DEFAULT_GROUP_ID: &str = "(default)";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Models to manage, keyed by model ID (case-sensitive)
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Scheduling groups. Models not claimed by any group are placed in an
    /// implicit swap+exclusive default group during normalisation.
    #[serde(default)]
    pub groups: HashMap<String, GroupConfig>,

    /// Listen address for the proxy
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Prometheus metrics port (None to disable)
    #[serde(default)]
    pub metrics_port: Option<u16>,

    /// Optional API key; when set, requests must carry it as a bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// How long a backend may take to become ready
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// How long a graceful stop waits before escalating to SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

/// Configuration for a single model.
///
/// ```yaml
/// models:
///   llama:
///     cmd: "llama-server --port 8001 -m /models/llama.gguf"
///     proxy: "http://127.0.0.1:8001"
///     name: "Llama 3"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Command line that starts the backend process
    pub cmd: String,

    /// Upstream base URL the backend serves on (e.g. "http://127.0.0.1:8001")
    pub proxy: String,

    /// Display name (defaults to the model ID)
    #[serde(default)]
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Hide from /v1/models listings
    #[serde(default)]
    pub unlisted: bool,

    /// Alias accepted from clients and sent upstream instead of the model ID
    #[serde(default)]
    pub use_model_name: String,

    /// Extra environment for the backend process, as KEY=VALUE pairs
    #[serde(default)]
    pub env: Vec<String>,

    /// Arbitrary metadata. Participates in structural equality, so a metadata
    /// edit alone is enough to make a group incompatible on reload.
    #[serde(default)]
    pub metadata: HashMap<String, serde_yaml::Value>,
}

/// A scheduling domain: members share the exclusive/swap/persistent policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Permit evicting the current member to satisfy a new acquire
    #[serde(default)]
    pub swap: bool,

    /// At most one member running at a time
    #[serde(default)]
    pub exclusive: bool,

    /// Members are never stopped except during full shutdown
    #[serde(default)]
    pub persistent: bool,

    /// Ordered member model IDs
    #[serde(default)]
    pub members: Vec<String>,
}

impl ModelConfig {
    /// Structural equality over the fields that shape the running process.
    /// Display-only fields (name, description, unlisted) may change without
    /// invalidating a running backend; metadata participates because recipe
    /// tooling keys behaviour off it.
    pub fn runtime_eq(&self, other: &ModelConfig) -> bool {
        self.cmd == other.cmd
            && self.proxy == other.proxy
            && self.use_model_name == other.use_model_name
            && self.env == other.env
            && self.metadata == other.metadata
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_start_timeout() -> u64 {
    120
}

fn default_stop_timeout() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            groups: HashMap::new(),
            listen: default_listen(),
            metrics_port: None,
            api_key: None,
            start_timeout_secs: default_start_timeout(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, normalise and validate it.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a YAML string, normalise and validate it.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(contents)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Assign every model that no group claims to the implicit default group.
    fn normalize(&mut self) {
        let claimed: HashSet<&String> = self
            .groups
            .values()
            .flat_map(|g| g.members.iter())
            .collect();

        let mut unclaimed: Vec<String> = self
            .models
            .keys()
            .filter(|id| !claimed.contains(id))
            .cloned()
            .collect();
        unclaimed.sort();

        if !unclaimed.is_empty() {
            let default = self
                .groups
                .entry(DEFAULT_GROUP_ID.to_string())
                .or_insert(GroupConfig {
                    swap: true,
                    exclusive: true,
                    persistent: false,
                    members: Vec::new(),
                });
            default.members.extend(unclaimed);
        }
    }

    /// Reject configs that break the group invariants, warn on soft issues.
    fn validate(&self) -> Result<()> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (group_id, group) in &self.groups {
            for member in &group.members {
                if !self.models.contains_key(member) {
                    bail!("group {group_id} references unknown model {member}");
                }
                if let Some(other) = seen.insert(member, group_id) {
                    bail!("model {member} belongs to both group {other} and group {group_id}");
                }
            }
            if group.swap && !group.exclusive {
                warn!(
                    group = %group_id,
                    "swap has no effect without exclusive; members will run concurrently"
                );
            }
        }

        for (model_id, model) in &self.models {
            if model.cmd.split_whitespace().next().is_none() {
                bail!("model {model_id} has an empty cmd");
            }
            if model.proxy.trim().is_empty() {
                bail!("model {model_id} has an empty proxy URL");
            }
        }

        Ok(())
    }

    /// Look up a model by primary ID or `useModelName` alias. Returns the
    /// config together with the resolved primary ID.
    pub fn find_config(&self, name: &str) -> Option<(&ModelConfig, String)> {
        if let Some(cfg) = self.models.get(name) {
            return Some((cfg, name.to_string()));
        }
        self.models
            .iter()
            .find(|(_, cfg)| !cfg.use_model_name.is_empty() && cfg.use_model_name == name)
            .map(|(id, cfg)| (cfg, id.clone()))
    }

    /// Normalise a requested name (primary ID or alias) to the primary ID.
    pub fn real_model_name(&self, name: &str) -> Option<String> {
        self.find_config(name).map(|(_, id)| id)
    }

    /// The group that owns a model, if any.
    pub fn group_for_model(&self, model_id: &str) -> Option<(&str, &GroupConfig)> {
        self.groups
            .iter()
            .find(|(_, g)| g.members.iter().any(|m| m == model_id))
            .map(|(id, g)| (id.as_str(), g))
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
models:
  llama:
    cmd: "llama-server --port 8001"
    proxy: "http://127.0.0.1:8001"
    name: "Llama 3"
  qwen:
    cmd: "llama-server --port 8002"
    proxy: "http://127.0.0.1:8002"
    unlisted: true
groups:
  gpu:
    swap: true
    exclusive: true
    members: [llama, qwen]
listen: "127.0.0.1:9999"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.listen, "127.0.0.1:9999");
        assert!(config.models["qwen"].unlisted);
        assert_eq!(config.groups["gpu"].members, vec!["llama", "qwen"]);
    }

    #[test]
    fn test_unclaimed_models_fall_into_default_group() {
        let yaml = r#"
models:
  a:
    cmd: "sleep 100"
    proxy: "http://127.0.0.1:8001"
  b:
    cmd: "sleep 100"
    proxy: "http://127.0.0.1:8002"
groups:
  g1:
    members: [a]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let default = &config.groups[DEFAULT_GROUP_ID];
        assert_eq!(default.members, vec!["b"]);
        assert!(default.swap);
        assert!(default.exclusive);
        assert!(!default.persistent);
    }

    #[test]
    fn test_find_config_by_alias() {
        let yaml = r#"
models:
  qwen3-30b:
    cmd: "sleep 100"
    proxy: "http://127.0.0.1:8001"
    useModelName: "gpt-4"
"#;
        let config = Config::from_yaml(yaml).unwrap();

        let (_, resolved) = config.find_config("gpt-4").unwrap();
        assert_eq!(resolved, "qwen3-30b");
        assert_eq!(config.real_model_name("gpt-4").unwrap(), "qwen3-30b");
        assert_eq!(config.real_model_name("qwen3-30b").unwrap(), "qwen3-30b");
        assert!(config.real_model_name("missing").is_none());
    }

    #[test]
    fn test_group_member_must_exist() {
        let yaml = r#"
models:
  a:
    cmd: "sleep 100"
    proxy: "http://127.0.0.1:8001"
groups:
  g1:
    members: [a, ghost]
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_model_in_two_groups_rejected() {
        let yaml = r#"
models:
  a:
    cmd: "sleep 100"
    proxy: "http://127.0.0.1:8001"
groups:
  g1:
    members: [a]
  g2:
    members: [a]
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_cmd_rejected() {
        let yaml = r#"
models:
  a:
    cmd: "   "
    proxy: "http://127.0.0.1:8001"
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_group_for_model() {
        let yaml = r#"
models:
  a:
    cmd: "sleep 100"
    proxy: "http://127.0.0.1:8001"
groups:
  g1:
    members: [a]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let (gid, group) = config.group_for_model("a").unwrap();
        assert_eq!(gid, "g1");
        assert_eq!(group.members, vec!["a"]);
        assert!(config.group_for_model("b").is_none());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "models:\n  a:\n    cmd: \"sleep 1\"\n    proxy: \"http://127.0.0.1:8001\"\n",
        )
        .unwrap();

        let config = Config::load(&path).await.unwrap();
        assert!(config.models.contains_key("a"));

        let err = Config::load(&dir.path().join("missing.yaml")).await;
        assert!(err.is_err());
    }

    #[test]
    fn test_runtime_eq_ignores_display_fields() {
        let base = ModelConfig {
            cmd: "sleep 1".to_string(),
            proxy: "http://127.0.0.1:8001".to_string(),
            ..Default::default()
        };

        let mut display_only = base.clone();
        display_only.name = "Display".to_string();
        display_only.description = "blurb".to_string();
        display_only.unlisted = true;
        assert!(base.runtime_eq(&display_only));

        let mut new_cmd = base.clone();
        new_cmd.cmd = "sleep 2".to_string();
        assert!(!base.runtime_eq(&new_cmd));

        let mut new_alias = base.clone();
        new_alias.use_model_name = "gpt-4".to_string();
        assert!(!base.runtime_eq(&new_alias));
    }

    #[test]
    fn test_structural_equality_includes_metadata() {
        let yaml = r#"
models:
  a:
    cmd: "sleep 100"
    proxy: "http://127.0.0.1:8001"
    metadata:
      tier: fast
"#;
        let c1 = Config::from_yaml(yaml).unwrap();
        let mut c2 = c1.clone();
        assert_eq!(c1.models["a"], c2.models["a"]);

        c2.models.get_mut("a").unwrap().metadata.insert(
            "tier".to_string(),
            serde_yaml::Value::String("slow".to_string()),
        );
        assert_ne!(c1.models["a"], c2.models["a"]);
    }
}
