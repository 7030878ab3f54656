//! Configuration loading and the concrete config structs shared
//! by the coordinator and the worker.
//!
//! The loader follows a `ConfigLoader`/`HasConfigExamples` contract:
//! `Default` config baked in, optional TOML file overlay, environment
//! variable overlay, `examples()` for config-dump tooling, all merged
//! through `figment` directly.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A config type that can hand out one or more example instances, used by
/// `--dump-config`-style tooling and by config-loadability tests.
pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>> {
        vec![]
    }
}

pub struct ConfigExample<T> {
    pub name: &'static str,
    pub config: T,
}

pub struct ConfigLoader<T> {
    config_file_name: PathBuf,
    env_prefix: &'static str,
    _marker: std::marker::PhantomData<T>,
}

impl<T> ConfigLoader<T>
where
    T: Default + Serialize + for<'de> Deserialize<'de>,
{
    pub fn new(config_file_name: &Path, env_prefix: &'static str) -> Self {
        Self {
            config_file_name: config_file_name.to_path_buf(),
            env_prefix,
            _marker: std::marker::PhantomData,
        }
    }

    /// Loads the effective config: packaged `Default` overlaid by the TOML
    /// file at `config_file_name` (if present) overlaid by `{env_prefix}_*`
    /// environment variables, in that ascending order of precedence.
    pub fn load(&self) -> figment::Result<T> {
        Figment::from(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_name))
            .merge(Env::prefixed(self.env_prefix).split("__"))
            .extract()
    }
}

/// Wraps a `humantime`-parseable duration in config so `3s`/`10s` read the
/// way the spec's interval table (§6) writes them, while storing a plain
/// `Duration` for use at runtime.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HumanDuration(#[serde(with = "humantime_serde")] pub Duration);

impl From<HumanDuration> for Duration {
    fn from(value: HumanDuration) -> Self {
        value.0
    }
}

/// Connection and naming config for the registry (etcd) and blob store
/// (MinIO), shared verbatim between the coordinator and every worker
///.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfraConfig {
    pub etcd_endpoints: Vec<String>,
    pub meta_root_path: String,
    pub kv_root_path: String,
    pub minio_address: String,
    pub minio_access_key_id: String,
    pub minio_secret_access_key: String,
    pub minio_use_ssl: bool,
    pub minio_bucket_name: String,
    /// Bounded retry budget while waiting for etcd/MinIO to become
    /// reachable during startup.
    pub registry_init_retries: u32,
}

impl Default for InfraConfig {
    fn default() -> Self {
        Self {
            etcd_endpoints: vec!["127.0.0.1:2379".to_string()],
            meta_root_path: "by-dev/meta".to_string(),
            kv_root_path: "by-dev/kv".to_string(),
            minio_address: "127.0.0.1:9000".to_string(),
            minio_access_key_id: "minioadmin".to_string(),
            minio_secret_access_key: "minioadmin".to_string(),
            minio_use_ssl: false,
            minio_bucket_name: "index-build".to_string(),
            registry_init_retries: 300,
        }
    }
}

/// Coordinator-only timing and admission-control knobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub infra: InfraConfig,
    pub address: String,
    /// Interval of the assign loop (C5). Default `3s`.
    pub assign_task_interval: HumanDuration,
    /// Interval of the recycle loop (C7). Default `10s`.
    pub recycle_interval: HumanDuration,
    /// Time an admitted request may wait in the admission queue before
    /// `EnqueueTimeout` is returned. Default `10s`.
    pub req_timeout_interval: HumanDuration,
    /// Max tasks assigned per assign-loop tick.
    pub task_limit: usize,
    /// Admission queue bound.
    pub admission_queue_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            infra: InfraConfig::default(),
            address: "0.0.0.0:19530".to_string(),
            assign_task_interval: HumanDuration(Duration::from_secs(3)),
            recycle_interval: HumanDuration(Duration::from_secs(10)),
            req_timeout_interval: HumanDuration(Duration::from_secs(10)),
            task_limit: 20,
            admission_queue_capacity: 1024,
        }
    }
}

impl HasConfigExamples<CoordinatorConfig> for CoordinatorConfig {}

pub fn coordinator_config_loader() -> ConfigLoader<CoordinatorConfig> {
    ConfigLoader::new(Path::new("config/index-coord.toml"), "INDEX_COORD")
}

/// Worker-only config: the node's own identity plus the infra it
/// shares with the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub infra: InfraConfig,
    pub address: String,
    pub node_id: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            infra: InfraConfig::default(),
            address: "0.0.0.0:21123".to_string(),
            node_id: 0,
        }
    }
}

impl HasConfigExamples<NodeConfig> for NodeConfig {}

pub fn node_config_loader() -> ConfigLoader<NodeConfig> {
    ConfigLoader::new(Path::new("config/index-node.toml"), "INDEX_NODE")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinator_config_is_loadable_with_defaults_only() {
        let config = coordinator_config_loader()
            .load()
            .expect("default coordinator config should always load");
        assert_eq!(config.task_limit, 20);
    }

    #[test]
    fn node_config_is_loadable_with_defaults_only() {
        let config = node_config_loader()
            .load()
            .expect("default node config should always load");
        assert_eq!(config.node_id, 0);
    }
}
