// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only configuration contract for the router, plus a concrete value
//! type for embedders and tests. Loading, reloading, and validation live
//! with the embedding process; the router only reads.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};

/// gRPC server tuning knobs, passed through to the tonic server builder.
#[derive(Debug, Clone, Copy)]
pub struct GrpcServerParameters {
    pub max_send_msg_size: usize,
    pub max_recv_msg_size: usize,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
}

/// Default gRPC message size cap (~5 MB).
pub const GRPC_MESSAGE_SIZE_MAX: usize = 5_000_000;

impl Default for GrpcServerParameters {
    fn default() -> Self {
        GrpcServerParameters {
            max_send_msg_size: GRPC_MESSAGE_SIZE_MAX,
            max_recv_msg_size: GRPC_MESSAGE_SIZE_MAX,
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(20),
        }
    }
}

/// Provenance of the currently loaded configuration, echoed by the
/// `/query/configmetadata` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigMetadata {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub hash: String,
    pub loaded_at: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no sampler rules for dataset {0:?}")]
    UnknownDataset(String),
}

pub trait Config: Send + Sync {
    /// Address and port for the HTTP listener.
    fn listen_addr(&self) -> String;

    fn grpc_enabled(&self) -> bool;

    /// Address for the gRPC listener; empty disables gRPC even when enabled.
    fn grpc_listen_addr(&self) -> String;

    fn grpc_server_parameters(&self) -> GrpcServerParameters;

    /// Base URL of the upstream API (protocol, hostname, port).
    fn upstream_api(&self) -> String;

    fn is_api_key_valid(&self, key: &str) -> bool;

    /// Token required by the `/query` endpoints; empty keeps them closed.
    fn query_auth_token(&self) -> String;

    fn environment_cache_ttl(&self) -> Duration;

    /// Attribute names scanned, in order, for a trace id.
    fn trace_id_field_names(&self) -> Vec<String>;

    /// Attribute names scanned, in order, for a span id.
    fn span_id_field_names(&self) -> Vec<String>;

    /// Attribute names whose presence marks a span as non-root.
    fn parent_id_field_names(&self) -> Vec<String>;

    /// Sampler rules and sampler name for one dataset.
    fn sampler_rules_for_dataset(&self, dataset: &str) -> Result<(Value, String), ConfigError>;

    /// All sampler rules, including the default, as one document.
    fn all_sampler_rules(&self) -> Value;

    fn config_metadata(&self) -> Vec<ConfigMetadata>;
}

/// A fixed configuration value. Embedders that reload config wrap their own
/// state behind the [`Config`] trait instead.
#[derive(Debug, Clone)]
pub struct StaticConfig {
    pub listen_addr: String,
    pub grpc_enabled: bool,
    pub grpc_listen_addr: String,
    pub grpc_server_parameters: GrpcServerParameters,
    pub upstream_api: String,
    /// Accepted API keys; empty accepts everything.
    pub accept_api_keys: Vec<String>,
    pub query_auth_token: String,
    pub environment_cache_ttl: Duration,
    pub trace_id_field_names: Vec<String>,
    pub span_id_field_names: Vec<String>,
    pub parent_id_field_names: Vec<String>,
    /// Per-dataset sampler rules: dataset name to (sampler name, rules).
    pub samplers: HashMap<String, (String, Value)>,
    pub default_sampler: (String, Value),
    pub config_metadata: Vec<ConfigMetadata>,
}

impl Default for StaticConfig {
    fn default() -> Self {
        StaticConfig {
            listen_addr: "127.0.0.1:8080".to_string(),
            grpc_enabled: false,
            grpc_listen_addr: String::new(),
            grpc_server_parameters: GrpcServerParameters::default(),
            upstream_api: "https://api.honeycomb.io".to_string(),
            accept_api_keys: Vec::new(),
            query_auth_token: String::new(),
            environment_cache_ttl: Duration::from_secs(3600),
            trace_id_field_names: vec!["trace.trace_id".to_string(), "traceId".to_string()],
            span_id_field_names: vec!["trace.span_id".to_string(), "spanId".to_string()],
            parent_id_field_names: vec!["trace.parent_id".to_string(), "parentId".to_string()],
            samplers: HashMap::new(),
            default_sampler: ("DeterministicSampler".to_string(), json!({"SampleRate": 1})),
            config_metadata: Vec::new(),
        }
    }
}

impl Config for StaticConfig {
    fn listen_addr(&self) -> String {
        self.listen_addr.clone()
    }

    fn grpc_enabled(&self) -> bool {
        self.grpc_enabled
    }

    fn grpc_listen_addr(&self) -> String {
        self.grpc_listen_addr.clone()
    }

    fn grpc_server_parameters(&self) -> GrpcServerParameters {
        self.grpc_server_parameters
    }

    fn upstream_api(&self) -> String {
        self.upstream_api.clone()
    }

    fn is_api_key_valid(&self, key: &str) -> bool {
        self.accept_api_keys.is_empty() || self.accept_api_keys.iter().any(|k| k == key)
    }

    fn query_auth_token(&self) -> String {
        self.query_auth_token.clone()
    }

    fn environment_cache_ttl(&self) -> Duration {
        self.environment_cache_ttl
    }

    fn trace_id_field_names(&self) -> Vec<String> {
        self.trace_id_field_names.clone()
    }

    fn span_id_field_names(&self) -> Vec<String> {
        self.span_id_field_names.clone()
    }

    fn parent_id_field_names(&self) -> Vec<String> {
        self.parent_id_field_names.clone()
    }

    fn sampler_rules_for_dataset(&self, dataset: &str) -> Result<(Value, String), ConfigError> {
        let (name, rules) = self
            .samplers
            .get(dataset)
            .unwrap_or(&self.default_sampler);
        Ok((rules.clone(), name.clone()))
    }

    fn all_sampler_rules(&self) -> Value {
        let mut rules = serde_json::Map::new();
        let (default_name, default_rules) = &self.default_sampler;
        rules.insert(
            "__default__".to_string(),
            json!({ default_name.clone(): default_rules }),
        );
        for (dataset, (name, sampler)) in &self.samplers {
            rules.insert(dataset.clone(), json!({ name.clone(): sampler }));
        }
        Value::Object(rules)
    }

    fn config_metadata(&self) -> Vec<ConfigMetadata> {
        self.config_metadata.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_list_accepts_everything() {
        let config = StaticConfig::default();
        assert!(config.is_api_key_valid("anything"));

        let config = StaticConfig {
            accept_api_keys: vec!["k1".to_string()],
            ..StaticConfig::default()
        };
        assert!(config.is_api_key_valid("k1"));
        assert!(!config.is_api_key_valid("k2"));
    }

    #[test]
    fn unknown_dataset_falls_back_to_default_sampler() {
        let config = StaticConfig::default();
        let (rules, name) = config.sampler_rules_for_dataset("nope").unwrap();
        assert_eq!(name, "DeterministicSampler");
        assert_eq!(rules, json!({"SampleRate": 1}));
    }
}
