// SPDX-License-Identifier: Apache-2.0

use crate::init::parse::{EndpointParseError, parse_endpoint};
use crate::receivers::otlp::{GrpcSettings, HttpSettings, ReceiverSettings, route_path};
use crate::topology::consumer::ConsumerSet;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_HTTP_ENDPOINT: &str = "0.0.0.0:4318";
pub const DEFAULT_GRPC_ENDPOINT: &str = "0.0.0.0:4317";

pub const DEFAULT_TRACES_URL_PATH: &str = "/v1/traces";
pub const DEFAULT_METRICS_URL_PATH: &str = "/v1/metrics";
pub const DEFAULT_LOGS_URL_PATH: &str = "/v1/logs";

// 20MiB matches collector limit:
// https://github.com/open-telemetry/opentelemetry-collector/blob/main/config/confighttp/README.md
pub const DEFAULT_MAX_REQUEST_BODY_SIZE: usize = 20 * 1024 * 1024;
pub const DEFAULT_GRPC_MAX_RECV_MSG_SIZE_MIB: usize = 4;
pub const MAX_GRPC_RECV_MSG_SIZE_MIB: usize = 2048;

pub const ENV_PREFIX: &str = "OTLP_RECEIVER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one of the http or grpc transports must be configured")]
    NoTransports,

    #[error("{field}: invalid endpoint `{value}`: {source}")]
    InvalidEndpoint {
        field: &'static str,
        value: String,
        #[source]
        source: EndpointParseError,
    },

    #[error("{field}: url path must not be empty")]
    EmptyUrlPath { field: &'static str },

    #[error("{field}: url path `{path}` is already used by {other}")]
    DuplicateUrlPath {
        field: &'static str,
        other: &'static str,
        path: String,
    },

    #[error("{field}: must be greater than zero")]
    ZeroLimit { field: &'static str },

    #[error("{field}: must be at most {max}")]
    LimitTooLarge { field: &'static str, max: usize },

    #[error("configuration file {0} does not exist")]
    MissingFile(PathBuf),

    #[error("unable to load configuration: {0}")]
    Extract(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Extract(Box::new(e))
    }
}

/// Receiver arguments as written in configuration. Consumers are not part of
/// the configuration document and are attached through `output`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Arguments {
    pub http: Option<HttpArguments>,
    pub grpc: Option<GrpcArguments>,
    pub debug_metrics: DebugMetricsArguments,

    #[serde(skip)]
    pub output: ConsumerSet,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpArguments {
    pub endpoint: String,
    pub traces_url_path: String,
    pub metrics_url_path: String,
    pub logs_url_path: String,
    pub max_request_body_size: usize,
    pub include_metadata: bool,
    pub headers_to_include: Vec<String>,
}

impl Default for HttpArguments {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_HTTP_ENDPOINT.to_string(),
            traces_url_path: DEFAULT_TRACES_URL_PATH.to_string(),
            metrics_url_path: DEFAULT_METRICS_URL_PATH.to_string(),
            logs_url_path: DEFAULT_LOGS_URL_PATH.to_string(),
            max_request_body_size: DEFAULT_MAX_REQUEST_BODY_SIZE,
            include_metadata: false,
            headers_to_include: vec![],
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GrpcArguments {
    pub endpoint: String,
    pub max_recv_msg_size_mib: usize,
    pub include_metadata: bool,
    pub metadata_keys_to_include: Vec<String>,
}

impl Default for GrpcArguments {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_GRPC_ENDPOINT.to_string(),
            max_recv_msg_size_mib: DEFAULT_GRPC_MAX_RECV_MSG_SIZE_MIB,
            include_metadata: false,
            metadata_keys_to_include: vec![],
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DebugMetricsArguments {
    pub disable_high_cardinality_metrics: bool,
}

impl Default for DebugMetricsArguments {
    fn default() -> Self {
        Self {
            disable_high_cardinality_metrics: true,
        }
    }
}

impl Arguments {
    pub fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        Ok(figment.extract()?)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(&Figment::from(Toml::string(toml)))
    }

    /// Loads an optional TOML file, then overlays `OTLP_RECEIVER_` environment
    /// variables where `__` separates nested keys
    /// (`OTLP_RECEIVER_HTTP__ENDPOINT`).
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::MissingFile(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Self::from_figment(&figment)
    }

    pub fn with_output(mut self, output: ConsumerSet) -> Self {
        self.output = output;
        self
    }

    pub fn debug_metrics_config(&self) -> DebugMetricsArguments {
        self.debug_metrics
    }

    /// Validates the arguments and produces transport settings. Does not
    /// touch the network and leaves `self` unchanged.
    pub fn convert(&self) -> Result<ReceiverSettings, ConfigError> {
        if self.http.is_none() && self.grpc.is_none() {
            return Err(ConfigError::NoTransports);
        }

        Ok(ReceiverSettings {
            http: self.http.as_ref().map(HttpArguments::convert).transpose()?,
            grpc: self.grpc.as_ref().map(GrpcArguments::convert).transpose()?,
            disable_high_cardinality_metrics: self.debug_metrics.disable_high_cardinality_metrics,
        })
    }
}

impl HttpArguments {
    fn convert(&self) -> Result<HttpSettings, ConfigError> {
        let endpoint = convert_endpoint("http.endpoint", &self.endpoint)?;

        let paths = [
            ("http.traces_url_path", &self.traces_url_path),
            ("http.metrics_url_path", &self.metrics_url_path),
            ("http.logs_url_path", &self.logs_url_path),
        ];
        for (i, &(field, path)) in paths.iter().enumerate() {
            if path.trim().is_empty() {
                return Err(ConfigError::EmptyUrlPath { field });
            }
            if let Some(&(other, _)) = paths[..i]
                .iter()
                .find(|(_, prev)| route_path(prev) == route_path(path))
            {
                return Err(ConfigError::DuplicateUrlPath {
                    field,
                    other,
                    path: path.to_string(),
                });
            }
        }

        if self.max_request_body_size == 0 {
            return Err(ConfigError::ZeroLimit {
                field: "http.max_request_body_size",
            });
        }

        Ok(HttpSettings {
            endpoint,
            traces_url_path: self.traces_url_path.clone(),
            metrics_url_path: self.metrics_url_path.clone(),
            logs_url_path: self.logs_url_path.clone(),
            max_request_body_size: self.max_request_body_size,
            include_metadata: self.include_metadata,
            headers_to_include: lowercase_keys(&self.headers_to_include),
        })
    }
}

impl GrpcArguments {
    fn convert(&self) -> Result<GrpcSettings, ConfigError> {
        let endpoint = convert_endpoint("grpc.endpoint", &self.endpoint)?;

        let field = "grpc.max_recv_msg_size_mib";
        if self.max_recv_msg_size_mib == 0 {
            return Err(ConfigError::ZeroLimit { field });
        }
        let max_recv_msg_size = self
            .max_recv_msg_size_mib
            .checked_mul(1024 * 1024)
            .filter(|_| self.max_recv_msg_size_mib <= MAX_GRPC_RECV_MSG_SIZE_MIB)
            .ok_or(ConfigError::LimitTooLarge {
                field,
                max: MAX_GRPC_RECV_MSG_SIZE_MIB,
            })?;

        Ok(GrpcSettings {
            endpoint,
            max_recv_msg_size,
            include_metadata: self.include_metadata,
            metadata_keys_to_include: lowercase_keys(&self.metadata_keys_to_include),
        })
    }
}

fn convert_endpoint(
    field: &'static str,
    value: &str,
) -> Result<crate::listener::Endpoint, ConfigError> {
    parse_endpoint(value).map_err(|source| ConfigError::InvalidEndpoint {
        field,
        value: value.to_string(),
        source,
    })
}

fn lowercase_keys(keys: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys.iter().map(|k| k.trim().to_lowercase()) {
        if !key.is_empty() && !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::Endpoint;
    use tokio_test::{assert_err, assert_ok};

    fn parse(toml: &str) -> Arguments {
        assert_ok!(Arguments::from_toml_str(toml))
    }

    #[test]
    fn grpc_only() {
        let args = parse(
            r#"
            [grpc]
            endpoint = "/v1/traces"
            "#,
        );

        assert!(args.http.is_none());
        let settings = assert_ok!(args.convert());
        assert!(settings.http.is_none());

        let grpc = settings.grpc.unwrap();
        assert_eq!(Endpoint::Unix(PathBuf::from("/v1/traces")), grpc.endpoint);
        assert_eq!(4 * 1024 * 1024, grpc.max_recv_msg_size);
    }

    #[test]
    fn http_default_paths() {
        let args = parse(
            r#"
            [http]
            "#,
        );

        let http = assert_ok!(args.convert()).http.unwrap();
        assert_eq!("/v1/traces", http.traces_url_path);
        assert_eq!("/v1/metrics", http.metrics_url_path);
        assert_eq!("/v1/logs", http.logs_url_path);
        assert_eq!(Endpoint::tcp("0.0.0.0", 4318), http.endpoint);
        assert_eq!(DEFAULT_MAX_REQUEST_BODY_SIZE, http.max_request_body_size);
    }

    #[test]
    fn http_custom_paths_kept_literally() {
        let args = parse(
            r#"
            [http]
            traces_url_path = "custom/traces"
            metrics_url_path = "custom/metrics"
            logs_url_path = "custom/logs"
            "#,
        );

        let http = assert_ok!(args.convert()).http.unwrap();
        assert_eq!("custom/traces", http.traces_url_path);
        assert_eq!("custom/metrics", http.metrics_url_path);
        assert_eq!("custom/logs", http.logs_url_path);
    }

    #[test]
    fn no_transports() {
        let args = parse("");
        assert!(matches!(
            assert_err!(args.convert()),
            ConfigError::NoTransports
        ));

        let args = parse(
            r#"
            [debug_metrics]
            disable_high_cardinality_metrics = false
            "#,
        );
        assert!(matches!(
            assert_err!(args.convert()),
            ConfigError::NoTransports
        ));
    }

    #[test]
    fn debug_metrics_config() {
        let cases = [
            ("", true),
            ("disable_high_cardinality_metrics = false", false),
            ("disable_high_cardinality_metrics = true", true),
        ];

        for (debug_metrics, expected) in cases {
            let args = parse(&format!(
                r#"
                [grpc]
                endpoint = "/v1/traces"

                [debug_metrics]
                {debug_metrics}
                "#
            ));

            assert_eq!(
                DebugMetricsArguments {
                    disable_high_cardinality_metrics: expected,
                },
                args.debug_metrics_config()
            );
            let settings = assert_ok!(args.convert());
            assert_eq!(expected, settings.disable_high_cardinality_metrics);
        }
    }

    #[test]
    fn debug_metrics_default_without_block() {
        let args = parse(
            r#"
            [grpc]
            "#,
        );
        assert!(args.debug_metrics_config().disable_high_cardinality_metrics);
    }

    #[test]
    fn invalid_endpoints_name_the_field() {
        let args = parse(
            r#"
            [http]
            endpoint = "localhost"
            "#,
        );
        let err = assert_err!(args.convert());
        assert_eq!(
            "http.endpoint: invalid endpoint `localhost`: missing port in `localhost`",
            err.to_string()
        );

        let args = parse(
            r#"
            [grpc]
            endpoint = "localhost:70000"
            "#,
        );
        assert!(matches!(
            assert_err!(args.convert()),
            ConfigError::InvalidEndpoint {
                field: "grpc.endpoint",
                ..
            }
        ));
    }

    #[test]
    fn url_paths_must_be_set_and_distinct() {
        let args = parse(
            r#"
            [http]
            metrics_url_path = ""
            "#,
        );
        assert!(matches!(
            assert_err!(args.convert()),
            ConfigError::EmptyUrlPath {
                field: "http.metrics_url_path"
            }
        ));

        let args = parse(
            r#"
            [http]
            traces_url_path = "/v1/otlp"
            logs_url_path = "v1/otlp"
            "#,
        );
        let err = assert_err!(args.convert());
        assert_eq!(
            "http.logs_url_path: url path `v1/otlp` is already used by http.traces_url_path",
            err.to_string()
        );
    }

    #[test]
    fn limits_must_be_positive() {
        let args = parse(
            r#"
            [grpc]
            max_recv_msg_size_mib = 0
            "#,
        );
        assert!(matches!(
            assert_err!(args.convert()),
            ConfigError::ZeroLimit { .. }
        ));
    }

    #[test]
    fn grpc_message_size_is_capped() {
        let args = parse(
            r#"
            [grpc]
            endpoint = "127.0.0.1:0"
            max_recv_msg_size_mib = 2048
            "#,
        );
        let grpc = assert_ok!(args.convert()).grpc.unwrap();
        assert_eq!(2048 * 1024 * 1024, grpc.max_recv_msg_size);

        for mib in ["2049", "17592186044416"] {
            let args = parse(&format!(
                "[grpc]\nendpoint = \"127.0.0.1:0\"\nmax_recv_msg_size_mib = {mib}"
            ));
            let err = assert_err!(args.convert());
            assert_eq!(
                "grpc.max_recv_msg_size_mib: must be at most 2048",
                err.to_string()
            );
        }
    }

    #[test]
    fn conversion_is_repeatable() {
        let args = parse(
            r#"
            [http]
            endpoint = "localhost:0"
            headers_to_include = ["X-Tenant-Id", "x-tenant-id", "X-Source"]
            include_metadata = true

            [grpc]
            endpoint = "localhost:0"
            "#,
        );

        let first = assert_ok!(args.convert());
        let second = assert_ok!(args.convert());
        assert_eq!(first, second);
        assert_eq!(
            vec!["x-tenant-id".to_string(), "x-source".to_string()],
            first.http.unwrap().headers_to_include
        );
        assert_eq!(Some("localhost:0".to_string()), args.http.map(|h| h.endpoint));
    }

    #[test]
    fn wrong_value_type_fails_extraction() {
        let err = assert_err!(Arguments::from_toml_str(
            r#"
            [grpc]
            max_recv_msg_size_mib = "large"
            "#
        ));
        assert!(matches!(err, ConfigError::Extract(_)));
    }

    #[test]
    fn environment_overrides_config_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "receiver.toml",
                r#"
                [http]
                endpoint = "127.0.0.1:4318"
                traces_url_path = "/ingest/traces"
                "#,
            )?;
            jail.set_env("OTLP_RECEIVER_HTTP__ENDPOINT", "127.0.0.1:9318");
            jail.set_env("OTLP_RECEIVER_GRPC__MAX_RECV_MSG_SIZE_MIB", "8");

            let args = Arguments::load(Some(Path::new("receiver.toml")))
                .map_err(|e| e.to_string())?;
            let settings = args.convert().map_err(|e| e.to_string())?;

            let http = settings.http.unwrap();
            assert_eq!(Endpoint::tcp("127.0.0.1", 9318), http.endpoint);
            assert_eq!("/ingest/traces", http.traces_url_path);

            let grpc = settings.grpc.unwrap();
            assert_eq!(Endpoint::tcp("0.0.0.0", 4317), grpc.endpoint);
            assert_eq!(8 * 1024 * 1024, grpc.max_recv_msg_size);
            Ok(())
        });
    }

    #[test]
    fn missing_config_file() {
        let err = assert_err!(Arguments::load(Some(Path::new(
            "/nonexistent/otlp-receiver.toml"
        ))));
        assert!(matches!(err, ConfigError::MissingFile(_)));
    }
}
