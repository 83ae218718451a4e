// SPDX-License-Identifier: Apache-2.0

pub mod otlp_grpc;
pub mod otlp_http;
pub mod receiver;

mod counters;

use crate::listener::Endpoint;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// How long in-flight requests may keep delivering after a transport was
/// told to shut down.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Validated receiver configuration, produced by `Arguments::convert`.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverSettings {
    pub http: Option<HttpSettings>,
    pub grpc: Option<GrpcSettings>,
    pub disable_high_cardinality_metrics: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpSettings {
    pub endpoint: Endpoint,
    pub traces_url_path: String,
    pub metrics_url_path: String,
    pub logs_url_path: String,
    pub max_request_body_size: usize,
    pub include_metadata: bool,
    pub headers_to_include: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GrpcSettings {
    pub endpoint: Endpoint,
    /// Largest accepted message, in bytes.
    pub max_recv_msg_size: usize,
    pub include_metadata: bool,
    pub metadata_keys_to_include: Vec<String>,
}

/// Paths are matched with a leading slash, so `custom/traces` and
/// `/custom/traces` route the same way.
pub(crate) fn route_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Cancels `in_flight` once `grace` has passed after `shutdown` fired. Never
/// completes, so it is meant to be raced against the serve future.
pub(crate) async fn cancel_in_flight_after_grace(
    transport: &'static str,
    shutdown: CancellationToken,
    in_flight: CancellationToken,
    grace: Duration,
) {
    shutdown.cancelled().await;
    tokio::time::sleep(grace).await;
    if !in_flight.is_cancelled() {
        warn!(
            transport,
            "Requests still in flight after shutdown grace period, cancelling deliveries."
        );
        in_flight.cancel();
    }
    std::future::pending::<()>().await
}
