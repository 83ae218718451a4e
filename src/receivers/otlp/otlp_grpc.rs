// SPDX-License-Identifier: Apache-2.0

use crate::init::config::DEFAULT_GRPC_MAX_RECV_MSG_SIZE_MIB;
use crate::listener::{Incoming, Listener};
use crate::receivers::otlp::counters::ReceiverCounters;
use crate::receivers::otlp::{DEFAULT_SHUTDOWN_GRACE, GrpcSettings, cancel_in_flight_after_grace};
use crate::topology::consumer::ConsumerSet;
use crate::topology::fanout::Fanout;
use crate::topology::payload::{OTLPInto, RequestMetadata, Signal, TelemetryBatch};
use opentelemetry_proto::tonic::collector::logs::v1::logs_service_server::{
    LogsService, LogsServiceServer,
};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_server::{
    MetricsService, MetricsServiceServer,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::TraceServiceServer;
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse, trace_service_server::TraceService,
};
use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::transport::Server;
use tonic::{Request, Response, Status, codec::CompressionEncoding};
use tower::BoxError;
use tracing::{debug, warn};

pub struct OTLPGrpcServerBuilder {
    output: ConsumerSet,
    max_recv_msg_size: usize,
    include_metadata: bool,
    metadata_keys_to_include: Vec<String>,
    shutdown_grace: Duration,
    disable_high_cardinality_metrics: bool,
}

impl Default for OTLPGrpcServerBuilder {
    fn default() -> Self {
        Self {
            output: ConsumerSet::default(),
            max_recv_msg_size: DEFAULT_GRPC_MAX_RECV_MSG_SIZE_MIB * 1024 * 1024,
            include_metadata: false,
            metadata_keys_to_include: vec![],
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            disable_high_cardinality_metrics: true,
        }
    }
}

impl OTLPGrpcServerBuilder {
    pub fn with_settings(self, settings: &GrpcSettings) -> Self {
        self.with_max_recv_msg_size(settings.max_recv_msg_size)
            .with_include_metadata(settings.include_metadata)
            .with_metadata_keys_to_include(settings.metadata_keys_to_include.clone())
    }

    pub fn with_output(mut self, output: ConsumerSet) -> Self {
        self.output = output;
        self
    }

    /// Largest accepted message, in bytes.
    pub fn with_max_recv_msg_size(mut self, max_recv_msg_size: usize) -> Self {
        self.max_recv_msg_size = max_recv_msg_size;
        self
    }

    pub fn with_include_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    pub fn with_metadata_keys_to_include(mut self, keys: Vec<String>) -> Self {
        self.metadata_keys_to_include = keys;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_disable_high_cardinality_metrics(mut self, disable: bool) -> Self {
        self.disable_high_cardinality_metrics = disable;
        self
    }

    pub fn build(self) -> OTLPGrpcServer {
        let metadata_keys = match self.include_metadata {
            true if !self.metadata_keys_to_include.is_empty() => Some(Arc::new(
                self.metadata_keys_to_include
                    .iter()
                    .map(|k| k.to_lowercase())
                    .collect(),
            )),
            _ => None,
        };

        OTLPGrpcServer {
            traces: Arc::new(Fanout::new(self.output.traces)),
            metrics: Arc::new(Fanout::new(self.output.metrics)),
            logs: Arc::new(Fanout::new(self.output.logs)),
            metadata_keys,
            counters: ReceiverCounters::new("grpc", self.disable_high_cardinality_metrics),
            max_recv_msg_size: self.max_recv_msg_size,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

pub struct OTLPGrpcServer {
    traces: Arc<Fanout<ResourceSpans>>,
    metrics: Arc<Fanout<ResourceMetrics>>,
    logs: Arc<Fanout<ResourceLogs>>,
    metadata_keys: Option<Arc<Vec<String>>>,
    counters: ReceiverCounters,
    max_recv_msg_size: usize,
    shutdown_grace: Duration,
}

impl OTLPGrpcServer {
    pub fn builder() -> OTLPGrpcServerBuilder {
        Default::default()
    }

    /// Serves all three OTLP services until `cancellation` fires. Calls still
    /// delivering after the shutdown grace period are cancelled.
    pub async fn serve(
        &self,
        listener: Listener,
        cancellation: CancellationToken,
    ) -> Result<(), BoxError> {
        let in_flight = CancellationToken::new();
        let svc = self.collector_service(in_flight.clone());
        let max_size = self.max_recv_msg_size;

        let router = Server::builder()
            .add_service(
                TraceServiceServer::new(svc.clone())
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip)
                    .max_decoding_message_size(max_size),
            )
            .add_service(
                MetricsServiceServer::new(svc.clone())
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip)
                    .max_decoding_message_size(max_size),
            )
            .add_service(
                LogsServiceServer::new(svc)
                    .accept_compressed(CompressionEncoding::Gzip)
                    .send_compressed(CompressionEncoding::Gzip)
                    .max_decoding_message_size(max_size),
            );

        let shutdown = cancellation.clone().cancelled_owned();
        let serve = async move {
            match listener.into_incoming() {
                Incoming::Tcp(stream) => router.serve_with_incoming_shutdown(stream, shutdown).await,
                Incoming::Unix(stream) => {
                    router.serve_with_incoming_shutdown(stream, shutdown).await
                }
            }
        };

        let watchdog = cancel_in_flight_after_grace(
            "grpc",
            cancellation,
            in_flight,
            self.shutdown_grace,
        );

        tokio::select! {
            res = serve => res.map_err(|e| e.into()),
            _ = watchdog => Ok(()),
        }
    }

    fn collector_service(&self, in_flight: CancellationToken) -> CollectorService {
        CollectorService {
            traces: self.traces.clone(),
            metrics: self.metrics.clone(),
            logs: self.logs.clone(),
            metadata_keys: self.metadata_keys.clone(),
            counters: self.counters.clone(),
            in_flight,
        }
    }
}

#[derive(Clone)]
struct CollectorService {
    traces: Arc<Fanout<ResourceSpans>>,
    metrics: Arc<Fanout<ResourceMetrics>>,
    logs: Arc<Fanout<ResourceLogs>>,
    metadata_keys: Option<Arc<Vec<String>>>,
    counters: ReceiverCounters,
    in_flight: CancellationToken,
}

impl CollectorService {
    async fn forward<T: Signal>(
        &self,
        output: &Fanout<T>,
        request: Request<T::ExportRequest>,
    ) -> Result<Response<T::ExportResponse>, Status> {
        let peer = request.remote_addr();
        let metadata = self
            .metadata_keys
            .as_ref()
            .and_then(|keys| extract_metadata(request.metadata(), keys));

        let batch = TelemetryBatch::new(request.into_inner().otlp_into()).with_metadata(metadata);
        let count = batch.record_count();

        // tonic drops this future when the caller goes away or the deadline
        // passes, which cancels the delivery through the guard
        let cancel = self.in_flight.child_token();
        let guard = cancel.clone().drop_guard();
        let delivered = output.deliver(&cancel, batch).await;
        guard.disarm();

        match delivered {
            Ok(()) => {
                self.counters.accepted(T::KIND, count, peer);
                Ok(Response::new(T::ExportResponse::default()))
            }
            Err(e) => {
                self.counters.refused(T::KIND, count, peer);
                if e.is_cancelled() {
                    debug!(signal = T::KIND.as_str(), "OTLP gRPC delivery cancelled.");
                    Err(Status::cancelled("delivery was cancelled"))
                } else {
                    warn!(
                        error = %e,
                        signal = T::KIND.as_str(),
                        "Failed to deliver OTLP gRPC request."
                    );
                    Err(Status::unavailable(e.to_string()))
                }
            }
        }
    }
}

fn extract_metadata(metadata: &MetadataMap, keys: &[String]) -> Option<RequestMetadata> {
    let found: HashMap<String, String> = keys
        .iter()
        .filter_map(|key| {
            let value = metadata.get(key.as_str())?.to_str().ok()?;
            Some((key.clone(), value.to_string()))
        })
        .collect();

    (!found.is_empty()).then(|| RequestMetadata::new(found))
}

#[tonic::async_trait]
impl TraceService for CollectorService {
    async fn export(
        &self,
        request: Request<ExportTraceServiceRequest>,
    ) -> Result<Response<ExportTraceServiceResponse>, Status> {
        self.forward(&self.traces, request).await
    }
}

#[tonic::async_trait]
impl MetricsService for CollectorService {
    async fn export(
        &self,
        request: Request<ExportMetricsServiceRequest>,
    ) -> Result<Response<ExportMetricsServiceResponse>, Status> {
        self.forward(&self.metrics, request).await
    }
}

#[tonic::async_trait]
impl LogsService for CollectorService {
    async fn export(
        &self,
        request: Request<ExportLogsServiceRequest>,
    ) -> Result<Response<ExportLogsServiceResponse>, Status> {
        self.forward(&self.logs, request).await
    }
}
