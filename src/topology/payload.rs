// SPDX-License-Identifier: Apache-2.0

use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::{ResourceMetrics, metric::Data};
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Traces,
    Metrics,
    Logs,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Traces => "traces",
            SignalKind::Metrics => "metrics",
            SignalKind::Logs => "logs",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait OTLPInto<T> {
    fn otlp_into(self) -> T;
}

impl OTLPInto<Vec<ResourceSpans>> for ExportTraceServiceRequest {
    fn otlp_into(self) -> Vec<ResourceSpans> {
        self.resource_spans
    }
}

impl OTLPInto<Vec<ResourceMetrics>> for ExportMetricsServiceRequest {
    fn otlp_into(self) -> Vec<ResourceMetrics> {
        self.resource_metrics
    }
}

impl OTLPInto<Vec<ResourceLogs>> for ExportLogsServiceRequest {
    fn otlp_into(self) -> Vec<ResourceLogs> {
        self.resource_logs
    }
}

/// A resource-level OTLP record type. Ties the record to its signal, the
/// export messages that carry it, and the unit its volume is counted in.
pub trait Signal: prost::Message + Serialize + Clone + Send + Sync + 'static {
    const KIND: SignalKind;

    type ExportRequest: prost::Message + DeserializeOwned + Default + OTLPInto<Vec<Self>>;
    type ExportResponse: prost::Message + Serialize + Default;

    /// Spans, metric data points or log records held by this resource.
    fn record_count(&self) -> usize;
}

impl Signal for ResourceSpans {
    const KIND: SignalKind = SignalKind::Traces;

    type ExportRequest = ExportTraceServiceRequest;
    type ExportResponse = ExportTraceServiceResponse;

    fn record_count(&self) -> usize {
        self.scope_spans.iter().map(|ss| ss.spans.len()).sum()
    }
}

impl Signal for ResourceMetrics {
    const KIND: SignalKind = SignalKind::Metrics;

    type ExportRequest = ExportMetricsServiceRequest;
    type ExportResponse = ExportMetricsServiceResponse;

    fn record_count(&self) -> usize {
        self.scope_metrics
            .iter()
            .flat_map(|sm| &sm.metrics)
            .map(|m| match &m.data {
                None => 0,
                Some(Data::Gauge(g)) => g.data_points.len(),
                Some(Data::Sum(s)) => s.data_points.len(),
                Some(Data::Histogram(h)) => h.data_points.len(),
                Some(Data::ExponentialHistogram(e)) => e.data_points.len(),
                Some(Data::Summary(s)) => s.data_points.len(),
            })
            .sum()
    }
}

impl Signal for ResourceLogs {
    const KIND: SignalKind = SignalKind::Logs;

    type ExportRequest = ExportLogsServiceRequest;
    type ExportResponse = ExportLogsServiceResponse;

    fn record_count(&self) -> usize {
        self.scope_logs.iter().map(|sl| sl.log_records.len()).sum()
    }
}

/// Request headers or gRPC metadata captured alongside a batch. Keys are
/// lowercase.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    entries: HashMap<String, String>,
}

impl RequestMetadata {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(&key.to_lowercase())
    }

    pub fn entries(&self) -> &HashMap<String, String> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The resources decoded from one export request.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryBatch<T> {
    metadata: Option<RequestMetadata>,
    payload: Vec<T>,
}

impl<T: Signal> TelemetryBatch<T> {
    pub fn new(payload: Vec<T>) -> Self {
        Self {
            metadata: None,
            payload,
        }
    }

    pub fn with_metadata(mut self, metadata: Option<RequestMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn kind(&self) -> SignalKind {
        T::KIND
    }

    pub fn metadata(&self) -> Option<&RequestMetadata> {
        self.metadata.as_ref()
    }

    pub fn payload(&self) -> &[T] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<T> {
        self.payload
    }

    /// Number of resources in the batch.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.payload.iter().map(Signal::record_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::{OTLPInto, RequestMetadata, Signal, SignalKind, TelemetryBatch};
    use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
    use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
    use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
    use std::collections::HashMap;
    use utilities::otlp::FakeOTLP;

    #[test]
    fn counts_records_per_signal() {
        let traces: Vec<ResourceSpans> =
            FakeOTLP::trace_service_request_with_spans(2, 3).otlp_into();
        let batch = TelemetryBatch::new(traces);
        assert_eq!(SignalKind::Traces, batch.kind());
        assert_eq!(2, batch.len());
        assert_eq!(6, batch.record_count());

        let metrics: Vec<ResourceMetrics> =
            FakeOTLP::metrics_service_request_with_metrics(1, 4).otlp_into();
        assert_eq!(4, TelemetryBatch::new(metrics).record_count());

        let logs: Vec<ResourceLogs> = FakeOTLP::logs_service_request_with_logs(3, 2).otlp_into();
        assert_eq!(6, TelemetryBatch::new(logs).record_count());

        assert_eq!(0, ResourceSpans::default().record_count());
    }

    #[test]
    fn metadata_lookup_is_case_insensitive() {
        let md = RequestMetadata::new(HashMap::from([(
            "x-tenant-id".to_string(),
            "tenant-a".to_string(),
        )]));
        let batch = TelemetryBatch::<ResourceLogs>::new(vec![]).with_metadata(Some(md));

        let md = batch.metadata().unwrap();
        assert_eq!(Some(&"tenant-a".to_string()), md.get("X-Tenant-Id"));
        assert_eq!(None, md.get("x-other"));
        assert!(batch.is_empty());
    }
}
