use chrono::Utc;
use opentelemetry_proto::tonic::collector::logs::v1::ExportLogsServiceRequest;
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value::StringValue;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::logs::v1::{LogRecord, ResourceLogs, ScopeLogs};
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value;
use opentelemetry_proto::tonic::metrics::v1::{
    Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span, Status};
use std::collections::HashMap;

const SCHEMA_URL: &str = "https://opentelemetry.io/schemas/1.21.0";

/// Builders for export requests used throughout the receiver tests.
pub struct FakeOTLP;

impl FakeOTLP {
    pub fn trace_service_request() -> ExportTraceServiceRequest {
        Self::trace_service_request_with_spans(1, 1)
    }

    pub fn trace_service_request_with_spans(
        num_res_spans: usize,
        num_spans: usize,
    ) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: (0..num_res_spans)
                .map(|_| Self::resource_spans(num_spans))
                .collect(),
        }
    }

    pub fn metrics_service_request() -> ExportMetricsServiceRequest {
        Self::metrics_service_request_with_metrics(1, 1)
    }

    pub fn metrics_service_request_with_metrics(
        num_res_metrics: usize,
        num_metrics: usize,
    ) -> ExportMetricsServiceRequest {
        ExportMetricsServiceRequest {
            resource_metrics: (0..num_res_metrics)
                .map(|_| Self::resource_metrics(num_metrics))
                .collect(),
        }
    }

    pub fn logs_service_request() -> ExportLogsServiceRequest {
        Self::logs_service_request_with_logs(1, 1)
    }

    pub fn logs_service_request_with_logs(
        num_res_logs: usize,
        num_logs: usize,
    ) -> ExportLogsServiceRequest {
        ExportLogsServiceRequest {
            resource_logs: (0..num_res_logs)
                .map(|_| Self::resource_logs(num_logs))
                .collect(),
        }
    }

    /// Headers a client might attach to an export, keyed by lowercase name.
    pub fn example_headers() -> HashMap<String, String> {
        HashMap::from([
            ("x-tenant-id".to_string(), "tenant-a".to_string()),
            ("x-request-source".to_string(), "integration".to_string()),
        ])
    }

    pub fn resource_spans(num_spans: usize) -> ResourceSpans {
        ResourceSpans {
            resource: Some(Self::resource()),
            scope_spans: vec![ScopeSpans {
                scope: Some(InstrumentationScope {
                    name: "scope".to_string(),
                    version: "0.0.1".to_string(),
                    attributes: vec![string_attr("module", "api")],
                    dropped_attributes_count: 0,
                }),
                spans: Self::trace_spans(num_spans),
                schema_url: SCHEMA_URL.to_string(),
            }],
            schema_url: SCHEMA_URL.to_string(),
        }
    }

    pub fn resource_metrics(num_metrics: usize) -> ResourceMetrics {
        let now_ns = now_ns();
        let metrics = (0..num_metrics)
            .map(|i| Metric {
                name: format!("test-metric-{i}"),
                description: "An example OTLP Metric".to_string(),
                unit: "".to_string(),
                metadata: vec![],
                data: Some(Data::Gauge(Gauge {
                    data_points: vec![NumberDataPoint {
                        attributes: vec![],
                        start_time_unix_nano: now_ns,
                        time_unix_nano: now_ns,
                        exemplars: vec![],
                        flags: 0,
                        value: Some(Value::AsDouble(100.0)),
                    }],
                })),
            })
            .collect();

        ResourceMetrics {
            resource: Some(Self::resource()),
            scope_metrics: vec![ScopeMetrics {
                scope: None,
                metrics,
                schema_url: SCHEMA_URL.to_string(),
            }],
            schema_url: SCHEMA_URL.to_string(),
        }
    }

    pub fn resource_logs(num_logs: usize) -> ResourceLogs {
        let now_ns = now_ns();
        let log_records = (0..num_logs)
            .map(|_| LogRecord {
                time_unix_nano: now_ns,
                observed_time_unix_nano: now_ns,
                severity_number: 13,
                severity_text: "WARNING".to_string(),
                body: Some(AnyValue {
                    value: Some(StringValue("disk usage above threshold".to_string())),
                }),
                attributes: vec![string_attr("mount", "/var")],
                dropped_attributes_count: 0,
                flags: 0,
                trace_id: vec![],
                span_id: vec![],
                event_name: "".to_string(),
            })
            .collect();

        ResourceLogs {
            resource: Some(Self::resource()),
            scope_logs: vec![ScopeLogs {
                scope: None,
                log_records,
                schema_url: SCHEMA_URL.to_string(),
            }],
            schema_url: SCHEMA_URL.to_string(),
        }
    }

    pub fn trace_spans(num_spans: usize) -> Vec<Span> {
        let start_ns = now_ns();
        (0..num_spans)
            .map(|i| Span {
                trace_id: vec![1; 16],
                span_id: vec![2, 2, 2, 2, 2, 2, 2, (i % 256) as u8],
                trace_state: "".to_string(),
                parent_span_id: vec![],
                flags: 0,
                name: "GET /items".to_string(),
                kind: SpanKind::Server.into(),
                start_time_unix_nano: start_ns,
                end_time_unix_nano: start_ns + 1_000_000,
                attributes: vec![
                    string_attr("http.request.method", "GET"),
                    string_attr("url.path", "/items"),
                ],
                dropped_attributes_count: 0,
                events: vec![],
                dropped_events_count: 0,
                links: vec![],
                dropped_links_count: 0,
                status: Some(Status::default()),
            })
            .collect()
    }

    fn resource() -> Resource {
        Resource {
            attributes: vec![
                string_attr("service.name", "test-service"),
                string_attr("telemetry.sdk.name", "opentelemetry"),
                string_attr("host.name", "receiver-test-host"),
            ],
            dropped_attributes_count: 0,
        }
    }
}

pub fn string_attr(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(StringValue(value.to_string())),
        }),
    }
}

fn now_ns() -> u64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64
}
