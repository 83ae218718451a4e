// SPDX-License-Identifier: Apache-2.0

use crate::receivers::get_meter;
use crate::topology::payload::SignalKind;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use std::net::SocketAddr;

#[derive(Clone)]
pub(crate) struct SignalCounters {
    accepted: Counter<u64>,
    refused: Counter<u64>,
}

/// Accepted/refused record counters shared by both transports.
#[derive(Clone)]
pub(crate) struct ReceiverCounters {
    traces: SignalCounters,
    metrics: SignalCounters,
    logs: SignalCounters,
    protocol: &'static str,
    include_peer: bool,
}

impl ReceiverCounters {
    pub(crate) fn new(protocol: &'static str, disable_high_cardinality_metrics: bool) -> Self {
        Self {
            traces: SignalCounters::new("spans", "spans"),
            metrics: SignalCounters::new("metric_points", "metric points"),
            logs: SignalCounters::new("log_records", "log records"),
            protocol,
            include_peer: !disable_high_cardinality_metrics,
        }
    }

    pub(crate) fn accepted(&self, kind: SignalKind, count: usize, peer: Option<SocketAddr>) {
        self.signal(kind)
            .accepted
            .add(count as u64, &self.tags(peer));
    }

    pub(crate) fn refused(&self, kind: SignalKind, count: usize, peer: Option<SocketAddr>) {
        self.signal(kind).refused.add(count as u64, &self.tags(peer));
    }

    fn signal(&self, kind: SignalKind) -> &SignalCounters {
        match kind {
            SignalKind::Traces => &self.traces,
            SignalKind::Metrics => &self.metrics,
            SignalKind::Logs => &self.logs,
        }
    }

    // net.peer.addr is unbounded, so it is only attached on request
    fn tags(&self, peer: Option<SocketAddr>) -> Vec<KeyValue> {
        let mut tags = vec![KeyValue::new("protocol", self.protocol)];
        if let (true, Some(peer)) = (self.include_peer, peer) {
            tags.push(KeyValue::new("net.peer.addr", peer.ip().to_string()));
        }
        tags
    }
}

impl SignalCounters {
    fn new(unit: &'static str, description: &str) -> Self {
        Self {
            accepted: get_meter()
                .u64_counter(format!("otlp_receiver_accepted_{unit}"))
                .with_description(format!(
                    "Number of {description} successfully delivered to all consumers."
                ))
                .with_unit(unit)
                .build(),
            refused: get_meter()
                .u64_counter(format!("otlp_receiver_refused_{unit}"))
                .with_description(format!(
                    "Number of {description} that could not be delivered to consumers."
                ))
                .with_unit(unit)
                .build(),
        }
    }
}
