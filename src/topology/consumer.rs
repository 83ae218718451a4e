// SPDX-License-Identifier: Apache-2.0

use crate::bounded_channel::{BoundedSender, SendError};
use crate::topology::payload::{Signal, TelemetryBatch};
use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower::BoxError;

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("consume cancelled")]
    Cancelled,

    #[error("consumer is disconnected")]
    Disconnected,

    #[error("consumer rejected batch: {0}")]
    Rejected(BoxError),
}

impl ConsumeError {
    pub fn rejected(reason: impl Into<BoxError>) -> Self {
        ConsumeError::Rejected(reason.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConsumeError::Cancelled)
    }
}

impl From<SendError> for ConsumeError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::Cancelled => ConsumeError::Cancelled,
            SendError::Disconnected => ConsumeError::Disconnected,
        }
    }
}

/// Downstream receiver of decoded batches for one signal.
///
/// Implementations must return [`ConsumeError::Cancelled`] when they stop
/// because `cancel` fired. Returning `Ok` means the batch was taken over.
#[tonic::async_trait]
pub trait Consumer<T: Signal>: Send + Sync {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        batch: TelemetryBatch<T>,
    ) -> Result<(), ConsumeError>;
}

/// Forwards batches into a bounded channel, waiting for capacity.
pub struct ChannelConsumer<T> {
    tx: BoundedSender<TelemetryBatch<T>>,
}

impl<T> ChannelConsumer<T> {
    pub fn new(tx: BoundedSender<TelemetryBatch<T>>) -> Self {
        Self { tx }
    }
}

#[tonic::async_trait]
impl<T: Signal> Consumer<T> for ChannelConsumer<T> {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        batch: TelemetryBatch<T>,
    ) -> Result<(), ConsumeError> {
        self.tx.send_cancellable(batch, cancel).await?;
        Ok(())
    }
}

/// Adapts an async closure into a consumer.
pub struct FnConsumer<F> {
    f: F,
}

impl<F> FnConsumer<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[tonic::async_trait]
impl<T, F, Fut> Consumer<T> for FnConsumer<F>
where
    T: Signal,
    F: Fn(CancellationToken, TelemetryBatch<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ConsumeError>> + Send,
{
    async fn consume(
        &self,
        cancel: &CancellationToken,
        batch: TelemetryBatch<T>,
    ) -> Result<(), ConsumeError> {
        (self.f)(cancel.clone(), batch).await
    }
}

pub type TracesConsumer = Arc<dyn Consumer<ResourceSpans>>;
pub type MetricsConsumer = Arc<dyn Consumer<ResourceMetrics>>;
pub type LogsConsumer = Arc<dyn Consumer<ResourceLogs>>;

/// Consumers registered per signal, in delivery order.
#[derive(Clone, Default)]
pub struct ConsumerSet {
    pub traces: Vec<TracesConsumer>,
    pub metrics: Vec<MetricsConsumer>,
    pub logs: Vec<LogsConsumer>,
}

impl ConsumerSet {
    pub fn with_traces(mut self, consumer: TracesConsumer) -> Self {
        self.traces.push(consumer);
        self
    }

    pub fn with_metrics(mut self, consumer: MetricsConsumer) -> Self {
        self.metrics.push(consumer);
        self
    }

    pub fn with_logs(mut self, consumer: LogsConsumer) -> Self {
        self.logs.push(consumer);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty() && self.metrics.is_empty() && self.logs.is_empty()
    }
}

impl fmt::Debug for ConsumerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSet")
            .field("traces", &self.traces.len())
            .field("metrics", &self.metrics.len())
            .field("logs", &self.logs.len())
            .finish()
    }
}
