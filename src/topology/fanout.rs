// SPDX-License-Identifier: Apache-2.0

use crate::topology::consumer::{ConsumeError, Consumer};
use crate::topology::payload::{Signal, TelemetryBatch};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Delivers every batch of one signal to all of its registered consumers.
///
/// Consumers are called sequentially in registration order. The batch is
/// cloned for all consumers except the last one, which receives the original.
/// Each call is raced against the cancellation token, and delivery stops at
/// the first consumer error or cancellation. There is no buffering or retry;
/// a failed delivery is reported to the caller, who is expected to resend.
///
/// With no consumers registered, delivery succeeds immediately and the batch
/// is dropped.
///
/// # Example
///
/// ```rust
/// use otlp_receiver::bounded_channel::bounded;
/// use otlp_receiver::topology::consumer::ChannelConsumer;
/// use otlp_receiver::topology::fanout::Fanout;
/// use otlp_receiver::topology::payload::TelemetryBatch;
/// use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let (tx1, mut rx1) = bounded::<TelemetryBatch<ResourceSpans>>(10);
///     let (tx2, mut rx2) = bounded::<TelemetryBatch<ResourceSpans>>(10);
///
///     let fanout: Fanout<ResourceSpans> = Fanout::new(vec![
///         Arc::new(ChannelConsumer::new(tx1)),
///         Arc::new(ChannelConsumer::new(tx2)),
///     ]);
///
///     let batch = TelemetryBatch::new(vec![ResourceSpans::default()]);
///     fanout.deliver(&CancellationToken::new(), batch.clone()).await?;
///
///     assert_eq!(Some(batch.clone()), rx1.next().await);
///     assert_eq!(Some(batch), rx2.next().await);
///     Ok(())
/// }
/// ```
pub struct Fanout<T> {
    consumers: Vec<Arc<dyn Consumer<T>>>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery cancelled")]
    Cancelled,

    #[error("consumer {index} failed: {source}")]
    ConsumerFailed {
        index: usize,
        #[source]
        source: ConsumeError,
    },
}

impl DeliveryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeliveryError::Cancelled)
    }
}

impl<T: Signal> Fanout<T> {
    pub fn new(consumers: Vec<Arc<dyn Consumer<T>>>) -> Self {
        Self { consumers }
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub async fn deliver(
        &self,
        cancel: &CancellationToken,
        batch: TelemetryBatch<T>,
    ) -> Result<(), DeliveryError> {
        let Some((last, rest)) = self.consumers.split_last() else {
            return Ok(());
        };

        for (index, consumer) in rest.iter().enumerate() {
            deliver_one(index, consumer.as_ref(), cancel, batch.clone()).await?;
        }
        deliver_one(rest.len(), last.as_ref(), cancel, batch).await
    }
}

async fn deliver_one<T: Signal>(
    index: usize,
    consumer: &dyn Consumer<T>,
    cancel: &CancellationToken,
    batch: TelemetryBatch<T>,
) -> Result<(), DeliveryError> {
    if cancel.is_cancelled() {
        return Err(DeliveryError::Cancelled);
    }

    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
        res = consumer.consume(cancel, batch) => match res {
            Ok(()) => Ok(()),
            Err(ConsumeError::Cancelled) => Err(DeliveryError::Cancelled),
            Err(source) => Err(DeliveryError::ConsumerFailed { index, source }),
        },
    }
}
