// SPDX-License-Identifier: Apache-2.0

use crate::topology::consumer::{ConsumeError, Consumer};
use crate::topology::payload::{Signal, TelemetryBatch};
use tokio_util::sync::CancellationToken;
use tracing::{Level, event};

// Modeled on the collector's debug exporter. Basic logs one summary line per
// batch, Detailed also dumps the resources as JSON.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugVerbosity {
    Basic,
    Detailed,
}

/// Consumer that logs every batch it receives and always accepts it.
#[derive(Clone, Debug)]
pub struct DebugLogConsumer {
    verbosity: DebugVerbosity,
}

impl DebugLogConsumer {
    pub fn new(verbosity: DebugVerbosity) -> Self {
        Self { verbosity }
    }

    fn log_basic<T: Signal>(&self, batch: &TelemetryBatch<T>) {
        event!(
            Level::INFO,
            data_type = batch.kind().as_str(),
            resources = batch.len(),
            records = batch.record_count(),
            metadata_keys = batch.metadata().map(|md| md.len()).unwrap_or(0),
            "Received {}.",
            batch.kind()
        );
    }

    fn log_detailed<T: Signal>(&self, batch: &TelemetryBatch<T>) {
        match serde_json::to_string(batch.payload()) {
            Ok(contents) => event!(
                Level::INFO,
                data_type = batch.kind().as_str(),
                contents = %contents,
                "Batch contents"
            ),
            Err(e) => event!(
                Level::WARN,
                data_type = batch.kind().as_str(),
                error = %e,
                "Unable to render batch contents"
            ),
        }
    }
}

#[tonic::async_trait]
impl<T: Signal> Consumer<T> for DebugLogConsumer {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        batch: TelemetryBatch<T>,
    ) -> Result<(), ConsumeError> {
        if cancel.is_cancelled() {
            return Err(ConsumeError::Cancelled);
        }

        self.log_basic(&batch);
        if self.verbosity == DebugVerbosity::Detailed {
            self.log_detailed(&batch);
        }
        Ok(())
    }
}
