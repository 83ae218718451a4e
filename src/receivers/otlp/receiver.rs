// SPDX-License-Identifier: Apache-2.0

use crate::init::config::{Arguments, ConfigError};
use crate::init::wait::{TaskSet, wait_for_tasks_with_timeout};
use crate::listener::{BindError, Endpoint, Listener};
use crate::receivers::otlp::otlp_grpc::OTLPGrpcServer;
use crate::receivers::otlp::otlp_http::OTLPHttpServer;
use crate::receivers::otlp::{DEFAULT_SHUTDOWN_GRACE, ReceiverSettings};
use crate::topology::consumer::ConsumerSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Extra time on top of the shutdown grace for transports to close their
// connections once in-flight deliveries were cancelled.
const STOP_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiverState::Created => "created",
            ReceiverState::Starting => "starting",
            ReceiverState::Running => "running",
            ReceiverState::Stopping => "stopping",
            ReceiverState::Stopped => "stopped",
            ReceiverState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Addresses the running transports actually listen on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BoundEndpoints {
    pub http: Option<Endpoint>,
    pub grpc: Option<Endpoint>,
}

#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("cannot {action} receiver while it is {state}")]
    InvalidState {
        action: &'static str,
        state: ReceiverState,
    },

    #[error("receiver did not shut down cleanly: {error}")]
    Shutdown { error: String },

    #[error("receiver transport exited: {0}")]
    TransportExited(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("receiver not running after {0:?}")]
    Timeout(Duration),

    #[error("receiver failed to start")]
    Failed,

    #[error("receiver state channel closed")]
    Closed,
}

struct Transports {
    generation: u64,
    bound: BoundEndpoints,
    cancel: CancellationToken,
    exited: CancellationToken,
    tasks: TaskSet,
}

/// Owns the HTTP and gRPC transports of one receiver and moves them through
/// the `Created -> Starting -> Running -> Stopping -> Stopped` lifecycle.
///
/// Start, stop and update are serialized. The current state is published on
/// a watch channel so callers can wait for readiness:
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use otlp_receiver::init::config::Arguments;
/// use otlp_receiver::receivers::otlp::receiver::OTLPReceiver;
/// use std::time::Duration;
///
/// let args = Arguments::from_toml_str("[http]\nendpoint = \"127.0.0.1:0\"")?;
/// let receiver = OTLPReceiver::new();
/// let bound = receiver.start(&args).await?;
/// receiver.wait_running(Duration::from_secs(1)).await?;
/// println!("listening on {:?}", bound.http);
/// receiver.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct OTLPReceiver {
    state: watch::Sender<ReceiverState>,
    transports: Mutex<Option<Transports>>,
    generations: AtomicU64,
    shutdown_grace: Duration,
}

impl Default for OTLPReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl OTLPReceiver {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ReceiverState::Created);
        Self {
            state,
            transports: Mutex::new(None),
            generations: AtomicU64::new(0),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// How long in-flight deliveries may run once a stop was requested.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReceiverState> {
        self.state.subscribe()
    }

    /// Waits until the receiver is running. Fails early when it moves to
    /// `Failed` instead.
    pub async fn wait_running(&self, timeout: Duration) -> Result<(), ReadinessError> {
        let mut rx = self.state.subscribe();
        let res = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ReceiverState::Running | ReceiverState::Failed)),
        )
        .await;

        match res {
            Err(_) => Err(ReadinessError::Timeout(timeout)),
            Ok(Err(_)) => Err(ReadinessError::Closed),
            Ok(Ok(state)) if *state == ReceiverState::Running => Ok(()),
            Ok(Ok(_)) => Err(ReadinessError::Failed),
        }
    }

    /// Endpoints of the running transports, None unless running.
    pub async fn bound_endpoints(&self) -> Option<BoundEndpoints> {
        self.transports
            .lock()
            .await
            .as_ref()
            .map(|t| t.bound.clone())
    }

    /// Validates `args`, binds every enabled transport and starts serving.
    /// Configuration errors leave the state untouched, bind errors move the
    /// receiver to `Failed`.
    pub async fn start(&self, args: &Arguments) -> Result<BoundEndpoints, ReceiverError> {
        let settings = args.convert()?;

        let mut slot = self.transports.lock().await;
        self.start_locked(&mut slot, settings, args.output.clone())
            .await
    }

    pub async fn stop(&self) -> Result<(), ReceiverError> {
        let mut slot = self.transports.lock().await;
        self.stop_locked(&mut slot).await
    }

    /// Swaps in a new configuration by stopping the running transports and
    /// starting fresh ones. A configuration error keeps the current
    /// transports running.
    pub async fn update(&self, args: &Arguments) -> Result<BoundEndpoints, ReceiverError> {
        let settings = args.convert()?;

        let mut slot = self.transports.lock().await;
        if self.state() == ReceiverState::Running {
            info!("Reconfiguring OTLP receiver.");
            if let Err(e) = self.stop_locked(&mut slot).await {
                warn!(error = %e, "Previous OTLP receiver transports did not stop cleanly.");
            }
        }
        self.start_locked(&mut slot, settings, args.output.clone())
            .await
    }

    /// Starts the receiver and keeps it running until `cancel` fires or a
    /// transport exits on its own.
    pub async fn run(
        &self,
        args: &Arguments,
        cancel: CancellationToken,
    ) -> Result<(), ReceiverError> {
        self.start(args).await?;

        loop {
            let current = self
                .transports
                .lock()
                .await
                .as_ref()
                .map(|t| (t.generation, t.exited.clone()));

            let Some((generation, exited)) = current else {
                return match self.state() {
                    ReceiverState::Failed => Err(ReceiverError::TransportExited(
                        "restart after reconfiguration failed".to_string(),
                    )),
                    _ => Ok(()),
                };
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("OTLP receiver cancellation signaled.");
                    return self.stop().await;
                },
                _ = exited.cancelled() => {
                    let mut slot = self.transports.lock().await;
                    // replaced by an update, or stopped from elsewhere
                    if slot.as_ref().map(|t| t.generation) != Some(generation) {
                        continue;
                    }

                    warn!("OTLP receiver transport exited unexpectedly, stopping.");
                    let reason = match self.stop_locked(&mut slot).await {
                        Ok(()) => "transport stopped serving".to_string(),
                        Err(e) => e.to_string(),
                    };
                    return Err(ReceiverError::TransportExited(reason));
                }
            }
        }
    }

    async fn start_locked(
        &self,
        slot: &mut Option<Transports>,
        settings: ReceiverSettings,
        output: ConsumerSet,
    ) -> Result<BoundEndpoints, ReceiverError> {
        let state = self.state();
        if !matches!(state, ReceiverState::Created | ReceiverState::Stopped) {
            return Err(ReceiverError::InvalidState {
                action: "start",
                state,
            });
        }
        self.set_state(ReceiverState::Starting);

        let (http, grpc) = tokio::join!(
            bind_optional(settings.http.as_ref().map(|s| &s.endpoint)),
            bind_optional(settings.grpc.as_ref().map(|s| &s.endpoint)),
        );
        let (http, grpc) = match (http, grpc) {
            (Ok(http), Ok(grpc)) => (http, grpc),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to bind OTLP receiver transport.");
                self.set_state(ReceiverState::Failed);
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let exited = CancellationToken::new();
        let mut tasks = TaskSet::new();
        let mut bound = BoundEndpoints::default();
        let disable_high_cardinality = settings.disable_high_cardinality_metrics;

        if let (Some(http_settings), Some((listener, endpoint))) = (settings.http, http) {
            info!(endpoint = %endpoint, "Starting OTLP HTTP receiver.");
            let srv = OTLPHttpServer::builder()
                .with_settings(&http_settings)
                .with_output(output.clone())
                .with_shutdown_grace(self.shutdown_grace)
                .with_disable_high_cardinality_metrics(disable_high_cardinality)
                .build();

            let (cancel, exited) = (cancel.clone(), exited.clone());
            tasks.spawn(async move {
                let res = srv.serve(listener, cancel).await;
                exited.cancel();
                res
            });
            bound.http = Some(endpoint);
        }

        if let (Some(grpc_settings), Some((listener, endpoint))) = (settings.grpc, grpc) {
            info!(endpoint = %endpoint, "Starting OTLP gRPC receiver.");
            let srv = OTLPGrpcServer::builder()
                .with_settings(&grpc_settings)
                .with_output(output)
                .with_shutdown_grace(self.shutdown_grace)
                .with_disable_high_cardinality_metrics(disable_high_cardinality)
                .build();

            let (cancel, exited) = (cancel.clone(), exited.clone());
            tasks.spawn(async move {
                let res = srv.serve(listener, cancel).await;
                exited.cancel();
                res
            });
            bound.grpc = Some(endpoint);
        }

        *slot = Some(Transports {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            bound: bound.clone(),
            cancel,
            exited,
            tasks,
        });
        self.set_state(ReceiverState::Running);

        Ok(bound)
    }

    async fn stop_locked(&self, slot: &mut Option<Transports>) -> Result<(), ReceiverError> {
        let state = self.state();
        match state {
            ReceiverState::Running => {}
            ReceiverState::Created | ReceiverState::Stopped | ReceiverState::Failed => {
                return Ok(());
            }
            ReceiverState::Starting | ReceiverState::Stopping => {
                return Err(ReceiverError::InvalidState {
                    action: "stop",
                    state,
                });
            }
        }

        self.set_state(ReceiverState::Stopping);
        let res = match slot.take() {
            Some(mut transports) => {
                transports.cancel.cancel();
                wait_for_tasks_with_timeout(
                    &mut transports.tasks,
                    self.shutdown_grace + STOP_TIMEOUT_MARGIN,
                )
                .await
            }
            None => Ok(()),
        };
        self.set_state(ReceiverState::Stopped);

        res.map_err(|e| ReceiverError::Shutdown {
            error: e.to_string(),
        })
    }

    fn set_state(&self, state: ReceiverState) {
        let previous = self.state.send_replace(state);
        debug!(from = %previous, to = %state, "OTLP receiver state changed.");
    }
}

async fn bind_optional(
    endpoint: Option<&Endpoint>,
) -> Result<Option<(Listener, Endpoint)>, BindError> {
    let Some(endpoint) = endpoint else {
        return Ok(None);
    };

    let listener = Listener::bind(endpoint).await?;
    let bound = listener.bound_endpoint().map_err(|source| BindError {
        endpoint: endpoint.clone(),
        source,
    })?;

    Ok(Some((listener, bound)))
}
