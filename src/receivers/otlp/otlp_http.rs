// SPDX-License-Identifier: Apache-2.0

use crate::init::config::{
    DEFAULT_LOGS_URL_PATH, DEFAULT_MAX_REQUEST_BODY_SIZE, DEFAULT_METRICS_URL_PATH,
    DEFAULT_TRACES_URL_PATH,
};
use crate::listener::Listener;
use crate::receivers::otlp::counters::ReceiverCounters;
use crate::receivers::otlp::{
    DEFAULT_SHUTDOWN_GRACE, HttpSettings, cancel_in_flight_after_grace, route_path,
};
use crate::topology::consumer::ConsumerSet;
use crate::topology::fanout::Fanout;
use crate::topology::payload::{OTLPInto, RequestMetadata, Signal, SignalKind, TelemetryBatch};
use flate2::read::GzDecoder;
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
use read_restrict::ReadExt;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::io::{ErrorKind, Read};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::{BoxError, Service, ServiceBuilder, ServiceExt};
use tower_http::compression::{Compression, CompressionLayer};
use tower_http::limit::{RequestBodyLimit, RequestBodyLimitLayer};
use tower_http::trace::{HttpMakeClassifier, Trace, TraceLayer};
use tower_http::validate_request::{
    ValidateRequest, ValidateRequestHeader, ValidateRequestHeaderLayer,
};
use tracing::{debug, error, warn};

pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

const PROTOBUF_CT: &str = "application/x-protobuf";
const JSON_CT: &str = "application/json";

pub struct OTLPHttpServerBuilder {
    output: ConsumerSet,
    traces_path: String,
    metrics_path: String,
    logs_path: String,
    header_timeout: Duration,
    shutdown_grace: Duration,
    max_request_body_size: usize,
    include_metadata: bool,
    headers_to_include: Vec<String>,
    disable_high_cardinality_metrics: bool,
}

impl Default for OTLPHttpServerBuilder {
    fn default() -> Self {
        Self {
            output: ConsumerSet::default(),
            traces_path: DEFAULT_TRACES_URL_PATH.to_string(),
            metrics_path: DEFAULT_METRICS_URL_PATH.to_string(),
            logs_path: DEFAULT_LOGS_URL_PATH.to_string(),
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_request_body_size: DEFAULT_MAX_REQUEST_BODY_SIZE,
            include_metadata: false,
            headers_to_include: vec![],
            disable_high_cardinality_metrics: true,
        }
    }
}

impl OTLPHttpServerBuilder {
    /// Applies every field of validated settings except the endpoint, which
    /// belongs to the listener.
    pub fn with_settings(self, settings: &HttpSettings) -> Self {
        self.with_traces_path(settings.traces_url_path.clone())
            .with_metrics_path(settings.metrics_url_path.clone())
            .with_logs_path(settings.logs_url_path.clone())
            .with_max_request_body_size(settings.max_request_body_size)
            .with_include_metadata(settings.include_metadata)
            .with_headers_to_include(settings.headers_to_include.clone())
    }

    pub fn with_output(mut self, output: ConsumerSet) -> Self {
        self.output = output;
        self
    }

    pub fn with_traces_path(mut self, value: String) -> Self {
        self.traces_path = value;
        self
    }

    pub fn with_metrics_path(mut self, value: String) -> Self {
        self.metrics_path = value;
        self
    }

    pub fn with_logs_path(mut self, value: String) -> Self {
        self.logs_path = value;
        self
    }

    pub fn with_header_timeout(mut self, header_timeout: Duration) -> Self {
        self.header_timeout = header_timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_request_body_size(mut self, size: usize) -> Self {
        self.max_request_body_size = size;
        self
    }

    pub fn with_include_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    pub fn with_headers_to_include(mut self, headers: Vec<String>) -> Self {
        self.headers_to_include = headers;
        self
    }

    pub fn with_disable_high_cardinality_metrics(mut self, disable: bool) -> Self {
        self.disable_high_cardinality_metrics = disable;
        self
    }

    pub fn build(self) -> OTLPHttpServer {
        let headers_to_include = match self.include_metadata {
            true if !self.headers_to_include.is_empty() => Some(Arc::new(
                self.headers_to_include
                    .iter()
                    .map(|h| h.to_lowercase())
                    .collect(),
            )),
            _ => None,
        };

        OTLPHttpServer {
            traces: Arc::new(Fanout::new(self.output.traces)),
            metrics: Arc::new(Fanout::new(self.output.metrics)),
            logs: Arc::new(Fanout::new(self.output.logs)),
            routes: Arc::new(Routes {
                traces: route_path(&self.traces_path),
                metrics: route_path(&self.metrics_path),
                logs: route_path(&self.logs_path),
            }),
            header_timeout: self.header_timeout,
            shutdown_grace: self.shutdown_grace,
            max_request_body_size: self.max_request_body_size,
            headers_to_include,
            counters: ReceiverCounters::new("http", self.disable_high_cardinality_metrics),
        }
    }
}

pub struct OTLPHttpServer {
    traces: Arc<Fanout<ResourceSpans>>,
    metrics: Arc<Fanout<ResourceMetrics>>,
    logs: Arc<Fanout<ResourceLogs>>,
    routes: Arc<Routes>,
    header_timeout: Duration,
    shutdown_grace: Duration,
    max_request_body_size: usize,
    headers_to_include: Option<Arc<Vec<String>>>,
    counters: ReceiverCounters,
}

type OTLPHttpService = Trace<
    RequestBodyLimit<Compression<ValidateRequestHeader<OTLPService, ValidateOTLPContentType>>>,
    HttpMakeClassifier,
>;

impl OTLPHttpServer {
    pub fn builder() -> OTLPHttpServerBuilder {
        Default::default()
    }

    /// Serves until `cancellation` fires, then stops accepting and waits for
    /// open connections to finish. Deliveries still running once the shutdown
    /// grace period has passed are cancelled.
    pub async fn serve(
        &self,
        listener: Listener,
        cancellation: CancellationToken,
    ) -> Result<(), BoxError> {
        let in_flight = CancellationToken::new();
        let svc = self.build_service(in_flight.clone());

        let watchdog = cancel_in_flight_after_grace(
            "http",
            cancellation.clone(),
            in_flight,
            self.shutdown_grace,
        );

        tokio::select! {
            res = self.accept_loop(listener, svc, cancellation) => res,
            _ = watchdog => Ok(()),
        }
    }

    async fn accept_loop(
        &self,
        listener: Listener,
        svc: OTLPHttpService,
        cancellation: CancellationToken,
    ) -> Result<(), BoxError> {
        let timer = TokioTimer::new();
        let graceful = GracefulShutdown::new();

        let mut builder = Builder::new(TokioExecutor::new());
        builder
            .http1()
            .header_read_timeout(Some(self.header_timeout))
            .timer(timer.clone());
        builder.http2().timer(timer);

        loop {
            let (stream, peer) = tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok(accepted) => accepted,
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = cancellation.cancelled() => break
            };

            // Peer address travels as a request extension for the counters
            let svc = svc.clone().map_request(move |mut req: Request<Incoming>| {
                if let Some(peer) = peer {
                    req.extensions_mut().insert(PeerAddr(peer));
                }
                req
            });

            let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(svc));
            let fut = graceful.watch(conn.into_owned());

            tokio::spawn(async move {
                if let Err(e) = fut.await {
                    log_connection_error(e);
                }
            });
        }

        // refuse new connections while existing ones drain
        drop(listener);
        graceful.shutdown().await;

        Ok(())
    }

    fn build_service(&self, in_flight: CancellationToken) -> OTLPHttpService {
        ServiceBuilder::new()
            // Log requests at debug level
            .layer(TraceLayer::new_for_http())
            // Limit incoming body size
            .layer(RequestBodyLimitLayer::new(self.max_request_body_size))
            // Compress responses with gzip, if accept-encoding set
            .layer(CompressionLayer::new())
            .layer(ValidateRequestHeaderLayer::custom(ValidateOTLPContentType {
                routes: self.routes.clone(),
            }))
            .service(OTLPService {
                traces: self.traces.clone(),
                metrics: self.metrics.clone(),
                logs: self.logs.clone(),
                routes: self.routes.clone(),
                max_request_body_size: self.max_request_body_size,
                headers_to_include: self.headers_to_include.clone(),
                counters: self.counters.clone(),
                in_flight,
            })
    }
}

fn log_connection_error(e: BoxError) {
    if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
        let err_str = format!("{:?}", hyper_err);

        // This may imply a client shutdown race: https://github.com/hyperium/hyper/issues/3775
        let err_not_connected = err_str.contains("NotConnected");
        // There is no idle timeout, so header timeout is hit first
        let err_hdr_timeout = err_str.contains("HeaderTimeout");

        if !err_not_connected && !err_hdr_timeout {
            error!("error serving connection: {:?}", hyper_err);
        }
    } else {
        error!("error serving connection: {:?}", e);
    }
}

#[derive(Clone, Copy, Debug)]
struct PeerAddr(SocketAddr);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Encoding {
    Protobuf,
    Json,
}

impl Encoding {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let ct = headers.get(CONTENT_TYPE)?.to_str().ok()?;
        // ignore parameters such as charset
        let mime = ct.split(';').next().unwrap_or_default().trim();
        if mime.eq_ignore_ascii_case(PROTOBUF_CT) {
            Some(Encoding::Protobuf)
        } else if mime.eq_ignore_ascii_case(JSON_CT) {
            Some(Encoding::Json)
        } else {
            None
        }
    }

    fn content_type(&self) -> &'static str {
        match self {
            Encoding::Protobuf => PROTOBUF_CT,
            Encoding::Json => JSON_CT,
        }
    }
}

#[derive(Debug)]
struct Routes {
    traces: String,
    metrics: String,
    logs: String,
}

impl Routes {
    fn signal(&self, path: &str) -> Option<SignalKind> {
        if path == self.traces {
            Some(SignalKind::Traces)
        } else if path == self.metrics {
            Some(SignalKind::Metrics)
        } else if path == self.logs {
            Some(SignalKind::Logs)
        } else {
            None
        }
    }
}

#[derive(Clone)]
struct ValidateOTLPContentType {
    routes: Arc<Routes>,
}

impl<B> ValidateRequest<B> for ValidateOTLPContentType {
    type ResponseBody = Full<Bytes>;

    fn validate(&mut self, request: &mut Request<B>) -> Result<(), Response<Self::ResponseBody>> {
        // Only validate requests that are valid paths. We'd prefer to return a
        // 404 instead of a 400.
        if request.method() != Method::POST || self.routes.signal(request.uri().path()).is_none()
        {
            return Ok(());
        }

        match Encoding::from_headers(request.headers()) {
            Some(_) => Ok(()),
            None => {
                debug!(content_type = ?request.headers().get(CONTENT_TYPE), "Unsupported content-type");
                Err(status_response(StatusCode::BAD_REQUEST))
            }
        }
    }
}

#[derive(Clone)]
struct OTLPService {
    traces: Arc<Fanout<ResourceSpans>>,
    metrics: Arc<Fanout<ResourceMetrics>>,
    logs: Arc<Fanout<ResourceLogs>>,
    routes: Arc<Routes>,
    max_request_body_size: usize,
    headers_to_include: Option<Arc<Vec<String>>>,
    counters: ReceiverCounters,
    in_flight: CancellationToken,
}

struct RequestContext<T> {
    output: Arc<Fanout<T>>,
    max_request_body_size: usize,
    headers_to_include: Option<Arc<Vec<String>>>,
    counters: ReceiverCounters,
    cancel: CancellationToken,
}

impl OTLPService {
    fn context<T>(&self, output: &Arc<Fanout<T>>) -> RequestContext<T> {
        RequestContext {
            output: output.clone(),
            max_request_body_size: self.max_request_body_size,
            headers_to_include: self.headers_to_include.clone(),
            counters: self.counters.clone(),
            cancel: self.in_flight.child_token(),
        }
    }
}

impl<H> Service<Request<H>> for OTLPService
where
    H: Body + Send + Sync + 'static,
    <H as Body>::Data: Send + Sync,
    <H as Body>::Error: Display + Debug + Send + Sync,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        // Return 404 Not Found for other methods and routes.
        if req.method() != Method::POST {
            return Box::pin(futures::future::ok(status_response(StatusCode::NOT_FOUND)));
        }

        match self.routes.signal(req.uri().path()) {
            Some(SignalKind::Traces) => Box::pin(handle(req, self.context(&self.traces))),
            Some(SignalKind::Metrics) => Box::pin(handle(req, self.context(&self.metrics))),
            Some(SignalKind::Logs) => Box::pin(handle(req, self.context(&self.logs))),
            None => Box::pin(futures::future::ok(status_response(StatusCode::NOT_FOUND))),
        }
    }
}

async fn handle<H, T>(
    req: Request<H>,
    ctx: RequestContext<T>,
) -> Result<Response<Full<Bytes>>, hyper::Error>
where
    H: Body,
    <H as Body>::Error: Display + Debug,
    T: Signal,
{
    let peer = req.extensions().get::<PeerAddr>().map(|p| p.0);

    let Some(encoding) = Encoding::from_headers(req.headers()) else {
        return Ok(status_response(StatusCode::BAD_REQUEST));
    };

    // Extract headers before consuming the request body
    let metadata = ctx
        .headers_to_include
        .as_ref()
        .and_then(|headers| extract_headers_to_metadata(req.headers(), headers));

    let body = match decode_body(req, ctx.max_request_body_size).await {
        Ok(body) => body,
        Err(code) => return Ok(status_response(code)),
    };

    let decoded = match encoding {
        Encoding::Protobuf => {
            <T::ExportRequest as prost::Message>::decode(body).map_err(|e| e.to_string())
        }
        Encoding::Json => {
            serde_json::from_slice::<T::ExportRequest>(&body).map_err(|e| e.to_string())
        }
    };
    let otlp_req = match decoded {
        Ok(req) => req,
        Err(e) => {
            error!(
                error = e,
                signal = T::KIND.as_str(),
                content_type = encoding.content_type(),
                "Failed to decode OTLP HTTP request."
            );
            return Ok(status_response(StatusCode::BAD_REQUEST));
        }
    };

    let batch = TelemetryBatch::new(otlp_req.otlp_into()).with_metadata(metadata);
    let count = batch.record_count();

    // hyper drops this future when the client disconnects mid-delivery,
    // which cancels the delivery through the guard
    let guard = ctx.cancel.clone().drop_guard();
    let delivered = ctx.output.deliver(&ctx.cancel, batch).await;
    guard.disarm();

    match delivered {
        Ok(()) => {
            ctx.counters.accepted(T::KIND, count, peer);
            // No partial success at the moment
            Ok(ok_response::<T::ExportResponse>(encoding))
        }
        Err(e) => {
            ctx.counters.refused(T::KIND, count, peer);
            if e.is_cancelled() {
                debug!(signal = T::KIND.as_str(), "OTLP HTTP delivery cancelled.");
            } else {
                warn!(
                    error = %e,
                    signal = T::KIND.as_str(),
                    "Failed to deliver OTLP HTTP request."
                );
            }
            Ok(status_response(StatusCode::SERVICE_UNAVAILABLE))
        }
    }
}

async fn decode_body<H: Body>(req: Request<H>, max_size: usize) -> Result<Bytes, StatusCode>
where
    <H as Body>::Error: Display + Debug,
{
    let is_gzip = req
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    let body_bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            // The body limit error is boxed by the time it reaches us, so
            // match on its message.
            if e.to_string().contains("length limit exceeded") {
                return Err(StatusCode::PAYLOAD_TOO_LARGE);
            }
            error!("Failed to read request body: {:?}", e);
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    if !is_gzip {
        return Ok(body_bytes);
    }

    match decompress_gzip(&body_bytes, max_size) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::InvalidData => Err(StatusCode::PAYLOAD_TOO_LARGE),
        Err(e) => {
            error!("Failed to decompress gzip data: {}", e);
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

// We can't use the DecompressionLayer because it doesn't provide a limit
// on the inflated size
fn decompress_gzip(compressed: &[u8], max_size: usize) -> std::io::Result<Bytes> {
    let mut decoder = GzDecoder::new(compressed).restrict(max_size as u64);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(Bytes::from(decompressed))
}

/// Extract the configured headers, keyed by lowercase name. Returns None when
/// none of them are present.
fn extract_headers_to_metadata(
    headers: &HeaderMap,
    headers_to_include: &[String],
) -> Option<RequestMetadata> {
    let found: HashMap<String, String> = headers_to_include
        .iter()
        .filter_map(|name| {
            let value = headers.get(name.as_str())?.to_str().ok()?;
            Some((name.clone(), value.to_string()))
        })
        .collect();

    (!found.is_empty()).then(|| RequestMetadata::new(found))
}

fn status_response(code: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::default());
    *resp.status_mut() = code;
    resp
}

fn ok_response<R: prost::Message + Serialize + Default>(encoding: Encoding) -> Response<Full<Bytes>> {
    // The default response is actually empty, so this results in an empty response
    let resp = R::default();

    let body = match encoding {
        Encoding::Json => match serde_json::to_vec(&resp) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to encode OTLP HTTP/JSON response.");
                return status_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        },
        Encoding::Protobuf => resp.encode_to_vec(),
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(encoding.content_type()));
    response
}

#[cfg(test)]
mod tests {
    use super::{OTLPHttpServer, OTLPHttpService};
    use crate::bounded_channel::{BoundedReceiver, bounded};
    use crate::listener::{Endpoint, Listener};
    use crate::topology::consumer::{ChannelConsumer, ConsumeError, ConsumerSet, FnConsumer};
    use crate::topology::payload::TelemetryBatch;
    use bytes::Bytes;
    use flate2::Compression as GZCompression;
    use flate2::read::GzEncoder;
    use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
    use http::{Method, Request, StatusCode};
    use http_body_util::{BodyExt, Full};
    use hyper::service::Service;
    use hyper_util::client::legacy::Client;
    use hyper_util::client::legacy::connect::HttpConnector;
    use hyper_util::rt::{TokioExecutor, TokioTimer};
    use hyper_util::service::TowerToHyperService;
    use opentelemetry_proto::tonic::logs::v1::ResourceLogs;
    use opentelemetry_proto::tonic::metrics::v1::ResourceMetrics;
    use opentelemetry_proto::tonic::trace::v1::ResourceSpans;
    use prost::Message;
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};
    use tokio_test::assert_ok;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;
    use utilities::otlp::FakeOTLP;

    struct Receivers {
        traces: BoundedReceiver<TelemetryBatch<ResourceSpans>>,
        metrics: BoundedReceiver<TelemetryBatch<ResourceMetrics>>,
        logs: BoundedReceiver<TelemetryBatch<ResourceLogs>>,
    }

    fn channel_output() -> (ConsumerSet, Receivers) {
        let (traces_tx, traces) = bounded(10);
        let (metrics_tx, metrics) = bounded(10);
        let (logs_tx, logs) = bounded(10);

        let output = ConsumerSet::default()
            .with_traces(Arc::new(ChannelConsumer::new(traces_tx)))
            .with_metrics(Arc::new(ChannelConsumer::new(metrics_tx)))
            .with_logs(Arc::new(ChannelConsumer::new(logs_tx)));

        (
            output,
            Receivers {
                traces,
                metrics,
                logs,
            },
        )
    }

    fn new_svc_from(srv: OTLPHttpServer) -> TowerToHyperService<OTLPHttpService> {
        TowerToHyperService::new(srv.build_service(CancellationToken::new()))
    }

    fn new_svc() -> (TowerToHyperService<OTLPHttpService>, Receivers) {
        let (output, rx) = channel_output();
        let srv = OTLPHttpServer::builder().with_output(output).build();
        (new_svc_from(srv), rx)
    }

    fn post(path: &str, content_type: &str, body: Vec<u8>) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(path)
            .method(Method::POST)
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    fn new_client() -> Client<HttpConnector, Full<Bytes>> {
        Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(2))
            .pool_max_idle_per_host(2)
            .timer(TokioTimer::new())
            .build::<_, Full<Bytes>>(HttpConnector::new())
    }

    #[tokio::test]
    async fn invalid_requests() {
        let (svc, _rx) = new_svc();

        // Bad path
        let req = post("/", "application/x-protobuf", vec![]);
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, resp.status());

        // Wrong method
        let req: Request<Full<Bytes>> = Request::builder()
            .uri("/v1/traces")
            .method(Method::GET)
            .body(Full::<Bytes>::default())
            .unwrap();
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::NOT_FOUND, resp.status());

        // Unsupported content type, on every signal path
        for path in ["/v1/traces", "/v1/metrics", "/v1/logs"] {
            let req = post(path, "text/plain", vec![]);
            let resp = svc.call(req).await.unwrap();
            assert_eq!(StatusCode::BAD_REQUEST, resp.status(), "path {path}");
        }

        // Missing content type
        let req: Request<Full<Bytes>> = Request::builder()
            .uri("/v1/logs")
            .method(Method::POST)
            .body(Full::<Bytes>::default())
            .unwrap();
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());
    }

    #[tokio::test]
    async fn malformed_bodies_are_not_forwarded() {
        let (svc, rx) = new_svc();

        let req = post("/v1/traces", "application/x-protobuf", vec![0xff, 0xff, 0xff]);
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());

        let req = post("/v1/metrics", "application/json", b"{\"resourceMetrics\":".to_vec());
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::BAD_REQUEST, resp.status());

        assert!(rx.traces.is_empty());
        assert!(rx.metrics.is_empty());
    }

    #[tokio::test]
    async fn size_limits() {
        let (output, _rx) = channel_output();
        let limit = 64 * 1024;
        let srv = OTLPHttpServer::builder()
            .with_output(output)
            .with_max_request_body_size(limit)
            .build();
        let svc = new_svc_from(srv);

        // Content too long
        let req = post("/v1/traces", "application/x-protobuf", vec![0; limit + 1]);
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, resp.status());

        let mut gz_vec = Vec::new();
        let large_vec = vec![0; limit + 1];
        let mut gz = GzEncoder::new(&large_vec[..], GZCompression::fast());
        gz.read_to_end(&mut gz_vec).unwrap();
        assert!(gz_vec.len() < limit);

        // Inflated content too long
        let mut req = post("/v1/traces", "application/x-protobuf", gz_vec);
        req.headers_mut()
            .insert(CONTENT_ENCODING, "gzip".parse().unwrap());
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::PAYLOAD_TOO_LARGE, resp.status());
    }

    #[tokio::test]
    async fn gzip_compressed_posts() {
        let (svc, mut rx) = new_svc();

        let buf = FakeOTLP::trace_service_request_with_spans(1, 5).encode_to_vec();
        let mut gz_vec = Vec::new();
        let mut gz = GzEncoder::new(&buf[..], GZCompression::fast());
        gz.read_to_end(&mut gz_vec).unwrap();

        let mut req = post("/v1/traces", "application/x-protobuf", gz_vec);
        req.headers_mut()
            .insert(CONTENT_ENCODING, "gzip".parse().unwrap());
        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::OK, resp.status());

        let batch = rx.traces.next().await.unwrap();
        assert_eq!(5, batch.record_count());
    }

    #[tokio::test]
    async fn valid_posts_for_each_signal() {
        let (svc, mut rx) = new_svc();

        let bodies = [
            (
                "/v1/traces",
                FakeOTLP::trace_service_request().encode_to_vec(),
                serde_json::to_vec(&FakeOTLP::trace_service_request()).unwrap(),
            ),
            (
                "/v1/metrics",
                FakeOTLP::metrics_service_request().encode_to_vec(),
                serde_json::to_vec(&FakeOTLP::metrics_service_request()).unwrap(),
            ),
            (
                "/v1/logs",
                FakeOTLP::logs_service_request().encode_to_vec(),
                serde_json::to_vec(&FakeOTLP::logs_service_request()).unwrap(),
            ),
        ];

        for (path, proto, json) in bodies {
            for (ct, body) in [("application/x-protobuf", proto), ("application/json", json)] {
                let resp = svc.call(post(path, ct, body)).await.unwrap();
                assert_eq!(StatusCode::OK, resp.status(), "{path} {ct}");
                assert_eq!(ct, resp.headers().get(CONTENT_TYPE).unwrap(), "{path} {ct}");
            }
        }

        for _ in 0..2 {
            assert_eq!(1, rx.traces.next().await.unwrap().len());
            assert_eq!(1, rx.metrics.next().await.unwrap().len());
            assert_eq!(1, rx.logs.next().await.unwrap().len());
        }
    }

    #[tokio::test]
    async fn json_content_type_with_charset() {
        let (svc, mut rx) = new_svc();

        let body = serde_json::to_vec(&FakeOTLP::logs_service_request()).unwrap();
        let resp = svc
            .call(post("/v1/logs", "application/json; charset=utf-8", body))
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!("application/json", resp.headers().get(CONTENT_TYPE).unwrap());

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_ok!(serde_json::from_slice::<serde_json::Value>(&body));
        assert_eq!(1, rx.logs.next().await.unwrap().record_count());
    }

    #[tokio::test]
    async fn custom_paths_without_leading_slash() {
        let (output, mut rx) = channel_output();
        let srv = OTLPHttpServer::builder()
            .with_output(output)
            .with_traces_path("custom/traces".to_string())
            .build();
        let svc = new_svc_from(srv);

        let body = FakeOTLP::trace_service_request().encode_to_vec();
        let resp = svc
            .call(post("/custom/traces", "application/x-protobuf", body.clone()))
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, resp.status());
        assert_eq!(1, rx.traces.next().await.unwrap().record_count());

        // default path no longer routes traces
        let resp = svc
            .call(post("/v1/traces", "application/x-protobuf", body))
            .await
            .unwrap();
        assert_eq!(StatusCode::NOT_FOUND, resp.status());
    }

    #[tokio::test]
    async fn signal_without_consumers_is_accepted() {
        let (traces_tx, traces) = bounded(10);
        let srv = OTLPHttpServer::builder()
            .with_output(
                ConsumerSet::default().with_traces(Arc::new(ChannelConsumer::new(traces_tx))),
            )
            .build();
        let svc = new_svc_from(srv);

        let body = FakeOTLP::metrics_service_request().encode_to_vec();
        let resp = svc
            .call(post("/v1/metrics", "application/x-protobuf", body))
            .await
            .unwrap();
        assert_eq!(StatusCode::OK, resp.status());
        assert!(traces.try_recv().is_none());
    }

    #[tokio::test]
    async fn consumer_failure_is_unavailable() {
        let (logs_tx, logs) = bounded(10);
        let failing = FnConsumer::new(
            |_cancel: CancellationToken, _batch: TelemetryBatch<ResourceSpans>| async {
                Err(ConsumeError::rejected("downstream full"))
            },
        );
        let srv = OTLPHttpServer::builder()
            .with_output(
                ConsumerSet::default()
                    .with_traces(Arc::new(failing))
                    .with_logs(Arc::new(ChannelConsumer::new(logs_tx))),
            )
            .build();
        let svc = new_svc_from(srv);

        let body = FakeOTLP::trace_service_request().encode_to_vec();
        let resp = svc
            .call(post("/v1/traces", "application/x-protobuf", body))
            .await
            .unwrap();
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, resp.status());
        assert!(logs.try_recv().is_none());
    }

    #[tokio::test]
    async fn http_metadata_extracted_for_traces() {
        let example_headers = FakeOTLP::example_headers();
        let header_names: Vec<String> = example_headers.keys().map(|k| k.to_uppercase()).collect();

        let (output, mut rx) = channel_output();
        let srv = OTLPHttpServer::builder()
            .with_output(output)
            .with_include_metadata(true)
            .with_headers_to_include(header_names)
            .build();
        let svc = new_svc_from(srv);

        let mut req = post(
            "/v1/traces",
            "application/x-protobuf",
            FakeOTLP::trace_service_request().encode_to_vec(),
        );
        for (key, value) in &example_headers {
            req.headers_mut()
                .insert(key.parse::<http::HeaderName>().unwrap(), value.parse().unwrap());
        }

        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::OK, resp.status());

        let batch = rx.traces.next().await.unwrap();
        let metadata = batch.metadata().unwrap();
        assert_eq!(example_headers.len(), metadata.len());
        for (key, expected_value) in &example_headers {
            assert_eq!(Some(expected_value), metadata.get(key), "header {key}");
        }
    }

    #[tokio::test]
    async fn http_metadata_not_extracted_when_disabled() {
        let example_headers = FakeOTLP::example_headers();
        let (name, value) = example_headers.iter().next().unwrap();

        let (output, mut rx) = channel_output();
        let srv = OTLPHttpServer::builder()
            .with_output(output)
            .with_include_metadata(false)
            .with_headers_to_include(vec![name.clone()])
            .build();
        let svc = new_svc_from(srv);

        let mut req = post(
            "/v1/traces",
            "application/x-protobuf",
            FakeOTLP::trace_service_request().encode_to_vec(),
        );
        req.headers_mut()
            .insert(name.parse::<http::HeaderName>().unwrap(), value.parse().unwrap());

        let resp = svc.call(req).await.unwrap();
        assert_eq!(StatusCode::OK, resp.status());
        assert!(rx.traces.next().await.unwrap().metadata().is_none());
    }

    #[traced_test]
    #[tokio::test]
    async fn does_not_log_header_timeout() {
        let (output, _rx) = channel_output();
        let srv = OTLPHttpServer::builder()
            .with_output(output)
            .with_header_timeout(Duration::from_millis(50))
            .build();

        let cancel_token = CancellationToken::new();
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let addr = listener.bound_endpoint().unwrap();
        let srv_hnd = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move { srv.serve(listener, cancel_token).await })
        };

        let buf = Bytes::from(FakeOTLP::trace_service_request().encode_to_vec());
        let client = new_client();
        let req = hyper::Request::builder()
            .method(Method::POST)
            .header(CONTENT_TYPE, "application/x-protobuf")
            .uri(format!("http://{addr}/v1/traces"))
            .body(Full::new(buf))
            .unwrap();

        let resp = client.request(req.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // wait, ideally keeping the connection open
        sleep(Duration::from_millis(100)).await;

        // should reuse open connection
        assert_ok!(client.request(req).await);

        cancel_token.cancel();
        assert_ok!(srv_hnd.await.unwrap());

        // we should not see an error logged
        assert!(!logs_contain("error serving connection"));
    }

    #[tokio::test]
    async fn shutdown_grace_cancels_stuck_delivery() {
        let blocking = FnConsumer::new(
            |cancel: CancellationToken, _batch: TelemetryBatch<ResourceSpans>| async move {
                cancel.cancelled().await;
                Err(ConsumeError::Cancelled)
            },
        );
        let srv = OTLPHttpServer::builder()
            .with_output(ConsumerSet::default().with_traces(Arc::new(blocking)))
            .with_shutdown_grace(Duration::from_millis(50))
            .build();

        let cancel_token = CancellationToken::new();
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let addr = listener.bound_endpoint().unwrap();
        let srv_hnd = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move { srv.serve(listener, cancel_token).await })
        };

        let client = new_client();
        let req = hyper::Request::builder()
            .method(Method::POST)
            .header(CONTENT_TYPE, "application/x-protobuf")
            .uri(format!("http://{addr}/v1/traces"))
            .body(Full::new(Bytes::from(
                FakeOTLP::trace_service_request().encode_to_vec(),
            )))
            .unwrap();
        let resp_hnd = tokio::spawn(async move { client.request(req).await });

        sleep(Duration::from_millis(50)).await;
        cancel_token.cancel();

        let resp = resp_hnd.await.unwrap().unwrap();
        assert_eq!(StatusCode::SERVICE_UNAVAILABLE, resp.status());

        let res = timeout(Duration::from_secs(2), srv_hnd).await;
        assert_ok!(res.unwrap().unwrap());
    }

    #[tokio::test]
    async fn client_disconnect_cancels_delivery() {
        let (tokens_tx, mut tokens_rx) = mpsc::unbounded_channel();
        let blocking = FnConsumer::new(
            move |cancel: CancellationToken, _batch: TelemetryBatch<ResourceSpans>| {
                let _ = tokens_tx.send(cancel.clone());
                async move {
                    cancel.cancelled().await;
                    Err(ConsumeError::Cancelled)
                }
            },
        );
        let srv = OTLPHttpServer::builder()
            .with_output(ConsumerSet::default().with_traces(Arc::new(blocking)))
            .build();

        let cancel_token = CancellationToken::new();
        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1", 0)).await.unwrap();
        let addr = listener.bound_endpoint().unwrap();
        let srv_hnd = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move { srv.serve(listener, cancel_token).await })
        };

        let body = FakeOTLP::trace_service_request().encode_to_vec();
        let head = format!(
            "POST /v1/traces HTTP/1.1\r\nhost: {addr}\r\ncontent-type: application/x-protobuf\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        let mut stream = TcpStream::connect(addr.to_string()).await.unwrap();
        stream.write_all(head.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();

        let delivery = timeout(Duration::from_secs(1), tokens_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!delivery.is_cancelled());

        drop(stream);
        assert_ok!(timeout(Duration::from_secs(1), delivery.cancelled()).await);

        cancel_token.cancel();
        assert_ok!(srv_hnd.await.unwrap());
    }
}
