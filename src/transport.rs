//! Plain HTTP/1.1 transport that reports its lifecycle as
//! [`LifecycleEvent`]s.
//!
//! Every attempt opens a fresh connection from a spawned driver task, so
//! connection-setup phases are always measured.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Uri};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::error::{AttemptError, TransportErrorCode};
use crate::lifecycle::{Attempt, AttemptFactory, LifecycleEvent};
use crate::util::redact_uri_for_logs;

/// Description of one HTTP call, replayed for every attempt.
#[derive(Clone, Debug)]
pub struct RequestSpec {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl RequestSpec {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }
}

#[derive(Clone, Debug)]
pub struct HttpRequestFactory {
    request: RequestSpec,
}

impl HttpRequestFactory {
    pub fn new(request: RequestSpec) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &RequestSpec {
        &self.request
    }
}

impl AttemptFactory for HttpRequestFactory {
    type Attempt = HttpAttempt;

    fn start_attempt(&mut self) -> HttpAttempt {
        HttpAttempt::start(self.request.clone())
    }
}

/// One in-flight exchange. Must be started inside a tokio runtime.
#[derive(Debug)]
pub struct HttpAttempt {
    events: UnboundedReceiver<LifecycleEvent>,
    driver: JoinHandle<()>,
    activity: Arc<SocketActivity>,
    idle_timeout: Option<Duration>,
}

impl HttpAttempt {
    pub fn start(request: RequestSpec) -> Self {
        let (sender, events) = unbounded_channel();
        let activity = Arc::new(SocketActivity::new());
        let driver = tokio::spawn(drive(request, EventSink { sender }, Arc::clone(&activity)));
        Self {
            events,
            driver,
            activity,
            idle_timeout: None,
        }
    }
}

impl Attempt for HttpAttempt {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        let Some(idle) = self.idle_timeout else {
            return self.events.recv().await;
        };
        loop {
            let idle_at = self.activity.last() + idle;
            tokio::select! {
                event = self.events.recv() => {
                    self.activity.touch();
                    return event;
                }
                _ = sleep_until(idle_at) => {
                    // Bytes may have moved while the timer was pending.
                    if self.activity.last() + idle <= Instant::now() {
                        return Some(LifecycleEvent::IdleTimeout);
                    }
                }
            }
        }
    }

    fn abort(&mut self) {
        self.driver.abort();
        self.events.close();
    }

    fn arm_idle_timeout(&mut self, timeout: Duration) {
        self.activity.touch();
        self.idle_timeout = Some(timeout);
    }
}

impl Drop for HttpAttempt {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[derive(Clone, Debug)]
struct EventSink {
    sender: UnboundedSender<LifecycleEvent>,
}

impl EventSink {
    // The attempt may already be gone; late signals are dropped.
    fn emit(&self, event: LifecycleEvent) {
        let _ = self.sender.send(event);
    }
}

/// When bytes last moved on the connection, shared by the driver and the
/// attempt that polls the idle timer.
#[derive(Debug)]
struct SocketActivity {
    origin: Instant,
    last_nanos: AtomicU64,
}

impl SocketActivity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_nanos: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let nanos = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.last_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.origin + Duration::from_nanos(self.last_nanos.load(Ordering::Relaxed))
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn drive(request: RequestSpec, sink: EventSink, activity: Arc<SocketActivity>) {
    if let Err(error) = exchange(request, &sink, activity).await {
        sink.emit(LifecycleEvent::Error(error));
    }
}

async fn exchange(
    request: RequestSpec,
    sink: &EventSink,
    activity: Arc<SocketActivity>,
) -> Result<(), AttemptError> {
    let target = Target::from_uri(request.uri())?;
    debug!(
        method = %request.method(),
        uri = %redact_uri_for_logs(&request.uri().to_string()),
        "connecting"
    );
    sink.emit(LifecycleEvent::SocketAcquired { reused: false });

    let addresses: Vec<SocketAddr> = lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(AttemptError::from_io)?
        .collect();
    sink.emit(LifecycleEvent::DnsResolved);

    let stream = connect(&addresses).await?;
    if let Err(error) = stream.set_nodelay(true) {
        debug!(error = %error, "failed to disable nagle on connection");
    }
    sink.emit(LifecycleEvent::TcpConnected);

    let body_handed_off = Arc::new(AtomicBool::new(request.body.is_empty()));
    let io = UploadTracker::new(stream, Arc::clone(&body_handed_off), sink.clone(), activity);
    let (mut sender, connection) = http1::handshake::<_, UploadBody>(TokioIo::new(io))
        .await
        .map_err(hyper_error)?;
    let _connection = AbortOnDrop(tokio::spawn(async move {
        if let Err(error) = connection.await {
            debug!(error = %error, "connection closed with error");
        }
    }));

    let mut http_request = Request::new(UploadBody::new(request.body.clone(), body_handed_off));
    *http_request.method_mut() = request.method.clone();
    *http_request.uri_mut() = target.origin_form;
    *http_request.headers_mut() = request.headers.clone();
    if !http_request.headers().contains_key(HOST) {
        http_request.headers_mut().insert(HOST, target.host_header);
    }

    sender.ready().await.map_err(hyper_error)?;
    let response = sender.send_request(http_request).await.map_err(hyper_error)?;
    let (parts, mut body) = response.into_parts();
    sink.emit(LifecycleEvent::ResponseHeaders {
        status: parts.status,
        headers: parts.headers,
    });

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                if let Ok(chunk) = frame.into_data()
                    && !chunk.is_empty()
                {
                    sink.emit(LifecycleEvent::BodyChunk(chunk));
                }
            }
            Err(error) => {
                sink.emit(LifecycleEvent::ResponseError(hyper_error(error)));
                return Ok(());
            }
        }
    }
    sink.emit(LifecycleEvent::BodyEnded);
    Ok(())
}

async fn connect(addresses: &[SocketAddr]) -> Result<TcpStream, AttemptError> {
    let mut last_error = None;
    for address in addresses {
        match TcpStream::connect(*address).await {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = Some(error),
        }
    }
    Err(match last_error {
        Some(error) => AttemptError::from_io(error),
        None => AttemptError::transport(TransportErrorCode::NameNotFound, "no address resolved"),
    })
}

#[derive(Debug)]
struct Target {
    host: String,
    port: u16,
    host_header: HeaderValue,
    origin_form: Uri,
}

impl Target {
    fn from_uri(uri: &Uri) -> Result<Self, AttemptError> {
        match uri.scheme_str() {
            Some("http") => {}
            Some(scheme) => {
                return Err(AttemptError::transport(
                    TransportErrorCode::Other,
                    format!("unsupported scheme `{scheme}`, only http is available"),
                ));
            }
            None => {
                return Err(AttemptError::transport(
                    TransportErrorCode::Other,
                    "request uri must be absolute",
                ));
            }
        }
        let Some(authority) = uri.authority() else {
            return Err(AttemptError::transport(
                TransportErrorCode::Other,
                "request uri has no host",
            ));
        };

        let host = authority.host();
        let host_header = match authority.port_u16() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        let host_header = HeaderValue::from_str(&host_header).map_err(|error| {
            AttemptError::transport_caused_by(TransportErrorCode::Other, "invalid host", error)
        })?;
        let origin_form = uri
            .path_and_query()
            .map_or("/", |path_and_query| path_and_query.as_str())
            .parse::<Uri>()
            .map_err(|error| {
                AttemptError::transport_caused_by(TransportErrorCode::Other, "invalid path", error)
            })?;

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
            port: authority.port_u16().unwrap_or(80),
            host_header,
            origin_form,
        })
    }
}

fn hyper_error(error: hyper::Error) -> AttemptError {
    if error.is_incomplete_message() || error.is_closed() || error.is_canceled() {
        return AttemptError::transport_caused_by(
            TransportErrorCode::ConnectionReset,
            "socket hang up",
            error,
        );
    }
    if error.is_timeout() {
        let message = error.to_string();
        return AttemptError::transport_caused_by(TransportErrorCode::TimedOut, message, error);
    }

    let mut code = TransportErrorCode::Other;
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            code = TransportErrorCode::from_io_error(io_error);
            break;
        }
        source = cause.source();
    }
    let message = error.to_string();
    AttemptError::transport_caused_by(code, message, error)
}

/// Request body that records when hyper has taken its bytes.
struct UploadBody {
    data: Option<Bytes>,
    handed_off: Arc<AtomicBool>,
}

impl UploadBody {
    fn new(data: Bytes, handed_off: Arc<AtomicBool>) -> Self {
        Self {
            data: (!data.is_empty()).then_some(data),
            handed_off,
        }
    }
}

impl Body for UploadBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let frame = self.data.take().map(|data| Ok(Frame::data(data)));
        self.handed_off.store(true, Ordering::Release);
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.data.as_ref().map_or(0, |data| data.len() as u64))
    }
}

/// Connection wrapper that records socket traffic for the idle timer and
/// emits [`LifecycleEvent::UploadFinished`] on the first completed flush after
/// the whole request was written.
struct UploadTracker {
    stream: TcpStream,
    body_handed_off: Arc<AtomicBool>,
    sink: EventSink,
    activity: Arc<SocketActivity>,
    wrote: bool,
    finished: bool,
}

impl UploadTracker {
    fn new(
        stream: TcpStream,
        body_handed_off: Arc<AtomicBool>,
        sink: EventSink,
        activity: Arc<SocketActivity>,
    ) -> Self {
        Self {
            stream,
            body_handed_off,
            sink,
            activity,
            wrote: false,
            finished: false,
        }
    }

    fn record_written(&mut self, poll: &Poll<io::Result<usize>>) {
        if let Poll::Ready(Ok(written)) = poll
            && *written > 0
        {
            self.wrote = true;
            self.activity.touch();
        }
    }
}

impl AsyncRead for UploadTracker {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled = buf.filled().len();
        let poll = Pin::new(&mut this.stream).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > filled {
            this.activity.touch();
        }
        poll
    }
}

impl AsyncWrite for UploadTracker {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.stream).poll_write(cx, buf);
        this.record_written(&poll);
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.stream).poll_write_vectored(cx, bufs);
        this.record_written(&poll);
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.stream).poll_flush(cx);
        if matches!(poll, Poll::Ready(Ok(())))
            && this.wrote
            && !this.finished
            && this.body_handed_off.load(Ordering::Acquire)
        {
            this.finished = true;
            this.sink.emit(LifecycleEvent::UploadFinished);
        }
        poll
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}
