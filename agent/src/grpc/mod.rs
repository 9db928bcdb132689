//! C3b: a transparent gRPC stream proxy. Messages are never decoded as
//! protobuf — frames are forwarded as opaque bytes via a passthrough
//! codec, so the proxy works for any service without generated stubs.

use std::{
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::{Buf, Bytes};
use futures::{Stream, StreamExt};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpSocket, TcpStream};
use tonic::{
    body::BoxBody,
    client::Grpc as GrpcClient,
    codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder},
    server::Grpc as GrpcServer,
    transport::{Channel, Endpoint, Uri},
    Request, Response, Status, Streaming,
};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::disruption::GrpcDisruption;
use crate::error::{AgentError, AgentResult};
use crate::metrics::{MetricMap, REQUESTS_DISRUPTED, REQUESTS_EXCLUDED, REQUESTS_TOTAL};
use crate::rng::{delayed, Rng};

/// A `tonic` codec that moves raw bytes without protobuf decoding, so a
/// single passthrough handler can serve every method path.
#[derive(Debug, Clone, Default)]
struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, buf: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        buf.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, buf: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        if !buf.has_remaining() {
            return Ok(None);
        }
        let remaining = buf.remaining();
        Ok(Some(buf.copy_to_bytes(remaining)))
    }
}

/// Dials the upstream bound to `local_address`, so the interceptor's
/// netfilter rules exclude this traffic. Mirrors the HTTP proxy's dial.
#[derive(Clone)]
struct BoundConnector {
    local_address: Option<IpAddr>,
}

impl tower::Service<Uri> for BoundConnector {
    type Response = TokioIo<TcpStream>;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let local_address = self.local_address;
        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "uri missing host"))?;
            let port = uri.port_u16().unwrap_or(443);
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{error}")))?;

            let socket = if addr.is_ipv4() { TcpSocket::new_v4() } else { TcpSocket::new_v6() }?;
            if let Some(local) = local_address {
                socket.bind(SocketAddr::new(local, 0))?;
            }
            let stream = socket.connect(addr).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

/// `{listen_address, upstream_address, local_address, disruption}`.
#[derive(Debug, Clone)]
pub struct GrpcProxyConfig {
    pub listen_address: SocketAddr,
    pub upstream_address: SocketAddr,
    pub local_address: Option<IpAddr>,
    pub disruption: GrpcDisruption,
}

impl GrpcProxyConfig {
    fn validate(&self) -> AgentResult<()> {
        self.disruption.validate()
    }
}

pub struct GrpcProxy {
    config: GrpcProxyConfig,
    metrics: Arc<MetricMap>,
    rng: Arc<dyn Rng>,
    drain: CancellationToken,
    force: CancellationToken,
}

impl GrpcProxy {
    pub fn new(config: GrpcProxyConfig, rng: Arc<dyn Rng>) -> AgentResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            metrics: Arc::new(MetricMap::new()),
            rng,
            drain: CancellationToken::new(),
            force: CancellationToken::new(),
        })
    }

    pub fn metrics(&self) -> &MetricMap {
        &self.metrics
    }

    pub fn stop(&self) {
        self.drain.cancel();
    }

    pub fn force(&self) {
        self.force.cancel();
        self.drain.cancel();
    }

    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(listen = %self.config.listen_address))]
    pub async fn start(self: Arc<Self>) -> AgentResult<()> {
        let channel = Endpoint::from_shared(format!("http://{}", self.config.upstream_address))
            .map_err(|error| AgentError::Setup(format!("invalid upstream endpoint: {error}")))?
            .connect_with_connector(BoundConnector {
                local_address: self.config.local_address,
            })
            .await
            .map_err(|error| AgentError::Setup(format!("connecting upstream channel: {error}")))?;

        let listener = tokio::net::TcpListener::bind(self.config.listen_address)
            .await
            .map_err(|error| AgentError::Setup(format!("binding {}: {error}", self.config.listen_address)))?;

        let mut tasks = tokio::task::JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.force.cancelled() => break,
                _ = self.drain.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let this = self.clone();
                            let channel = channel.clone();
                            tasks.spawn(async move { this.serve(stream, channel).await });
                        }
                        Err(error) => return Err(AgentError::Runtime(format!("accept failed: {error}"))),
                    }
                }
            }
        }

        if self.force.is_cancelled() {
            tasks.abort_all();
        } else {
            while tasks.join_next().await.is_some() {}
        }

        Ok(())
    }

    async fn serve(self: Arc<Self>, stream: TcpStream, channel: Channel) {
        let io = TokioIo::new(stream);
        let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
            let this = self.clone();
            let channel = channel.clone();
            async move { Ok::<_, std::convert::Infallible>(this.handle(req, channel).await) }
        });

        let executor = hyper_util::rt::TokioExecutor::new();
        if let Err(error) = hyper::server::conn::http2::Builder::new(executor)
            .serve_connection(io, service)
            .await
        {
            tracing::debug!(%error, "grpc connection closed with error");
        }
    }

    async fn handle(
        &self,
        req: hyper::Request<hyper::body::Incoming>,
        channel: Channel,
    ) -> hyper::Response<BoxBody> {
        let path = req.uri().path().to_string();
        let service = GrpcDisruption::service_from_path(&path).unwrap_or("").to_string();
        let excluded = self.config.disruption.is_excluded(&service);
        if excluded {
            self.metrics.increment(REQUESTS_EXCLUDED);
        }

        let handler = PassthroughHandler {
            path,
            channel,
            excluded,
            disruption: self.config.disruption.clone(),
            rng: self.rng.clone(),
            metrics: self.metrics.clone(),
        };

        let mut grpc = GrpcServer::new(RawCodec);
        grpc.streaming(handler, req).await
    }
}

#[derive(Clone)]
struct PassthroughHandler {
    path: String,
    channel: Channel,
    excluded: bool,
    disruption: GrpcDisruption,
    rng: Arc<dyn Rng>,
    metrics: Arc<MetricMap>,
}

type BytesStream = Pin<Box<dyn Stream<Item = Result<Bytes, Status>> + Send>>;
type RequestStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

impl tonic::server::StreamingService<Bytes> for PassthroughHandler {
    type Response = Bytes;
    type ResponseStream = BytesStream;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response<Self::ResponseStream>, Status>> + Send>>;

    fn call(&mut self, request: Request<Streaming<Bytes>>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { handler.forward(request).await })
    }
}

impl PassthroughHandler {
    async fn forward(&self, request: Request<Streaming<Bytes>>) -> Result<Response<BytesStream>, Status> {
        self.metrics.increment(REQUESTS_TOTAL);

        if !self.excluded && self.rng.uniform() <= self.disruption.error_rate {
            self.metrics.increment(REQUESTS_DISRUPTED);
            let mut inbound = request.into_inner();
            while inbound.message().await?.is_some() {}
            return Err(Status::new(
                tonic::Code::from(self.disruption.status_code as i32),
                self.disruption.status_message.clone(),
            ));
        }

        if !self.excluded && !self.disruption.average_delay.is_zero() {
            let delay = delayed(self.disruption.average_delay, self.disruption.delay_variation, self.rng.as_ref());
            tokio::time::sleep(delay).await;
        }

        let metadata = request.metadata().clone();
        let mut inbound = request.into_inner();

        // Pull the client's first message before dialing, matching the
        // "read first message, then forward upstream header metadata"
        // pump ordering; the rest is chained behind it.
        let first = inbound.message().await?;
        let outbound: RequestStream = match first {
            Some(first) => Box::pin(futures::stream::once(async move { first }).chain(
                inbound.filter_map(|item| async move { item.ok() }),
            )),
            None => Box::pin(futures::stream::empty()),
        };

        let path = self
            .path
            .parse::<http::uri::PathAndQuery>()
            .map_err(|error| Status::internal(format!("invalid method path: {error}")))?;

        let mut client = GrpcClient::new(self.channel.clone());
        client.ready().await.map_err(|error| Status::unavailable(format!("upstream unavailable: {error}")))?;

        let mut outbound_request = Request::new(outbound);
        *outbound_request.metadata_mut() = metadata;

        let response = client.streaming(outbound_request, path, RawCodec).await?;
        let (response_metadata, upstream_stream, extensions) = response.into_parts();

        // Forward every upstream message, then the upstream's trailers (if
        // any) as one final item carrying an explicit `Code::Ok` status, so
        // the client-facing stream ends with the same trailer metadata the
        // upstream sent rather than tonic's default empty trailer set.
        let forwarded: BytesStream = Box::pin(futures::stream::unfold(Some(upstream_stream), |state| async move {
            let mut inner = state?;
            match inner.message().await {
                Ok(Some(bytes)) => Some((Ok(bytes), Some(inner))),
                Ok(None) => match inner.trailers().await {
                    Ok(Some(trailers)) => {
                        let mut status = Status::new(tonic::Code::Ok, "");
                        *status.metadata_mut() = trailers;
                        Some((Err(status), None))
                    }
                    _ => None,
                },
                Err(status) => Some((Err(status), None)),
            }
        }));

        Ok(Response::from_parts(response_metadata, forwarded, extensions))
    }
}
