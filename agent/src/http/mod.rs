//! C3a: a transparent HTTP proxy that decides exclude / inject-error /
//! forward per request, then applies delay, preserving upstream headers
//! when not injecting.

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Incoming,
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::disruption::HttpDisruption;
use crate::error::{AgentError, AgentResult};
use crate::metrics::{MetricMap, REQUESTS_DISRUPTED, REQUESTS_EXCLUDED, REQUESTS_TOTAL};
use crate::rng::{delayed, Rng};

#[derive(Debug, thiserror::Error)]
enum TransportError {
    #[error("dialing upstream {upstream}: {source}")]
    Dial { upstream: SocketAddr, source: std::io::Error },
    #[error("upstream handshake: {0}")]
    Handshake(hyper::Error),
    #[error("upstream request: {0}")]
    Request(hyper::Error),
}

/// `{listen_address, upstream_address, local_address, disruption}`.
#[derive(Debug, Clone)]
pub struct HttpProxyConfig {
    pub listen_address: SocketAddr,
    pub upstream_address: SocketAddr,
    /// Source address the upstream dial is bound to, so the interceptor's
    /// netfilter rules (matching on source) exclude this traffic.
    pub local_address: Option<std::net::IpAddr>,
    pub disruption: HttpDisruption,
}

impl HttpProxyConfig {
    fn validate(&self) -> AgentResult<()> {
        self.disruption.validate()
    }
}

/// Listens on `listen_address`, forwarding to `upstream_address` unless
/// excluded or disrupted. `Start` blocks serving; `Stop` drains in-flight
/// requests, `Force` aborts them; both are idempotent.
pub struct HttpProxy {
    config: HttpProxyConfig,
    metrics: Arc<MetricMap>,
    rng: Arc<dyn Rng>,
    drain: CancellationToken,
    force: CancellationToken,
}

impl HttpProxy {
    pub fn new(config: HttpProxyConfig, rng: Arc<dyn Rng>) -> AgentResult<Self> {
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

    /// Blocks accepting and serving connections until `stop`/`force` is
    /// called. Not reentrant.
    #[tracing::instrument(level = Level::DEBUG, skip(self), fields(listen = %self.config.listen_address))]
    pub async fn start(self: Arc<Self>) -> AgentResult<()> {
        let listener = TcpListener::bind(self.config.listen_address)
            .await
            .map_err(|error| AgentError::Setup(format!("binding {}: {error}", self.config.listen_address)))?;

        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = self.force.cancelled() => break,
                _ = self.drain.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _peer)) => {
                            let this = self.clone();
                            tasks.spawn(async move { this.serve(stream).await });
                        }
                        Err(error) => {
                            return Err(AgentError::Runtime(format!("accept failed: {error}")));
                        }
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

    /// Stops accepting new connections; in-flight requests are allowed to
    /// finish. Idempotent.
    pub fn stop(&self) {
        self.drain.cancel();
    }

    /// Stops accepting and aborts in-flight connections immediately. Idempotent.
    pub fn force(&self) {
        self.force.cancel();
        self.drain.cancel();
    }

    async fn serve(self: Arc<Self>, stream: TcpStream) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let this = self.clone();
            async move { this.handle(req).await }
        });

        if let Err(error) = http1::Builder::new().serve_connection(io, service).await {
            tracing::debug!(%error, "connection closed with error");
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path().to_string();
        let excluded = self.config.disruption.is_excluded(&path);
        if excluded {
            self.metrics.increment(REQUESTS_EXCLUDED);
        }

        let response = if !excluded && self.rng.uniform() <= self.config.disruption.error_rate {
            self.metrics.increment(REQUESTS_DISRUPTED);
            synthesized_error(&self.config.disruption)
        } else {
            match self.forward(req).await {
                Ok(response) => response,
                Err(error) => text_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
            }
        };

        if !excluded && !self.config.disruption.average_delay.is_zero() {
            let delay = delayed(
                self.config.disruption.average_delay,
                self.config.disruption.delay_variation,
                self.rng.as_ref(),
            );
            tokio::time::sleep(delay).await;
        }

        self.metrics.increment(REQUESTS_TOTAL);
        Ok(response)
    }

    /// Dials the upstream bound to `local_address`, rewrites the Host
    /// header to the upstream, and copies the response back verbatim.
    async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<Full<Bytes>>, TransportError> {
        let upstream = self.config.upstream_address;
        let stream = self.dial(upstream).await?;

        let host_value = hyper::header::HeaderValue::from_str(&upstream.to_string())
            .unwrap_or_else(|_| hyper::header::HeaderValue::from_static(""));
        req.headers_mut().insert(hyper::header::HOST, host_value);

        let io = TokioIo::new(stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(TransportError::Handshake)?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::debug!(%error, "upstream connection closed with error");
            }
        });

        let response = sender.send_request(req).await.map_err(TransportError::Request)?;
        let (parts, body) = response.into_parts();
        let collected = body.collect().await.map_err(TransportError::Request)?.to_bytes();

        Ok(Response::from_parts(parts, Full::new(collected)))
    }

    async fn dial(&self, upstream: SocketAddr) -> Result<TcpStream, TransportError> {
        let socket = if upstream.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|source| TransportError::Dial { upstream, source })?;

        if let Some(local_address) = self.config.local_address {
            socket
                .bind(SocketAddr::new(local_address, 0))
                .map_err(|source| TransportError::Dial { upstream, source })?;
        }

        socket
            .connect(upstream)
            .await
            .map_err(|source| TransportError::Dial { upstream, source })
    }
}

fn synthesized_error(disruption: &HttpDisruption) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::from_u16(disruption.error_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .body(Full::new(Bytes::from(disruption.error_body.clone())))
        .expect("synthesized error response is well-formed")
}

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)))
        .expect("text response is well-formed")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::rng::SeededRng;

    fn disruption() -> HttpDisruption {
        HttpDisruption {
            average_delay: Duration::ZERO,
            delay_variation: Duration::ZERO,
            error_rate: 0.0,
            error_code: 0,
            error_body: vec![],
            excluded_paths: vec!["/healthz".to_string()],
        }
    }

    #[tokio::test]
    async fn rejects_invalid_construction() {
        let mut bad = disruption();
        bad.error_rate = 2.0;
        let config = HttpProxyConfig {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            upstream_address: "127.0.0.1:1".parse().unwrap(),
            local_address: None,
            disruption: bad,
        };
        assert!(HttpProxy::new(config, Arc::new(SeededRng::new(1))).is_err());
    }

    #[tokio::test]
    async fn forwards_and_returns_upstream_body_verbatim() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = upstream_listener.accept().await.unwrap();
            let io = TokioIo::new(stream);
            let service = service_fn(|_req: Request<Incoming>| async {
                Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"pong"))))
            });
            let _ = http1::Builder::new().serve_connection(io, service).await;
        });

        let listen_probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listen_probe.local_addr().unwrap();
        drop(listen_probe);

        let proxy = Arc::new(
            HttpProxy::new(
                HttpProxyConfig {
                    listen_address: listen_addr,
                    upstream_address: upstream_addr,
                    local_address: None,
                    disruption: disruption(),
                },
                Arc::new(SeededRng::new(1)),
            )
            .unwrap(),
        );
        let handle = tokio::spawn(proxy.clone().start());

        // Give the accept loop a moment to bind and start listening.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client_stream = TcpStream::connect(listen_addr).await.unwrap();
        let io = TokioIo::new(client_stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await.unwrap();
        tokio::spawn(connection);

        let req = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();
        let response = sender.send_request(req).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"pong");
        assert_eq!(proxy.metrics().requests_total(), 1);

        proxy.force();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn excluded_paths_bypass_error_injection_and_delay() {
        let mut disruption = disruption();
        disruption.error_rate = 1.0;
        disruption.error_code = 500;
        disruption.average_delay = Duration::from_secs(10);

        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match upstream_listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let io = TokioIo::new(stream);
                let service = service_fn(|_req: Request<Incoming>| async {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"ok"))))
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            }
        });

        let listen_probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listen_probe.local_addr().unwrap();
        drop(listen_probe);

        let proxy = Arc::new(
            HttpProxy::new(
                HttpProxyConfig {
                    listen_address: listen_addr,
                    upstream_address: upstream_addr,
                    local_address: None,
                    disruption,
                },
                Arc::new(SeededRng::new(7)),
            )
            .unwrap(),
        );
        let handle = tokio::spawn(proxy.clone().start());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client_stream = TcpStream::connect(listen_addr).await.unwrap();
        let io = TokioIo::new(client_stream);
        let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await.unwrap();
        tokio::spawn(connection);

        let req = Request::builder().uri("/healthz").body(Full::new(Bytes::new())).unwrap();
        let response = tokio::time::timeout(Duration::from_secs(1), sender.send_request(req))
            .await
            .expect("excluded request must not be delayed")
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(proxy.metrics().get(REQUESTS_EXCLUDED), 1);
        assert_eq!(proxy.metrics().get(REQUESTS_DISRUPTED), 0);

        proxy.force();
        let _ = handle.await;
    }
}
