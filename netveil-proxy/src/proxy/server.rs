use super::engine::{FilterCallbacks, ProxyEngine};
use super::session::{content_type_essence, CustomResponse, Session};
use crate::config::PolicyStore;
use crate::error::{ProxyError, Result};
use crate::filter::UrlVerdict;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HeaderMap, HeaderValue, ACCEPT_ENCODING, CACHE_CONTROL, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

type ProxyBody = BoxBody<Bytes, hyper::Error>;
type ProxyResponse = Response<ProxyBody>;

/// Headers that describe a single hop and must not be forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// HTTP proxy server configuration
#[derive(Clone)]
pub struct ProxyServerConfig {
    /// Address to listen on, usually loopback
    pub listen_addr: SocketAddr,
    /// Current policy, consulted for URL categories
    pub policy: Arc<PolicyStore>,
    /// Filtering pipeline
    pub callbacks: Arc<dyn FilterCallbacks>,
}

/// Plain-HTTP forward proxy. `CONNECT` tunnels are judged by host only and
/// relayed without inspection.
pub struct ProxyServer {
    config: ProxyServerConfig,
    running: Arc<AtomicBool>,
    cancel: Mutex<Option<CancellationToken>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ProxyServer {
    pub fn new(config: ProxyServerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|addr| *addr)
    }
}

#[async_trait]
impl ProxyEngine for ProxyServer {
    async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyRunning);
        }

        let listener = match TcpListener::bind(self.config.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let bound = listener.local_addr()?;
        if let Ok(mut addr) = self.local_addr.lock() {
            *addr = Some(bound);
        }

        let token = CancellationToken::new();
        if let Ok(mut cancel) = self.cancel.lock() {
            *cancel = Some(token.clone());
        }

        let handler = Arc::new(Handler {
            policy: self.config.policy.clone(),
            callbacks: self.config.callbacks.clone(),
            client: Client::builder(TokioExecutor::new()).build_http(),
        });

        info!("Proxy listening on {}", bound);
        tokio::spawn(accept_loop(listener, handler, token, self.running.clone()));
        Ok(())
    }

    fn stop(&self) {
        if let Some(token) = self.cancel.lock().ok().and_then(|mut c| c.take()) {
            token.cancel();
            info!("Proxy stopping");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<Handler>,
    token: CancellationToken,
    running: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };

                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler.handle(req).await) }
                    });

                    if let Err(e) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(TokioIo::new(stream), service)
                        .with_upgrades()
                        .await
                    {
                        debug!("Connection from {} ended: {}", peer, e);
                    }
                });
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!("Accept loop finished");
}

struct Handler {
    policy: Arc<PolicyStore>,
    callbacks: Arc<dyn FilterCallbacks>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Handler {
    async fn handle(&self, req: Request<Incoming>) -> ProxyResponse {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }

        match self.handle_http(req).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Forwarding failed: {}", e);
                plain_response(StatusCode::BAD_GATEWAY, "upstream request failed")
            }
        }
    }

    async fn handle_connect(&self, req: Request<Incoming>) -> ProxyResponse {
        let Some(authority) = req.uri().authority().cloned() else {
            return plain_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
        };
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(443);

        let Ok(url) = Url::parse(&format!("https://{}:{}/", host, port)) else {
            return plain_response(StatusCode::BAD_REQUEST, "invalid CONNECT target");
        };
        let mut session = Session::new(Method::CONNECT, url).with_request_headers(req.headers().clone());

        if self.callbacks.before_request(&mut session).await {
            if let Some(custom) = session.take_custom_response() {
                return refuse_tunnel(custom_to_response(custom));
            }
        }
        if let Some(response) = self.apply_url_verdict(&mut session) {
            return refuse_tunnel(response);
        }

        debug!("CONNECT tunnel to {}:{}", host, port);
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    debug!("Upgrade failed for {}:{}: {}", host, port, e);
                    return;
                }
            };

            match TcpStream::connect((host.as_str(), port)).await {
                Ok(mut remote) => {
                    let mut client = TokioIo::new(upgraded);
                    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut remote).await {
                        debug!("Tunnel error: {}", e);
                    }
                    debug!("Tunnel closed for {}:{}", host, port);
                }
                Err(e) => debug!("Remote connection failed to {}:{}: {}", host, port, e),
            }
        });

        Response::new(full(Bytes::new()))
    }

    async fn handle_http(&self, req: Request<Incoming>) -> Result<ProxyResponse> {
        let (parts, body) = req.into_parts();
        let url = Url::parse(&parts.uri.to_string())
            .map_err(|e| ProxyError::Upstream(format!("request is not absolute-form: {e}")))?;

        let mut session =
            Session::new(parts.method.clone(), url).with_request_headers(parts.headers.clone());

        if self.callbacks.before_request(&mut session).await {
            if let Some(custom) = session.take_custom_response() {
                return Ok(custom_to_response(custom));
            }
        }
        if let Some(response) = self.apply_url_verdict(&mut session) {
            return Ok(response);
        }

        let body = body
            .collect()
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?
            .to_bytes();
        let mut upstream = Request::from_parts(parts, Full::new(body));
        strip_hop_by_hop(upstream.headers_mut());
        // Bodies are scanned as text, so ask for them uncompressed
        upstream.headers_mut().remove(ACCEPT_ENCODING);

        let response = self
            .client
            .request(upstream)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;
        let (mut response_parts, response_body) = response.into_parts();
        strip_hop_by_hop(&mut response_parts.headers);

        let inspected = content_type_essence(&response_parts.headers)
            .is_some_and(|ct| self.callbacks.inspects_content_type(&ct));
        let (buffered, rest) = if inspected {
            let limit = self
                .policy
                .snapshot()
                .map(|p| p.config.content.max_buffered_bytes())
                .unwrap_or_default();
            buffer_prefix(response_body, limit).await?
        } else {
            (Bytes::new(), Some(response_body))
        };

        session.set_response(
            response_parts.status.as_u16(),
            response_parts.headers.clone(),
            buffered.clone(),
        );
        if inspected && rest.is_some() {
            session.mark_response_truncated();
        }
        self.callbacks.before_response(&mut session).await;

        if let Some(custom) = session.take_custom_response() {
            return Ok(custom_to_response(custom));
        }
        let body = match rest {
            Some(rest) => Resumed {
                prefix: Some(buffered).filter(|b| !b.is_empty()),
                rest,
            }
            .boxed(),
            None => full(buffered),
        };
        Ok(Response::from_parts(response_parts, body))
    }

    /// Consult the URL categories; returns a response when the request is blocked
    fn apply_url_verdict(&self, session: &mut Session) -> Option<ProxyResponse> {
        let policy = self.policy.snapshot()?;
        let relaxed = self.policy.is_bypass_enabled();

        match policy.engine.classify(session.host(), session.ip(), relaxed) {
            UrlVerdict::Blacklisted(categories) => {
                self.callbacks.blacklisted(session, &categories);
                session.take_custom_response().map(custom_to_response)
            }
            UrlVerdict::Whitelisted(categories) => {
                self.callbacks.whitelisted(session, &categories);
                None
            }
            UrlVerdict::Unmatched => None,
        }
    }
}

/// Buffer the body until it ends or exceeds `limit` bytes. The unread
/// remainder is returned when the limit was exceeded.
async fn buffer_prefix(mut body: Incoming, limit: usize) -> Result<(Bytes, Option<Incoming>)> {
    let mut buffered = BytesMut::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProxyError::Upstream(e.to_string()))?;
        if let Ok(data) = frame.into_data() {
            buffered.extend_from_slice(&data);
            if buffered.len() > limit {
                return Ok((buffered.freeze(), Some(body)));
            }
        }
    }
    Ok((buffered.freeze(), None))
}

/// Already-read prefix followed by the rest of the upstream body
struct Resumed {
    prefix: Option<Bytes>,
    rest: Incoming,
}

impl Body for Resumed {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, hyper::Error>>> {
        if let Some(prefix) = self.prefix.take() {
            return Poll::Ready(Some(Ok(Frame::data(prefix))));
        }
        Pin::new(&mut self.rest).poll_frame(cx)
    }
}

fn full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn custom_to_response(custom: CustomResponse) -> ProxyResponse {
    let mut response = Response::new(full(custom.body));
    *response.status_mut() = StatusCode::from_u16(custom.status).unwrap_or(StatusCode::OK);
    if let Ok(value) = HeaderValue::from_str(&custom.content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
        .headers_mut()
        .insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// A 2xx reply to `CONNECT` would open the tunnel, so a block must not succeed
fn refuse_tunnel(mut response: ProxyResponse) -> ProxyResponse {
    if response.status().is_success() {
        *response.status_mut() = StatusCode::FORBIDDEN;
    }
    response
}

fn plain_response(status: StatusCode, message: &'static str) -> ProxyResponse {
    custom_to_response(CustomResponse {
        status: status.as_u16(),
        content_type: "text/plain".to_string(),
        body: Bytes::from_static(message.as_bytes()),
    })
}
