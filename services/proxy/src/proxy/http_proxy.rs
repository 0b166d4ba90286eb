//! HTTP proxy engine behind the single listening port.
//!
//! Connections classified as HTTP are pushed onto a channel by
//! [`HttpProxyHandler::handle`]. [`HttpProxyServer::start`] serves that
//! channel with hyper as if it were a listener:
//!
//! ```text
//! Dispatcher -> HttpProxyHandler -> channel -> HttpProxyServer (hyper)
//! ```
//!
//! The engine tunnels `CONNECT host:port` and forwards absolute-form
//! requests for other methods.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;

use hyper::client::HttpConnector;
use hyper::header::{self, HeaderMap, HeaderName};
use hyper::server::accept;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode};
use sockmux_socks5::BoxedConn;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::handler::HandlerError;

/// Headers that apply to a single hop and are not forwarded.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "upgrade",
];

/// Hands HTTP connections to the engine. Cheap to clone.
#[derive(Clone)]
pub struct HttpProxyHandler {
    tx: mpsc::UnboundedSender<BoxedConn>,
}

impl HttpProxyHandler {
    /// Create the handler and the engine that consumes its connections.
    pub fn new() -> (Self, HttpProxyServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, HttpProxyServer { rx })
    }

    /// Queue `conn` for the engine and return immediately.
    pub fn handle(&self, conn: BoxedConn) -> Result<(), HandlerError> {
        self.tx.send(conn).map_err(|_| HandlerError::HttpProxyClosed)
    }
}

/// The HTTP proxy engine. Its accept source is the handler's channel
/// rather than a socket.
pub struct HttpProxyServer {
    rx: mpsc::UnboundedReceiver<BoxedConn>,
}

impl HttpProxyServer {
    /// Serve handed-off connections until every [`HttpProxyHandler`] clone
    /// is dropped.
    ///
    /// `listen_addr` is the bound address of the real listener the
    /// connections arrive on; it is only used for logging.
    pub async fn start(self, listen_addr: SocketAddr) -> hyper::Result<()> {
        info!(listen_addr = %listen_addr, "HTTP proxy engine started");

        let incoming = UnboundedReceiverStream::new(self.rx).map(Ok::<_, io::Error>);
        let client = Client::new();

        let make_service = make_service_fn(move |_conn: &BoxedConn| {
            let client = client.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| proxy(client.clone(), req)))
            }
        });

        let result = Server::builder(accept::from_stream(incoming))
            .serve(make_service)
            .await;

        info!(listen_addr = %listen_addr, "HTTP proxy engine stopped");
        result
    }
}

/// Serve one proxied request.
async fn proxy(
    client: Client<HttpConnector>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    debug!(method = %req.method(), uri = %req.uri(), "HTTP proxy request");

    if req.method() == Method::CONNECT {
        return Ok(tunnel(req).await);
    }
    Ok(forward(client, req).await)
}

/// Answer a CONNECT request and splice the upgraded connection to the
/// target.
async fn tunnel(req: Request<Body>) -> Response<Body> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return status_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
    };

    let mut target = match TcpStream::connect(authority.as_str()).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(target = %authority, error = %e, "CONNECT dial failed");
            return status_response(StatusCode::BAD_GATEWAY, "couldn't reach target");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(mut upgraded) => {
                match tokio::io::copy_bidirectional(&mut upgraded, &mut target).await {
                    Ok((to_target, to_client)) => debug!(
                        target = %authority,
                        bytes_to_target = to_target,
                        bytes_to_client = to_client,
                        "CONNECT tunnel closed"
                    ),
                    Err(e) => debug!(target = %authority, error = %e, "CONNECT tunnel ended"),
                }
            }
            Err(e) => debug!(target = %authority, error = %e, "CONNECT upgrade failed"),
        }
    });

    Response::new(Body::empty())
}

/// Forward an absolute-form request to its origin.
async fn forward(client: Client<HttpConnector>, mut req: Request<Body>) -> Response<Body> {
    if req.uri().scheme().is_none() || req.uri().authority().is_none() {
        return status_response(
            StatusCode::BAD_REQUEST,
            "This is a proxy server. Does not respond to non-proxy requests.",
        );
    }

    strip_hop_by_hop(req.headers_mut());

    match client.request(req).await {
        Ok(mut resp) => {
            strip_hop_by_hop(resp.headers_mut());
            resp
        }
        Err(e) => {
            debug!(error = %e, "Upstream request failed");
            status_response(StatusCode::BAD_GATEWAY, "upstream request failed")
        }
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn status_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut resp = Response::new(Body::from(message));
    *resp.status_mut() = status;
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert(header::HOST, HeaderValue::from_static("example.com"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key(header::HOST));
    }

    #[tokio::test]
    async fn test_origin_form_rejected() {
        let req = Request::get("/index.html").body(Body::empty()).unwrap();
        let resp = proxy(Client::new(), req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_is_bad_gateway() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = Request::builder()
            .method(Method::CONNECT)
            .uri(addr.to_string())
            .body(Body::empty())
            .unwrap();
        let resp = proxy(Client::new(), req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_forward_absolute_form() {
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = origin.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_lowercase();
            assert!(!request.contains("proxy-connection"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                .await
                .unwrap();
        });

        let req = Request::get(format!("http://{origin_addr}/"))
            .header("proxy-connection", "keep-alive")
            .body(Body::empty())
            .unwrap();
        let resp = proxy(Client::new(), req).await.unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.headers().contains_key(header::CONNECTION));
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_handle_fails_once_engine_dropped() {
        let (handler, server) = HttpProxyHandler::new();
        drop(server);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        assert!(matches!(
            handler.handle(Box::new(stream)),
            Err(HandlerError::HttpProxyClosed)
        ));
    }
}
