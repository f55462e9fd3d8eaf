use crate::errors::PeerError;
use bytes::Bytes;
use http::uri::{Authority, PathAndQuery};
use http::{HeaderMap, Method, Uri};
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use shared::headers::prepare_forwarded;
use std::time::Duration;
use tokio::time::timeout;

pub type PeerClient = Client<HttpConnector, Full<Bytes>>;

pub fn build_client() -> PeerClient {
    let mut conn = HttpConnector::new();
    conn.set_nodelay(true);
    Client::builder(TokioExecutor::new()).build(conn)
}

/// The parts of an inbound request that are replayed against every peer.
///
/// The body is fully buffered so the same request can be sent to several
/// peers concurrently.
#[derive(Clone, Debug)]
pub struct ForwardRequest {
    method: Method,
    path_and_query: PathAndQuery,
    headers: HeaderMap,
    body: Bytes,
}

impl ForwardRequest {
    pub fn new(request: Request<Bytes>) -> Self {
        let (mut parts, body) = request.into_parts();
        prepare_forwarded(&mut parts.headers, parts.version);

        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        ForwardRequest {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body,
        }
    }

    /// The path is passed on byte for byte; dot segments and escapes are the
    /// peer's business.
    fn to_peer_request(&self, peer: &str) -> Result<Request<Full<Bytes>>, PeerError> {
        let authority: Authority = peer.parse().map_err(|e: http::uri::InvalidUri| {
            PeerError::InvalidAddress {
                peer: peer.to_string(),
                reason: e.to_string(),
            }
        })?;
        let uri = Uri::builder()
            .scheme("http")
            .authority(authority)
            .path_and_query(self.path_and_query.clone())
            .build()
            .map_err(|e| PeerError::BuildRequest {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        let mut builder = Request::builder()
            .method(self.method.clone())
            .uri(uri);

        for (name, value) in self.headers.iter() {
            // The client derives Host from the peer URI
            if name != http::header::HOST {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Full::new(self.body.clone()))
            .map_err(|e| PeerError::BuildRequest {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Sends `request` to a single peer and collects the whole response.
///
/// `peer_timeout` covers connecting, sending and reading the complete body.
/// Any status is returned as-is; deciding whether it counts as an answer is up
/// to the caller.
pub async fn send_to_peer(
    client: &PeerClient,
    peer: &str,
    request: &ForwardRequest,
    peer_timeout: Duration,
) -> Result<Response<Bytes>, PeerError> {
    let outbound = request.to_peer_request(peer)?;

    let exchange = async {
        let response = client
            .request(outbound)
            .await
            .map_err(|e| PeerError::Transport {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        let (mut parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| PeerError::ResponseBody {
                peer: peer.to_string(),
                reason: e.to_string(),
            })?;

        prepare_forwarded(&mut parts.headers, parts.version);

        Ok::<_, PeerError>(Response::from_parts(parts, body))
    };

    timeout(peer_timeout, exchange)
        .await
        .map_err(|_| PeerError::Timeout(peer.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    // Echoes the method, path and body back so the forwarded request can be checked
    async fn echo_handler(
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (mut parts, body) = req.into_parts();
        parts.headers.remove(http::header::CONTENT_LENGTH);
        let body = body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();

        let echoed = format!(
            "{} {} {}",
            parts.method,
            parts.uri,
            String::from_utf8_lossy(&body)
        );
        let mut response = Response::new(Full::new(Bytes::from(echoed)));
        *response.headers_mut() = parts.headers;
        Ok(response)
    }

    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service_fn(echo_handler))
                        .await;
                });
            }
        });

        addr.to_string()
    }

    #[tokio::test]
    async fn test_send_to_peer_forwards_request() {
        let peer = start_echo_server().await;
        let client = build_client();

        let request = Request::builder()
            .method("POST")
            .uri("http://localhost/shards/7?key=abc")
            .header("connection", "keep-alive")
            .header("x-custom", "test-value")
            .body(Bytes::from_static(b"payload"))
            .unwrap();
        let request = ForwardRequest::new(request);

        let response = send_to_peer(&client, &peer, &request, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(
            response.body().as_ref(),
            b"POST /shards/7?key=abc payload"
        );
        // Echoed request headers: hop-by-hop removed, custom kept, Via added on the way out
        assert_eq!(response.headers().get("x-custom").unwrap(), "test-value");
        assert!(!response.headers().contains_key("connection"));
        assert!(
            response
                .headers()
                .get("via")
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("1.1 shardgate")
        );
    }

    #[tokio::test]
    async fn test_send_to_peer_keeps_path_verbatim() {
        let peer = start_echo_server().await;
        let client = build_client();

        for path in ["/shards/a/../b", "/shards/%2e%2e/secret", "/shards/./c?key=a/../b"] {
            let request = Request::builder()
                .method("GET")
                .uri(path)
                .body(Bytes::new())
                .unwrap();
            let request = ForwardRequest::new(request);

            let response = send_to_peer(&client, &peer, &request, Duration::from_secs(5))
                .await
                .unwrap();

            assert_eq!(
                String::from_utf8_lossy(response.body()),
                format!("GET {path} ")
            );
        }
    }

    #[tokio::test]
    async fn test_send_to_peer_timeout() {
        let client = build_client();
        let request = ForwardRequest::new(Request::new(Bytes::new()));

        // Non-routable address, the connect never completes
        let result =
            send_to_peer(&client, "192.0.2.1:9999", &request, Duration::from_millis(50)).await;

        assert!(matches!(result, Err(PeerError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_send_to_peer_invalid_address() {
        let client = build_client();
        let request = ForwardRequest::new(Request::new(Bytes::new()));

        let result = send_to_peer(&client, "not a host", &request, Duration::from_secs(1)).await;

        assert!(matches!(result, Err(PeerError::InvalidAddress { .. })));
    }
}
