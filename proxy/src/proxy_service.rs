use crate::errors::{ProxyError, ServiceError};
use crate::fallback::FallbackProxy;
use crate::metrics_defs::REQUESTS_INFLIGHT;
use crate::peers::PeerSource;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::Service as HyperService;
use hyper::{Request, Response, StatusCode};
use shared::gauge;
use shared::http::make_error_response;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Forwards every inbound request to the peers its `PeerSource` names.
pub struct ProxyService<P> {
    engine: FallbackProxy,
    peers: Arc<P>,
}

impl<P> ProxyService<P>
where
    P: PeerSource + 'static,
{
    pub fn new(engine: FallbackProxy, peers: Arc<P>) -> Self {
        Self { engine, peers }
    }
}

impl<P> HyperService<Request<Incoming>> for ProxyService<P>
where
    P: PeerSource + 'static,
{
    type Response = Response<BoxBody<Bytes, ServiceError>>;
    type Error = ServiceError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let engine = self.engine.clone();
        let peers = self.peers.clone();

        Box::pin(async move {
            gauge!(REQUESTS_INFLIGHT).increment(1);

            let (parts, body) = req.into_parts();
            // Every attempted peer needs its own copy of the body
            let response = match body.collect().await {
                Ok(collected) => {
                    let request = Request::from_parts(parts, collected.to_bytes());
                    forward(&engine, peers.as_ref(), request).await
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read request body");
                    make_error_response(StatusCode::BAD_REQUEST)
                }
            };

            gauge!(REQUESTS_INFLIGHT).decrement(1);
            Ok(response.map(|body| Full::new(body).map_err(|e| match e {}).boxed()))
        })
    }
}

async fn forward<P: PeerSource>(
    engine: &FallbackProxy,
    peers: &P,
    request: Request<Bytes>,
) -> Response<Bytes> {
    let (parts, body) = request.into_parts();
    let peer_list = peers.peers_for(&parts);
    let path = parts.uri.path().to_string();

    match engine
        .proxy_request(Request::from_parts(parts, body), &peer_list)
        .await
    {
        Ok(response) => response,
        Err(e @ ProxyError::Timeout) => {
            tracing::warn!(path, peers = peer_list.len(), error = %e, "proxying failed");
            make_error_response(StatusCode::GATEWAY_TIMEOUT)
        }
        Err(e @ ProxyError::NoAvailablePeers) => {
            tracing::warn!(path, peers = peer_list.len(), error = %e, "proxying failed");
            make_error_response(StatusCode::BAD_GATEWAY)
        }
    }
}
