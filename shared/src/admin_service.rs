use crate::http::make_boxed_error_response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Liveness and readiness endpoints served on the admin listener.
///
/// `/health` always answers once the process is up; `/ready` asks the
/// readiness callback, which the proxy wires to "has at least one peer".
pub struct AdminService<F, E> {
    is_ready: F,
    _error: PhantomData<E>,
}

impl<F, E> AdminService<F, E>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self {
            is_ready,
            _error: PhantomData,
        }
    }
}

impl<F, E> Service<Request<Incoming>> for AdminService<F, E>
where
    F: Fn() -> bool + Send + 'static,
    E: Send + 'static,
{
    type Response = Response<BoxBody<Bytes, E>>;
    type Error = E;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let response = route(req.uri().path(), || (self.is_ready)());
        Box::pin(async move { Ok(response) })
    }
}

fn route<E>(path: &str, is_ready: impl FnOnce() -> bool) -> Response<BoxBody<Bytes, E>> {
    let ok = || Response::new(Full::new(Bytes::from("ok\n")).map_err(|e| match e {}).boxed());

    match path {
        "/health" => ok(),
        "/ready" if is_ready() => ok(),
        "/ready" => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_routes() {
        assert_eq!(route::<Infallible>("/health", || false).status(), StatusCode::OK);
        assert_eq!(route::<Infallible>("/ready", || true).status(), StatusCode::OK);
        assert_eq!(
            route::<Infallible>("/ready", || false).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            route::<Infallible>("/metrics", || true).status(),
            StatusCode::NOT_FOUND
        );
    }
}
