//! Hedged, staged fallback across an ordered list of peers.
//!
//! A proxied request is first sent to the highest priority peer. Every time a
//! stage timeout passes without an answer the next peer is tried as well, while
//! earlier attempts keep running; a failed attempt moves on to the next peer
//! right away. The first legitimate answer from any attempt wins.
//!
//! ```text
//!   t=0        stage        2*stage      deadline
//!   |-- peer 0 ---------------------------|
//!              |-- peer 1 ----------------|
//!                  x fails
//!                  |-- peer 2 ------------|
//! ```
//!
//! Three outcomes are possible: the winning response, `NoAvailablePeers` once
//! every attempt failed and no peer is left, or `Timeout` once the overall
//! deadline passes with attempts still pending. Attempts still running when
//! the call resolves are detached, not aborted; the peer timeout bounds them.

use crate::config::ProxyTimeouts;
use crate::errors::{PeerError, ProxyError};
use crate::http::{ForwardRequest, PeerClient, build_client, send_to_peer};
use crate::metrics_defs::{
    PROXY_REQUEST_DURATION, PROXY_REQUESTS, PROXY_STAGE_FAILURES, PROXY_STAGES_STARTED,
    PROXY_WINNING_STAGE,
};
use bytes::Bytes;
use hyper::{Request, Response};
use shared::{counter, histogram};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep_until};

/// Result of one stage attempt against one peer.
struct StageOutcome {
    stage: usize,
    peer: String,
    result: Result<Response<Bytes>, PeerError>,
}

enum RaceEvent {
    DeadlineReached,
    StageElapsed,
    Completed(Result<StageOutcome, JoinError>),
}

#[derive(Clone)]
pub struct FallbackProxy {
    client: PeerClient,
    timeouts: ProxyTimeouts,
}

impl FallbackProxy {
    pub fn new(timeouts: ProxyTimeouts) -> Self {
        Self::with_client(build_client(), timeouts)
    }

    pub fn with_client(client: PeerClient, timeouts: ProxyTimeouts) -> Self {
        Self { client, timeouts }
    }

    pub fn timeouts(&self) -> &ProxyTimeouts {
        &self.timeouts
    }

    /// Sends `request` to `peers` in priority order and returns the first
    /// legitimate answer.
    pub async fn proxy_request(
        &self,
        request: Request<Bytes>,
        peers: &[String],
    ) -> Result<Response<Bytes>, ProxyError> {
        let started = Instant::now();
        let result = self.race(ForwardRequest::new(request), peers).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(ProxyError::Timeout) => "timeout",
            Err(ProxyError::NoAvailablePeers) => "no_available_peers",
        };
        counter!(PROXY_REQUESTS, "outcome" => outcome).increment(1);
        histogram!(PROXY_REQUEST_DURATION, "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());

        result
    }

    async fn race(
        &self,
        request: ForwardRequest,
        peers: &[String],
    ) -> Result<Response<Bytes>, ProxyError> {
        let Some(first) = peers.first() else {
            return Err(ProxyError::NoAvailablePeers);
        };

        let request = Arc::new(request);
        let deadline = Instant::now() + self.timeouts.overall();
        let mut in_flight = JoinSet::new();

        self.start_stage(&mut in_flight, &request, 0, first);
        let mut next_stage = 1;

        let deadline_timer = sleep_until(deadline);
        let stage_timer = sleep_until(Instant::now() + self.timeouts.stage());
        tokio::pin!(deadline_timer);
        tokio::pin!(stage_timer);

        loop {
            // The deadline takes priority over everything else, so a stage
            // timer expiring in the same instant never starts another peer.
            let event = tokio::select! {
                biased;
                _ = &mut deadline_timer => RaceEvent::DeadlineReached,
                Some(joined) = in_flight.join_next() => RaceEvent::Completed(joined),
                _ = &mut stage_timer, if next_stage < peers.len() => RaceEvent::StageElapsed,
            };

            match event {
                RaceEvent::DeadlineReached => {
                    tracing::warn!(
                        pending = in_flight.len(),
                        started = next_stage,
                        "proxy deadline reached without an answer"
                    );
                    in_flight.detach_all();
                    return Err(ProxyError::Timeout);
                }
                RaceEvent::Completed(joined) => match settle(joined) {
                    Ok((stage, peer, response)) => {
                        tracing::debug!(stage, peer = %peer, status = %response.status(), "proxied request answered");
                        histogram!(PROXY_WINNING_STAGE).record(stage as f64);
                        in_flight.detach_all();
                        return Ok(response);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "proxy stage failed");
                        counter!(PROXY_STAGE_FAILURES, "kind" => e.kind()).increment(1);
                    }
                },
                RaceEvent::StageElapsed => {
                    tracing::debug!(stage = next_stage - 1, "stage timeout elapsed, hedging");
                }
            }

            // A failure or an elapsed stage both move on to the next peer, as
            // long as there is one and the deadline has not passed yet.
            if next_stage < peers.len() && Instant::now() < deadline {
                self.start_stage(&mut in_flight, &request, next_stage, &peers[next_stage]);
                next_stage += 1;
                stage_timer
                    .as_mut()
                    .reset(Instant::now() + self.timeouts.stage());
            }

            if in_flight.is_empty() {
                return if next_stage < peers.len() {
                    Err(ProxyError::Timeout)
                } else {
                    Err(ProxyError::NoAvailablePeers)
                };
            }
        }
    }

    fn start_stage(
        &self,
        in_flight: &mut JoinSet<StageOutcome>,
        request: &Arc<ForwardRequest>,
        stage: usize,
        peer: &str,
    ) {
        tracing::debug!(stage, peer, "starting proxy stage");
        counter!(PROXY_STAGES_STARTED).increment(1);

        let client = self.client.clone();
        let request = request.clone();
        let peer = peer.to_string();
        let peer_timeout = self.timeouts.peer();

        in_flight.spawn(async move {
            let result = send_to_peer(&client, &peer, &request, peer_timeout).await;
            StageOutcome {
                stage,
                peer,
                result,
            }
        });
    }
}

/// Turns a finished attempt into either the winning answer or a stage failure.
///
/// Only transport failures and server faults (5xx) are failures; any other
/// status, 4xx included, is the peer's legitimate answer.
fn settle(
    joined: Result<StageOutcome, JoinError>,
) -> Result<(usize, String, Response<Bytes>), PeerError> {
    let outcome = joined.map_err(|e| PeerError::Task(e.to_string()))?;
    let response = outcome.result?;

    if response.status().is_server_error() {
        return Err(PeerError::ServerFault {
            peer: outcome.peer,
            status: response.status(),
        });
    }

    Ok((outcome.stage, outcome.peer, response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper_util::rt::{TokioExecutor, TokioIo};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct TestPeer {
        addr: String,
        hits: Arc<AtomicUsize>,
    }

    impl TestPeer {
        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    /// Starts a peer that waits `delay` and then answers with `status` and `body`.
    async fn start_peer(delay: Duration, status: u16, body: &'static str) -> TestPeer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let hits = Arc::new(AtomicUsize::new(0));
        let server_hits = hits.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let hits = server_hits.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<hyper::body::Incoming>| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        async move {
                            tokio::time::sleep(delay).await;
                            let mut response = Response::new(Full::new(Bytes::from(body)));
                            *response.status_mut() = StatusCode::from_u16(status).unwrap();
                            Ok::<_, Infallible>(response)
                        }
                    });

                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        TestPeer { addr, hits }
    }

    fn test_proxy(overall_ms: u64, stage_ms: u64) -> FallbackProxy {
        FallbackProxy::new(ProxyTimeouts::new(
            Duration::from_millis(overall_ms),
            Duration::from_millis(stage_ms),
        ))
    }

    fn test_request() -> Request<Bytes> {
        Request::builder()
            .method("GET")
            .uri("http://localhost/shard/1")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_proxy_single_peer() {
        let peer = start_peer(Duration::ZERO, 200, "all good\n").await;

        let response = test_proxy(30, 10)
            .proxy_request(test_request(), &[peer.addr.clone()])
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"all good\n");
    }

    #[tokio::test]
    async fn test_proxy_slow_peer() {
        let slow = start_peer(Duration::from_millis(100), 200, "sorry, did you need something?\n").await;
        let good = start_peer(Duration::ZERO, 200, "all good\n").await;
        let not_reached = start_peer(Duration::ZERO, 200, "too far\n").await;

        let peers = vec![slow.addr.clone(), good.addr.clone(), not_reached.addr.clone()];
        let response = test_proxy(30, 10)
            .proxy_request(test_request(), &peers)
            .await
            .unwrap();

        assert_eq!(response.body().as_ref(), b"all good\n");
        assert_eq!(slow.hits(), 1);
        assert_eq!(not_reached.hits(), 0);
    }

    #[tokio::test]
    async fn test_proxy_error_peer() {
        let error = start_peer(Duration::ZERO, 500, "").await;
        let good = start_peer(Duration::ZERO, 200, "all good\n").await;
        let not_reached = start_peer(Duration::ZERO, 200, "too far\n").await;

        // Long stages: the failure alone must move on to the next peer
        let peers = vec![error.addr.clone(), good.addr.clone(), not_reached.addr.clone()];
        let response = test_proxy(5_000, 2_000)
            .proxy_request(test_request(), &peers)
            .await
            .unwrap();

        assert_eq!(response.body().as_ref(), b"all good\n");
        assert_eq!(error.hits(), 1);
        assert_eq!(not_reached.hits(), 0);
    }

    #[tokio::test]
    async fn test_proxy_slow_peer_beats_error_peer() {
        let slow = start_peer(
            Duration::from_millis(15),
            200,
            "all good, sorry to keep you waiting\n",
        )
        .await;
        let error = start_peer(Duration::ZERO, 500, "").await;

        let peers = vec![slow.addr.clone(), error.addr.clone()];
        let response = test_proxy(30, 10)
            .proxy_request(test_request(), &peers)
            .await
            .unwrap();

        assert_eq!(
            response.body().as_ref(),
            b"all good, sorry to keep you waiting\n"
        );
        assert_eq!(error.hits(), 1);
    }

    #[tokio::test]
    async fn test_proxy_timeout() {
        let slow = start_peer(Duration::from_millis(100), 200, "sorry, did you need something?\n").await;
        let not_reached = start_peer(Duration::ZERO, 200, "too far\n").await;

        let peers = vec![
            slow.addr.clone(),
            slow.addr.clone(),
            slow.addr.clone(),
            not_reached.addr.clone(),
        ];
        let result = test_proxy(30, 10).proxy_request(test_request(), &peers).await;

        assert_eq!(result.unwrap_err(), ProxyError::Timeout);

        // Give a late fourth stage the chance to show up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(not_reached.hits(), 0);
    }

    #[tokio::test]
    async fn test_proxy_all_errors() {
        let error = start_peer(Duration::ZERO, 500, "").await;

        let peers = vec![error.addr.clone(), error.addr.clone(), error.addr.clone()];
        let started = Instant::now();
        let result = test_proxy(5_000, 2_000)
            .proxy_request(test_request(), &peers)
            .await;

        assert_eq!(result.unwrap_err(), ProxyError::NoAvailablePeers);
        assert_eq!(error.hits(), 3);
        // Resolved as soon as the last peer failed, not at a stage or deadline boundary
        assert!(started.elapsed() < Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_proxy_not_found_is_an_answer() {
        let missing = start_peer(Duration::ZERO, 404, "no such key\n").await;
        let not_reached = start_peer(Duration::ZERO, 200, "too far\n").await;

        let peers = vec![missing.addr.clone(), not_reached.addr.clone()];
        let response = test_proxy(5_000, 2_000)
            .proxy_request(test_request(), &peers)
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body().as_ref(), b"no such key\n");
        assert_eq!(not_reached.hits(), 0);
    }

    #[tokio::test]
    async fn test_proxy_connection_refused_moves_on() {
        // Bind then drop, so nothing is listening on the port anymore
        let refused = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .to_string();
        let good = start_peer(Duration::ZERO, 200, "all good\n").await;

        let peers = vec![refused, good.addr.clone()];
        let started = Instant::now();
        let response = test_proxy(5_000, 2_000)
            .proxy_request(test_request(), &peers)
            .await
            .unwrap();

        assert_eq!(response.body().as_ref(), b"all good\n");
        assert!(started.elapsed() < Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn test_proxy_no_peers() {
        let result = test_proxy(30, 10).proxy_request(test_request(), &[]).await;
        assert_eq!(result.unwrap_err(), ProxyError::NoAvailablePeers);
    }

    #[tokio::test]
    async fn test_proxy_all_transport_failures() {
        let unroutable = vec!["not a host".to_string(), "also not a host".to_string()];
        let result = test_proxy(5_000, 2_000)
            .proxy_request(test_request(), &unroutable)
            .await;
        assert_eq!(result.unwrap_err(), ProxyError::NoAvailablePeers);
    }
}
