use std::convert::Infallible;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::backend::{DeliveryOutcome, Deliver};
use crate::relay::{Relay, RelayError};
use crate::secrets::SecretStore;

/// Cloud Run allows 10s between SIGTERM and SIGKILL.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(8);

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

fn response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::default())
        .unwrap()
}

/// Validate the incoming request: route, method, and body.
async fn validate<B>(req: Request<B>) -> Result<Bytes, (StatusCode, String)>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    if path != "/" {
        return Err((StatusCode::NOT_FOUND, format!("unknown path: {path}")));
    }
    if method != Method::POST {
        return Err((StatusCode::METHOD_NOT_ALLOWED, format!("{method} {path}")));
    }

    req.collect().await.map(|c| c.to_bytes()).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("POST {path}: failed to read body"),
        )
    })
}

/// Any 2xx acks the message; anything else asks the subscription to redeliver.
fn status_for(result: &Result<DeliveryOutcome, RelayError>) -> Response<Full<Bytes>> {
    match result {
        Ok(_) => response(StatusCode::NO_CONTENT),
        Err(e) if !e.should_redeliver() => response(StatusCode::NO_CONTENT),
        Err(RelayError::Configuration(_)) => response(StatusCode::INTERNAL_SERVER_ERROR),
        Err(_) => Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header("Retry-After", "1")
            .body(Full::default())
            .unwrap(),
    }
}

async fn handle<B, D, S>(
    req: Request<B>,
    relay: Arc<Relay<D, S>>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    D: Deliver + Send + Sync,
    S: SecretStore + Send + Sync,
{
    let body = match validate(req).await {
        Ok(body) => body,
        Err((status, reason)) => {
            warn!(reason, "push request rejected");
            return Ok(response(status));
        }
    };

    let result = relay.handle(&body).await;
    Ok(status_for(&result))
}

/// Accept push requests until `cancel` fires, then give in-flight
/// invocations up to [`SHUTDOWN_GRACE`] to finish. Idle keep-alive
/// connections are closed as soon as `cancel` fires.
pub async fn serve<D, S>(listener: TcpListener, relay: Arc<Relay<D, S>>, cancel: CancellationToken)
where
    D: Deliver + Send + Sync + 'static,
    S: SecretStore + Send + Sync + 'static,
{
    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok((stream, _)) => stream,
                    Err(error) => {
                        // EMFILE and friends: back off instead of spinning.
                        warn!(%error, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                let relay = Arc::clone(&relay);
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&relay)));
                    let builder = Builder::new(TokioExecutor::new());
                    let mut conn = pin!(builder.serve_connection(TokioIo::new(stream), service));
                    tokio::select! {
                        _ = conn.as_mut() => {}
                        _ = cancel.cancelled() => {
                            conn.as_mut().graceful_shutdown();
                            let _ = conn.await;
                        }
                    }
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
    tracker.close();
    debug!(in_flight = tracker.len(), "waiting for in-flight invocations");
    if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
        warn!(in_flight = tracker.len(), "abandoning in-flight invocations at shutdown");
    }
}
