use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use url::Url;

use crate::config::{BackendConfig, DeliveryTarget};
use crate::secrets::SecretStore;

pub fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// VM-to-VM flow where both ends are instances in the same VPC.
pub fn flow_log_vm() -> Value {
    json!({
        "connection": {
            "src_ip": "10.128.0.15",
            "dest_ip": "10.128.0.22",
            "src_port": 49152,
            "dest_port": 443,
            "protocol": 6
        },
        "bytes_sent": "15234",
        "packets_sent": "42",
        "reporter": "SRC",
        "start_time": "2026-02-26T11:59:55.000000Z",
        "end_time": "2026-02-26T12:00:00.000000Z",
        "rtt_msec": "3",
        "src_instance": {
            "vm_name": "web-frontend-01",
            "project_id": "test-project",
            "zone": "us-central1-a",
            "region": "us-central1"
        },
        "dest_instance": {
            "vm_name": "api-backend-02",
            "project_id": "test-project",
            "zone": "us-central1-b",
            "region": "us-central1"
        },
        "src_vpc": {
            "vpc_name": "prod-vpc",
            "subnetwork_name": "prod-subnet-central",
            "project_id": "test-project"
        },
        "dest_vpc": {
            "vpc_name": "prod-vpc",
            "subnetwork_name": "prod-subnet-central",
            "project_id": "test-project"
        }
    })
}

/// Internet client talking to an instance; no `src_instance`.
pub fn flow_log_external() -> Value {
    json!({
        "connection": {
            "src_ip": "203.0.113.50",
            "dest_ip": "10.128.0.22",
            "src_port": "51234",
            "dest_port": "443",
            "protocol": "6"
        },
        "bytes_sent": 1234,
        "packets_sent": 8,
        "reporter": "DEST",
        "dest_instance": {
            "vm_name": "api-backend-02",
            "project_id": "test-project",
            "zone": "us-central1-b",
            "region": "us-central1"
        },
        "src_location": {
            "continent": "America",
            "country": "usa",
            "region": "California",
            "city": "San Francisco",
            "asn": 64500
        }
    })
}

pub fn flow_log_gke() -> Value {
    json!({
        "connection": {
            "src_ip": "10.4.1.7",
            "dest_ip": "10.4.2.9",
            "src_port": 38000,
            "dest_port": 8080,
            "protocol": 6
        },
        "bytes_sent": "2048",
        "packets_sent": "5",
        "reporter": "SRC",
        "src_gke_details": {
            "cluster": {"cluster_name": "prod-cluster", "cluster_location": "us-central1"},
            "pod": {"pod_name": "checkout-7d9f", "pod_namespace": "shop"}
        },
        "dest_gke_details": {
            "cluster": {"cluster_name": "prod-cluster", "cluster_location": "us-central1"},
            "pod": {"pod_name": "payments-5c2a", "pod_namespace": "shop"},
            "service": [{"service_name": "payments", "service_namespace": "shop"}]
        }
    })
}

/// Wrap a flow log in a Cloud Logging entry.
pub fn log_entry(flow_log: Value) -> Value {
    json!({
        "insertId": "test-insert-id",
        "logName": "projects/test-project/logs/compute.googleapis.com%2Fvpc_flows",
        "resource": {
            "type": "gce_subnetwork",
            "labels": {
                "project_id": "test-project",
                "subnetwork_name": "test-subnet",
                "location": "us-central1-a"
            }
        },
        "timestamp": "2026-02-26T12:00:00.000000Z",
        "receiveTimestamp": "2026-02-26T12:00:01.000000Z",
        "jsonPayload": flow_log
    })
}

/// Raw Pub/Sub push body carrying arbitrary already-encoded data.
pub fn push_body_raw(data: &str) -> Vec<u8> {
    json!({
        "message": {
            "data": data,
            "attributes": {"logging.googleapis.com/timestamp": "2026-02-26T12:00:00.000000Z"},
            "messageId": "9999999999",
            "publishTime": "2026-02-26T12:00:01.000000Z"
        },
        "subscription": "projects/test-project/subscriptions/flowlogs-push",
        "deliveryAttempt": 1
    })
    .to_string()
    .into_bytes()
}

/// Raw Pub/Sub push body carrying the given log entry.
pub fn push_body(entry: &Value) -> Vec<u8> {
    push_body_raw(&BASE64.encode(entry.to_string()))
}

/// Structured-mode CloudEvent, as delivered by Eventarc.
pub fn cloud_event_body(entry: &Value) -> Vec<u8> {
    json!({
        "specversion": "1.0",
        "id": "evt-test-insert-id",
        "source": "//pubsub.googleapis.com/projects/test-project/topics/vpc-flowlogs-lm",
        "type": "google.cloud.pubsub.topic.v1.messagePublished",
        "datacontenttype": "application/json",
        "data": {
            "message": {
                "data": BASE64.encode(entry.to_string()),
                "messageId": "8888888888",
                "publishTime": "2026-02-26T12:00:01.000000Z"
            },
            "subscription": "projects/test-project/subscriptions/eventarc-sub"
        }
    })
    .to_string()
    .into_bytes()
}

pub fn webhook_target(base_url: &Url) -> DeliveryTarget {
    DeliveryTarget {
        base_url: base_url.clone(),
        source_name: "GCP-VPC-FlowLogs".into(),
        backend: BackendConfig::Webhook {
            bearer_token: "tok_abc123".into(),
        },
    }
}

pub fn ingest_target(base_url: &Url) -> DeliveryTarget {
    DeliveryTarget {
        base_url: base_url.clone(),
        source_name: "GCP-VPC-FlowLogs".into(),
        backend: BackendConfig::IngestApi {
            access_id: "id_123".into(),
            access_key: "key_456".into(),
        },
    }
}

/// Secret store backed by a fixed map. Records every batch it is asked for.
#[derive(Default)]
pub struct MockSecrets {
    values: HashMap<String, String>,
    batches: Mutex<Vec<Vec<String>>>,
}

impl MockSecrets {
    pub fn with(pairs: &[(&str, &str)]) -> Self {
        Self {
            values: vars(pairs),
            batches: Mutex::default(),
        }
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

impl SecretStore for MockSecrets {
    async fn access_all(&self, secret_ids: &[&str]) -> HashMap<String, String> {
        self.batches
            .lock()
            .unwrap()
            .push(secret_ids.iter().map(|id| id.to_string()).collect());
        secret_ids
            .iter()
            .filter_map(|id| Some((id.to_string(), self.values.get(*id)?.clone())))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl CapturedRequest {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap()
    }
}

type Routes = Arc<Mutex<HashMap<String, (u16, Value)>>>;

/// In-process stand-in for a LogicMonitor portal (or any JSON API). Records
/// every request and answers with a configurable status and `{}`, unless a
/// route for the request path says otherwise.
pub struct MockPortal {
    pub url: Url,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    status: Arc<AtomicU16>,
    routes: Routes,
}

impl MockPortal {
    pub async fn start(status: u16) -> Self {
        Self::start_with_delay(status, Duration::ZERO).await
    }

    /// Every response is held back for `delay` before it is sent.
    pub async fn start_with_delay(status: u16, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(AtomicU16::new(status));
        let routes: Routes = Arc::default();

        let store = Arc::clone(&requests);
        let code = Arc::clone(&status);
        let table = Arc::clone(&routes);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let store = Arc::clone(&store);
                let code = Arc::clone(&code);
                let table = Arc::clone(&table);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let reply = Reply {
                            status: Arc::clone(&code),
                            routes: Arc::clone(&table),
                            delay,
                        };
                        capture(req, Arc::clone(&store), reply)
                    });
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            url: Url::parse(&format!("http://127.0.0.1:{port}")).unwrap(),
            requests,
            status,
            routes,
        }
    }

    /// Answer requests for `path` with `status` and `body`.
    pub fn route(&self, path: &str, status: u16, body: Value) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_owned(), (status, body));
    }

    pub fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct Reply {
    status: Arc<AtomicU16>,
    routes: Routes,
    delay: Duration,
}

async fn capture<B>(
    req: Request<B>,
    store: Arc<Mutex<Vec<CapturedRequest>>>,
    reply: Reply,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();
    let headers = req
        .headers()
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
        .collect();
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let routed = reply.routes.lock().unwrap().get(&path).cloned();
    store.lock().unwrap().push(CapturedRequest {
        method,
        path,
        headers,
        body,
    });

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    let (status, body) = match routed {
        Some((status, body)) => (status, Bytes::from(body.to_string())),
        None => (
            reply.status.load(Ordering::SeqCst),
            Bytes::from_static(b"{}"),
        ),
    };
    Ok(Response::builder()
        .status(StatusCode::from_u16(status).unwrap())
        .body(Full::new(body))
        .unwrap())
}

/// Bind to port 0 and return the OS-assigned port.
/// The listener is dropped, so nothing accepts on it afterwards.
pub async fn closed_port() -> u16 {
    tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn http_client(timeout: Duration) -> reqwest::Client {
    let _ = rustls::crypto::ring::default_provider().install_default();
    reqwest::Client::builder().timeout(timeout).build().unwrap()
}
