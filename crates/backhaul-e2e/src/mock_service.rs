//! Mock HTTP service standing in for the client's local application
//!
//! Records every request it sees and answers with a configurable canned response.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use tokio::net::TcpListener;

/// A request as the local service received it
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// First value of a header, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Clone, Debug)]
struct CannedResponse {
    status: StatusCode,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
}

#[derive(Debug)]
struct Shared {
    requests: RwLock<Vec<RecordedRequest>>,
    response: RwLock<CannedResponse>,
}

/// Local HTTP service on an ephemeral port
pub struct MockHttpService {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockHttpService {
    /// Start answering `200 OK` with body `OK`
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock service");
        let addr = listener.local_addr().expect("mock service has no address");

        let shared = Arc::new(Shared {
            requests: RwLock::new(Vec::new()),
            response: RwLock::new(CannedResponse {
                status: StatusCode::OK,
                body: b"OK".to_vec(),
                headers: Vec::new(),
            }),
        });

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| respond(shared.clone(), req));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { addr, shared }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address in the form a tunnel request's `local_addr` expects
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.shared.requests.read().clone()
    }

    pub fn last_request(&self) -> Option<RecordedRequest> {
        self.shared.requests.read().last().cloned()
    }

    pub fn request_count(&self) -> usize {
        self.shared.requests.read().len()
    }

    pub fn set_response_status(&self, status: StatusCode) {
        self.shared.response.write().status = status;
    }

    pub fn set_response_body(&self, body: impl Into<Vec<u8>>) {
        self.shared.response.write().body = body.into();
    }

    pub fn add_response_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.shared
            .response
            .write()
            .headers
            .push((name.into(), value.into()));
    }
}

async fn respond(
    shared: Arc<Shared>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().to_string();
    let uri = req.uri().to_string();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes().to_vec())
        .unwrap_or_default();

    shared.requests.write().push(RecordedRequest {
        method,
        uri,
        headers,
        body,
    });

    let canned = shared.response.read().clone();
    let mut response = Response::new(Full::new(Bytes::from(canned.body)));
    *response.status_mut() = canned.status;
    for (name, value) in canned.headers {
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::try_from(name),
            hyper::header::HeaderValue::try_from(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    Ok(response)
}
