#![allow(dead_code)]

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Router,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::IntoResponse,
    routing::{any, get},
};
use pinfetch::{AttemptObserver, DomainResolver, FetchAttempt, FetchOptions};
use serde::Deserialize;

/// HTTP server running on the loopback address for the duration of a test
pub struct TestServer {
    pub address: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl TestServer {
    /// Port the server is listening on
    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Build a url for `host` pointing at the server
    pub fn url(&self, host: &str, path: &str) -> String {
        format!("http://{host}:{}{path}", self.port())
    }

    /// Number of requests the server has received
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[derive(Deserialize)]
struct RedirectQuery {
    to: String,
}

/// Start a new test server on `127.0.0.1`
pub async fn test_server() -> TestServer {
    let hits = Arc::new(AtomicUsize::new(0));

    let app = Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/loop", get(|| async { found("/loop".to_string()) }))
        .route("/chain/{remaining}", get(chain))
        .route(
            "/redirect",
            get(|Query(query): Query<RedirectQuery>| async move { found(query.to) }),
        )
        .route(
            "/see-other",
            any(|| async {
                (
                    StatusCode::SEE_OTHER,
                    [(header::LOCATION, "/echo".to_string())],
                )
            }),
        )
        .route("/echo", any(echo))
        .route("/headers", get(authorization))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "slow"
            }),
        )
        .layer(axum::middleware::from_fn_with_state(
            hits.clone(),
            count_hits,
        ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    TestServer { address, hits }
}

async fn count_hits(
    State(hits): State<Arc<AtomicUsize>>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    hits.fetch_add(1, Ordering::SeqCst);
    next.run(request).await
}

fn found(location: String) -> impl IntoResponse {
    (StatusCode::FOUND, [(header::LOCATION, location)])
}

async fn chain(Path(remaining): Path<usize>) -> axum::response::Response {
    if remaining == 0 {
        return "done".into_response();
    }

    found(format!("/chain/{}", remaining - 1)).into_response()
}

async fn echo(method: Method, body: String) -> String {
    format!("{method} {body}")
}

async fn authorization(headers: HeaderMap) -> String {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none")
        .to_string()
}

/// Options for tests, the loopback address of the test server is allowed
pub fn test_options() -> FetchOptions {
    let mut options = FetchOptions::default();
    options.policy.allow = vec!["127.0.0.1/32".parse().unwrap()];
    options.connect_timeout = Duration::from_secs(2);
    options.request_timeout = Duration::from_secs(5);
    options
}

/// Resolver answering from a script of answers per name, the nth query
/// for a name receives the nth answer (the last answer repeats)
#[derive(Default)]
pub struct ScriptedResolver {
    answers: HashMap<String, Vec<Vec<IpAddr>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedResolver {
    /// Add the next answer for `host`
    pub fn answer(mut self, host: &str, addresses: &[&str]) -> Self {
        self.answers.entry(host.to_string()).or_default().push(
            addresses
                .iter()
                .map(|address| address.parse().unwrap())
                .collect(),
        );
        self
    }

    /// Number of times `host` was resolved
    pub fn calls(&self, host: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or_default()
    }
}

impl DomainResolver for ScriptedResolver {
    async fn resolve_domain(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(host.to_string()).or_default();
            *count += 1;
            *count - 1
        };

        let answers = self
            .answers
            .get(host)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "nxdomain"))?;

        Ok(answers[call.min(answers.len() - 1)].clone())
    }
}

/// Observer collecting every attempt
#[derive(Default, Clone)]
pub struct RecordingObserver {
    attempts: Arc<Mutex<Vec<FetchAttempt>>>,
}

impl RecordingObserver {
    pub fn attempts(&self) -> Vec<FetchAttempt> {
        self.attempts.lock().unwrap().clone()
    }
}

impl AttemptObserver for RecordingObserver {
    fn on_attempt(&self, attempt: &FetchAttempt) {
        self.attempts.lock().unwrap().push(attempt.clone());
    }
}
