//! Scripted OpenAlex stand-in for tests.

use axum::extract::Query as UrlQuery;
use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub type Params = HashMap<String, String>;
type Script = dyn Fn(usize, &Params) -> (StatusCode, String) + Send + Sync;

/// A running fixture server. `hits` counts requests, `seen` keeps their parameters.
pub struct Fixture {
    pub base: String,
    hits: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Params>>>,
}

impl Fixture {
    /// Serve `/works`, answering request `n` (0-based) with `script(n, params)`.
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(usize, &Params) -> (StatusCode, String) + Send + Sync + 'static,
    {
        let script: Arc<Script> = Arc::new(script);
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let app = {
            let hits = hits.clone();
            let seen = seen.clone();
            Router::new().route(
                "/works",
                get(move |UrlQuery(params): UrlQuery<Params>| {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    let (status, body) = script(n, &params);
                    seen.lock().unwrap().push(params);
                    async move { (status, [(header::CONTENT_TYPE, "application/json")], body) }
                }),
            )
        };

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            hits,
            seen,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn cursors(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.get("cursor").cloned().unwrap_or_default())
            .collect()
    }

    pub fn params(&self, n: usize) -> Params {
        self.seen.lock().unwrap()[n].clone()
    }
}

pub fn work(id: &str) -> Value {
    json!({
        "id": id,
        "display_name": format!("Paper {}", id),
        "publication_year": 2020,
        "authorships": [{"author": {"display_name": "Alice"}, "is_corresponding": true}]
    })
}

/// A results page in the OpenAlex response shape.
pub fn page(ids: &[&str], next_cursor: Option<&str>) -> (StatusCode, String) {
    let results: Vec<Value> = ids.iter().map(|id| work(id)).collect();
    let body = json!({
        "meta": {"count": ids.len(), "next_cursor": next_cursor},
        "results": results
    });
    (StatusCode::OK, body.to_string())
}

pub fn failure(status: StatusCode) -> (StatusCode, String) {
    (status, json!({"error": status.as_str()}).to_string())
}

/// Serve a response whose body stops short of its `Content-Length` on the
/// first connection, then `good` on every later one.
pub async fn truncated_then(good: String) -> Fixture {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let hits = Arc::new(AtomicUsize::new(0));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let counter = hits.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let good = good.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(read) => head.extend_from_slice(&buf[..read]),
                    }
                }
                let reply = if n == 0 {
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                     Content-Length: 1000\r\n\r\n{\"results\": ["
                        .to_string()
                } else {
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                         Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                        good.len(),
                        good
                    )
                };
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    Fixture {
        base: format!("http://{}", addr),
        hits,
        seen: Arc::new(Mutex::new(Vec::new())),
    }
}
