use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};

/// Reserves an OS-assigned loopback port and releases it for the caller to bind.
pub(crate) fn free_port() -> u16 {
    std::net::TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Stand-in for the real TShock `/status` endpoint. `None` answers 503.
#[derive(Clone)]
pub(crate) struct MockStatus {
    count: Arc<Mutex<Option<u64>>>,
    pub url: String,
}

impl MockStatus {
    pub async fn start(initial: Option<u64>) -> Self {
        let count = Arc::new(Mutex::new(initial));
        let app = Router::new()
            .route("/status", get(mock_status))
            .with_state(count.clone());
        let addr = serve(app).await;
        Self {
            count,
            url: format!("http://{addr}/status"),
        }
    }

    pub fn set(&self, count: Option<u64>) {
        *self.count.lock().unwrap() = count;
    }
}

async fn mock_status(State(count): State<Arc<Mutex<Option<u64>>>>) -> Response {
    let current = *count.lock().unwrap();
    match current {
        Some(n) => Json(serde_json::json!({
            "name": "mock",
            "port": 7777,
            "playercount": n,
            "maxplayers": 8,
        }))
        .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Pushed {
    pub title: Option<String>,
    pub tags: Option<String>,
    pub priority: Option<String>,
    pub auth: Option<String>,
    pub body: String,
}

/// Records every push it receives, like an ntfy topic would.
#[derive(Clone)]
pub(crate) struct MockNtfy {
    pushed: Arc<Mutex<Vec<Pushed>>>,
    pub url: String,
}

impl MockNtfy {
    pub async fn start() -> Self {
        let pushed = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/topic", post(record_push))
            .with_state(pushed.clone());
        let addr = serve(app).await;
        Self {
            pushed,
            url: format!("http://{addr}/topic"),
        }
    }

    pub fn pushed(&self) -> Vec<Pushed> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn tags(&self) -> Vec<String> {
        self.pushed().into_iter().filter_map(|p| p.tags).collect()
    }

    pub async fn wait_for_tag(&self, tag: &str, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.tags().iter().any(|t| t == tag) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn record_push(
    State(pushed): State<Arc<Mutex<Vec<Pushed>>>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    };
    pushed.lock().unwrap().push(Pushed {
        title: header("title"),
        tags: header("tags"),
        priority: header("priority"),
        auth: header("authorization"),
        body,
    });
    StatusCode::OK
}
