use crate::round::pipeline::RoundStreamRuntime;
use crate::round::status::RoundStreamStatusSnapshot;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct RoundStreamHandle {
    pub runtime: RoundStreamRuntime,
    pub status: Arc<RwLock<RoundStreamStatusSnapshot>>,
    pub cancellation_token: CancellationToken,
    pub join_handle: JoinHandle<()>,
}

/// Streams are keyed by topic; one connection per subscribed topic.
pub struct AppState {
    pub started_at: Instant,
    pub http_client: Client,
    pub round_streams: Mutex<HashMap<String, RoundStreamHandle>>,
}

impl AppState {
    pub fn new(http_client: Client) -> Self {
        Self {
            started_at: Instant::now(),
            http_client,
            round_streams: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(Client::new())
    }
}
