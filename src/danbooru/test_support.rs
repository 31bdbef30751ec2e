//! Scripted transport shared by the engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::danbooru::sender::{Credential, RawResponse, Transport, TransportError};

#[derive(Debug, Clone)]
enum Scripted {
    Response(RawResponse),
    Error(TransportError),
    Hang,
}

/// Answers requests from a script keyed by path. Unscripted paths answer 404.
///
/// Several scripted answers for one path are handed out in order; the last one repeats.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    delays: HashMap<String, Duration>,
    requests: Mutex<Vec<(String, Instant)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, path: &str, scripted: Scripted) -> Self {
        self.routes
            .lock()
            .entry(path.to_string())
            .or_default()
            .push_back(scripted);
        self
    }

    pub fn respond(self, path: &str, response: RawResponse) -> Self {
        self.push(path, Scripted::Response(response))
    }

    pub fn fail(self, path: &str, error: TransportError) -> Self {
        self.push(path, Scripted::Error(error))
    }

    pub fn hang(self, path: &str) -> Self {
        self.push(path, Scripted::Hang)
    }

    pub fn delay(mut self, path: &str, delay: Duration) -> Self {
        self.delays.insert(path.to_string(), delay);
        self
    }

    /// Every requested path, in the order the requests were issued.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(path, _)| path.clone()).collect()
    }

    /// When `path` was first requested.
    pub fn requested_at(&self, path: &str) -> Option<Instant> {
        self.requests
            .lock()
            .iter()
            .find(|(requested, _)| requested == path)
            .map(|(_, at)| *at)
    }

    /// Highest number of requests that were outstanding at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Starts measuring the peak afresh.
    pub fn reset_peak(&self) {
        self.peak.store(self.in_flight.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn next_scripted(&self, path: &str) -> Option<Scripted> {
        let mut routes = self.routes.lock();
        let queue = routes.get_mut(path)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, path: &str, _credential: &Credential) -> Result<RawResponse, TransportError> {
        self.requests.lock().push((path.to_string(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delays.get(path) {
            tokio::time::sleep(*delay).await;
        }

        let result = match self.next_scripted(path) {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::Error(error)) => Err(error),
            Some(Scripted::Hang) => std::future::pending().await,
            None => Ok(RawResponse::new(404, r#"{"success":false,"message":"That record was not found."}"#)),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// A visible post payload with the given id.
pub fn post_body(id: u64) -> String {
    serde_json::json!({
        "id": id,
        "md5": format!("{:032x}", id),
        "source": "",
        "pixiv_id": null,
        "file_ext": "jpg",
        "file_url": format!("https://cdn.donmai.us/original/{}.jpg", id),
        "large_file_url": format!("https://cdn.donmai.us/sample/{}.jpg", id),
        "preview_file_url": format!("https://cdn.donmai.us/preview/{}.jpg", id),
        "tag_string": "1girl solo",
        "tag_string_general": "1girl solo",
        "tag_string_artist": "",
        "tag_string_character": "",
        "tag_string_copyright": "original",
        "tag_string_meta": "",
        "is_banned": false,
        "is_deleted": false
    })
    .to_string()
}
