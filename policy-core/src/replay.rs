//! Background replay of rewritten requests
//!
//! Submissions go onto a bounded queue drained by one worker. Every replay
//! runs in its own task under a timeout, and a panicking sender is caught at
//! the task boundary so it never reaches the submitting flow.

use crate::codec;
use crate::config::ReplayConfig;
use crate::error::PolicyError;
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A request queued for replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayJob {
    /// Final request bytes after rewriting
    pub raw: Vec<u8>,
    pub is_https: bool,
    /// Fallback authority when the request carries no Host header
    pub host: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayResponse {
    pub status: u16,
    pub body_len: usize,
}

/// Sends one replay upstream
#[async_trait]
pub trait ReplaySender: Send + Sync {
    async fn send(&self, job: &ReplayJob) -> Result<ReplayResponse>;
}

/// Replay counters
#[derive(Debug, Default)]
pub struct ReplayStats {
    submitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStatsSnapshot {
    pub submitted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
}

impl ReplayStatsSnapshot {
    /// Replays that have run to some conclusion
    pub fn finished(&self) -> u64 {
        self.succeeded + self.failed + self.panicked
    }
}

impl ReplayStats {
    pub fn snapshot(&self) -> ReplayStatsSnapshot {
        ReplayStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

/// Handle for submitting replays; cheap to clone
#[derive(Debug, Clone)]
pub struct ReplayDispatcher {
    tx: mpsc::Sender<ReplayJob>,
    stats: Arc<ReplayStats>,
}

impl ReplayDispatcher {
    /// Start the worker on the current tokio runtime
    pub fn spawn(sender: Arc<dyn ReplaySender>, config: &ReplayConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stats = Arc::new(ReplayStats::default());
        tokio::spawn(run_worker(rx, sender, config.timeout(), stats.clone()));
        info!(
            queue_capacity = config.queue_capacity,
            timeout_secs = config.timeout_secs,
            "Replay dispatcher started"
        );
        Self { tx, stats }
    }

    /// Queue a job without blocking; fails when the queue is full or closed
    pub fn submit(&self, job: ReplayJob) -> Result<()> {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PolicyError::replay("replay queue is full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PolicyError::replay("replay worker has stopped"))
            }
        }
    }

    pub fn stats(&self) -> ReplayStatsSnapshot {
        self.stats.snapshot()
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<ReplayJob>,
    sender: Arc<dyn ReplaySender>,
    timeout: Duration,
    stats: Arc<ReplayStats>,
) {
    while let Some(job) = rx.recv().await {
        let sender = sender.clone();
        let stats = stats.clone();

        let task = tokio::spawn(async move {
            tokio::time::timeout(timeout, sender.send(&job)).await
        });

        tokio::spawn(async move {
            match task.await {
                Ok(Ok(Ok(response))) => {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!(status = response.status, bytes = response.body_len, "Replay completed");
                }
                Ok(Ok(Err(e))) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    if e.is_recoverable() {
                        warn!("Replay failed: {}", e);
                    } else {
                        // Retrying the same bytes would fail the same way
                        error!("Replay rejected: {}", e);
                    }
                }
                Ok(Err(_)) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("{}", PolicyError::timeout("replay", timeout.as_millis() as u64));
                }
                Err(e) if e.is_panic() => {
                    stats.panicked.fetch_add(1, Ordering::Relaxed);
                    error!("Replay task panicked: {}", e);
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("Replay task cancelled: {}", e);
                }
            }
        });
    }
    debug!("Replay worker stopped");
}

/// Request fields extracted from raw bytes for an HTTP client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayTarget {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Headers the HTTP client manages itself
const CLIENT_MANAGED_HEADERS: [&str; 5] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "proxy-connection",
];

impl ReplayTarget {
    pub fn parse(job: &ReplayJob) -> Result<Self> {
        let message = codec::decode_message(&job.raw);
        let start = codec::start_line(&message.header);
        let line = codec::parse_request_line(start)
            .ok_or_else(|| PolicyError::codec("missing request line"))?;

        let method = String::from_utf8_lossy(line.method).into_owned();
        let uri = String::from_utf8_lossy(line.uri).into_owned();
        if method.is_empty() || uri.is_empty() {
            return Err(PolicyError::codec("incomplete request line"));
        }

        let url = if uri.starts_with("http://") || uri.starts_with("https://") {
            uri
        } else {
            let host = codec::header_value(&message.header, "host")
                .filter(|h| !h.is_empty())
                .or_else(|| job.host.clone())
                .ok_or_else(|| PolicyError::codec("request has no Host header"))?;
            let scheme = if job.is_https { "https" } else { "http" };
            format!("{}://{}{}", scheme, host, uri)
        };

        let headers = codec::header_lines(&message.header)
            .into_iter()
            .skip(1)
            .filter_map(codec::split_header_line)
            .map(|(k, v)| {
                (
                    String::from_utf8_lossy(k).into_owned(),
                    String::from_utf8_lossy(v).into_owned(),
                )
            })
            .filter(|(k, _)| {
                !CLIENT_MANAGED_HEADERS
                    .iter()
                    .any(|h| k.eq_ignore_ascii_case(h))
            })
            .collect();

        Ok(Self {
            method,
            url,
            headers,
            body: message.body,
        })
    }
}

/// Replays over HTTP(S) with certificate checks disabled
#[derive(Debug, Clone)]
pub struct HttpReplaySender {
    client: reqwest::Client,
}

impl HttpReplaySender {
    pub fn new(config: &ReplayConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));

        if let Some(proxy) = &config.upstream_proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| PolicyError::configuration("replay proxy", e))?;
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl ReplaySender for HttpReplaySender {
    async fn send(&self, job: &ReplayJob) -> Result<ReplayResponse> {
        let target = ReplayTarget::parse(job)?;
        let method = reqwest::Method::from_bytes(target.method.as_bytes())
            .map_err(|e| PolicyError::replay(format!("invalid method {:?}: {}", target.method, e)))?;

        let mut builder = self.client.request(method, target.url.as_str());
        for (k, v) in &target.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        if !target.body.is_empty() {
            builder = builder.body(target.body);
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        debug!(url = %target.url, status, "Replayed request");

        Ok(ReplayResponse {
            status,
            body_len: body.len(),
        })
    }
}
