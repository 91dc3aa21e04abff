use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::AgentError;
use crate::sample::Sample;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a non-empty send queue is retried when no new samples are
/// arriving. Per-endpoint pacing is the blacklist's job; this only keeps
/// a stalled queue moving.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A `(host, port)` pair from the configured pool.
pub type HostPort = (String, u16);

#[derive(Debug)]
struct Endpoint {
    host: String,
    port: u16,
    /// Blacklisted until this instant. None means selectable.
    retry_at: Option<Instant>,
}

/// What became of one delivery attempt.
enum Delivery {
    /// The transport confirmed the batch; it left the queue.
    Delivered(usize),
    /// The server rejected the batch as malformed; retrying cannot help,
    /// so it left the queue anyway.
    Rejected(usize),
}

/// Drains the outbound queue in bounded batches to exactly one TSD
/// endpoint at a time, over the line protocol or the HTTP batch API.
pub struct Sender {
    endpoints: Vec<Endpoint>,
    current: usize,
    sendq: Vec<String>,
    rx: mpsc::Receiver<String>,
    conn: Option<TcpStream>,
    client: reqwest::Client,
    http: bool,
    http_api_path: String,
    host_tag: Option<String>,
    reconnect_interval: Duration,
    max_batch: usize,
}

impl Sender {
    /// Build a sender whose endpoint pool is shuffled once with the
    /// process RNG.
    pub fn new(cfg: &Config, rx: mpsc::Receiver<String>) -> Result<Sender, AgentError> {
        Self::with_shuffle(cfg, rx, |hosts| hosts.shuffle(&mut rand::rng()))
    }

    /// Endpoint order is decided by `shuffle`, called once here. Tests
    /// pass a no-op to make the rotation deterministic.
    pub fn with_shuffle(
        cfg: &Config,
        rx: mpsc::Receiver<String>,
        shuffle: impl FnOnce(&mut [HostPort]),
    ) -> Result<Sender, AgentError> {
        if cfg.tsd_hosts.is_empty() {
            return Err(AgentError::Config(
                "tsd_hosts must list at least one endpoint".to_string(),
            ));
        }
        let mut hosts: Vec<HostPort> = cfg
            .tsd_hosts
            .iter()
            .map(|h| (h.host.clone(), h.port))
            .collect();
        shuffle(&mut hosts);

        let endpoints: Vec<Endpoint> = hosts
            .into_iter()
            .map(|(host, port)| Endpoint {
                host,
                port,
                retry_at: None,
            })
            .collect();

        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Sender {
            // First pick_connection advances one slot and lands on 0.
            current: endpoints.len() - 1,
            endpoints,
            sendq: Vec::new(),
            rx,
            conn: None,
            client,
            http: cfg.http,
            http_api_path: cfg.http_api_path.trim_start_matches('/').to_string(),
            host_tag: cfg.host_tag.clone(),
            reconnect_interval: Duration::from_secs(cfg.reconnect_interval),
            max_batch: cfg.max_batch.max(1),
        })
    }

    /// The endpoint the sender is currently talking to.
    pub fn current_endpoint(&self) -> (&str, u16) {
        let ep = &self.endpoints[self.current];
        (&ep.host, ep.port)
    }

    pub fn queue_len(&self) -> usize {
        self.sendq.len()
    }

    /// Append a serialized sample line to the send queue.
    pub fn enqueue(&mut self, line: String) {
        self.sendq.push(line);
    }

    /// Advance the rotation to the next endpoint that is not
    /// blacklisted. When every endpoint is blacklisted, take the one
    /// whose blacklist expires soonest and accept the risk.
    pub fn pick_connection(&mut self) {
        self.conn = None;
        let now = Instant::now();
        let n = self.endpoints.len();
        for step in 1..=n {
            let idx = (self.current + step) % n;
            let ep = &mut self.endpoints[idx];
            if ep.retry_at.is_some_and(|t| t <= now) {
                ep.retry_at = None;
            }
            if ep.retry_at.is_none() {
                self.current = idx;
                tracing::debug!(endpoint = %format!("{}:{}", ep.host, ep.port), "picked TSD endpoint");
                return;
            }
        }
        let idx = self
            .endpoints
            .iter()
            .enumerate()
            .min_by_key(|(_, ep)| ep.retry_at)
            .map(|(i, _)| i)
            .unwrap_or(0);
        self.current = idx;
        let ep = &self.endpoints[idx];
        tracing::warn!(
            endpoint = %format!("{}:{}", ep.host, ep.port),
            "all TSD endpoints blacklisted, using the soonest to expire"
        );
    }

    /// Blacklist the current endpoint for the reconnect interval and
    /// drop any open connection to it.
    pub fn blacklist_connection(&mut self) {
        self.conn = None;
        let interval = self.reconnect_interval;
        let ep = &mut self.endpoints[self.current];
        ep.retry_at = Some(Instant::now() + interval);
        tracing::info!(
            endpoint = %format!("{}:{}", ep.host, ep.port),
            blacklist_secs = interval.as_secs(),
            "blacklisting TSD endpoint"
        );
    }

    /// Attempt to deliver one batch from the send queue to the current
    /// endpoint. Permanent rejections drop the batch; transport failures
    /// retain it, blacklist the endpoint, and re-pick.
    pub async fn send_data(&mut self) {
        if self.sendq.is_empty() {
            return;
        }
        let result = if self.http {
            self.send_http().await
        } else {
            self.send_line().await
        };
        match result {
            Ok(Delivery::Delivered(n)) => {
                self.endpoints[self.current].retry_at = None;
                tracing::debug!(lines = n, "batch delivered");
            }
            Ok(Delivery::Rejected(n)) => {
                tracing::warn!(lines = n, "TSD rejected batch as malformed, dropping it");
            }
            Err(err) => {
                tracing::warn!(%err, pending = self.sendq.len(), "delivery failed, will retry");
                self.blacklist_connection();
                self.pick_connection();
            }
        }
    }

    /// Main loop: pull bursts off the outbound channel into the send
    /// queue and deliver, retrying a stalled queue on a fixed cadence.
    /// On cancellation the channel is drained once and flushed.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.pick_connection();
        let mut burst: Vec<String> = Vec::with_capacity(self.max_batch);
        let mut retry = tokio::time::interval(RETRY_INTERVAL);
        retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                n = self.rx.recv_many(&mut burst, self.max_batch) => {
                    if n == 0 {
                        break;
                    }
                    self.sendq.append(&mut burst);
                    self.send_data().await;
                }
                _ = retry.tick(), if !self.sendq.is_empty() => {
                    self.send_data().await;
                }
            }
        }

        // Final flush: whatever the readers managed to enqueue goes out
        // in one last attempt; the supervisor bounds how long this runs.
        while let Ok(line) = self.rx.try_recv() {
            self.sendq.push(line);
        }
        if !self.sendq.is_empty() {
            tracing::info!(pending = self.sendq.len(), "final flush");
            self.send_data().await;
        }
        self.conn = None;
    }

    async fn send_http(&mut self) -> Result<Delivery, AgentError> {
        let n = self.sendq.len().min(self.max_batch);
        let batch: Vec<Sample> = self.sendq[..n]
            .iter()
            .filter_map(|line| Sample::parse(&self.inject_host_tag(line)).ok())
            .collect();
        let (host, port) = self.current_endpoint();
        let url = format!("http://{host}:{port}/{}", self.http_api_path);
        let endpoint = format!("{host}:{port}");

        let client = self.client.clone();
        let response = client.post(&url).json(&batch).send().await?;
        let status = response.status();
        if status.is_success() {
            self.sendq.drain(..n);
            Ok(Delivery::Delivered(n))
        } else if status.is_client_error() {
            tracing::warn!(endpoint = %endpoint, %status, "TSD returned client error");
            self.sendq.drain(..n);
            Ok(Delivery::Rejected(n))
        } else {
            Err(AgentError::Transport {
                endpoint,
                message: format!("HTTP {status}"),
            })
        }
    }

    async fn send_line(&mut self) -> Result<Delivery, AgentError> {
        let n = self.sendq.len().min(self.max_batch);
        let mut wire = String::new();
        for line in &self.sendq[..n] {
            wire.push_str("put ");
            wire.push_str(&self.inject_host_tag(line));
            wire.push('\n');
        }

        let (host, port) = {
            let ep = &self.endpoints[self.current];
            (ep.host.clone(), ep.port)
        };
        if self.conn.is_none() {
            let connect = TcpStream::connect((host.as_str(), port));
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, connect)
                .await
                .map_err(|_| AgentError::transport(&host, port, "connect timeout"))?
                .map_err(|e| AgentError::transport(&host, port, format!("connect: {e}")))?;
            self.conn = Some(stream);
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(AgentError::transport(&host, port, "no connection"));
        };
        conn.write_all(wire.as_bytes())
            .await
            .map_err(|e| AgentError::transport(&host, port, format!("write: {e}")))?;
        conn.flush()
            .await
            .map_err(|e| AgentError::transport(&host, port, format!("flush: {e}")))?;

        self.sendq.drain(..n);
        Ok(Delivery::Delivered(n))
    }

    /// Append `host=<tag>` to a line that does not already carry a host
    /// tag. Lines with an explicit host tag pass through untouched.
    fn inject_host_tag(&self, line: &str) -> String {
        let Some(tag) = &self.host_tag else {
            return line.to_string();
        };
        let has_host = line
            .split_whitespace()
            .skip(3)
            .any(|tok| tok.split_once('=').is_some_and(|(k, _)| k == "host"));
        if has_host {
            line.to_string()
        } else {
            format!("{line} host={tag}")
        }
    }
}
