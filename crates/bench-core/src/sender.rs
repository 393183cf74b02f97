use anyhow::{bail, Context, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            body,
        }
    }
}

/// Broker verdict for a message that reached it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Ok,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
    /// Broker answered with an error status code
    Rejected(u16),
    /// Broker answered 2xx with a status name we do not know
    Unknown,
}

impl SendStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SendStatus::Ok)
    }

    /// Parse a broker status name, `None` if it is not one we know.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "OK" | "SEND_OK" => Some(SendStatus::Ok),
            "FLUSH_DISK_TIMEOUT" => Some(SendStatus::FlushDiskTimeout),
            "FLUSH_SLAVE_TIMEOUT" => Some(SendStatus::FlushSlaveTimeout),
            "SLAVE_NOT_AVAILABLE" => Some(SendStatus::SlaveNotAvailable),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResult {
    pub status: SendStatus,
}

impl SendResult {
    pub fn ok() -> Self {
        Self {
            status: SendStatus::Ok,
        }
    }
}

/// Client capability the benchmark drives.
///
/// `send_sync` resolves once the broker has answered; an `Err` is a
/// transport failure, a non-OK status is a broker answer.
pub trait MessageSender: Send + Sync {
    fn name(&self) -> &'static str;

    fn start(&self) -> BoxFuture<'_, Result<()>>;

    fn send_sync<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<SendResult>>;

    fn shutdown(&self) -> BoxFuture<'_, ()>;
}

/// Mock sender for testing (always answers OK after a fixed delay)
pub struct MockSender {
    delay: Duration,
}

impl MockSender {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
        }
    }
}

impl MessageSender for MockSender {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn send_sync<'a>(&'a self, _message: &'a Message) -> BoxFuture<'a, Result<SendResult>> {
        Box::pin(async move {
            sleep(self.delay).await;
            Ok(SendResult::ok())
        })
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Sends each message as an HTTP POST, rotating over the name server list.
pub struct HttpSender {
    client: reqwest::Client,
    urls: Vec<url::Url>,
    next_url_idx: AtomicUsize,
}

impl HttpSender {
    pub fn new(addresses: &[String], timeout_ms: u64) -> Result<Self> {
        if addresses.is_empty() {
            bail!("no name server address configured");
        }
        let urls = addresses
            .iter()
            .map(|a| parse_address(a).with_context(|| format!("Invalid name server address: {a}")))
            .collect::<Result<Vec<_>>>()?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .tcp_keepalive(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            urls,
            next_url_idx: AtomicUsize::new(0),
        })
    }

    fn next_url(&self) -> &url::Url {
        let idx = self.next_url_idx.fetch_add(1, Ordering::Relaxed);
        &self.urls[idx % self.urls.len()]
    }

    async fn check_health(&self) -> Result<()> {
        for base in &self.urls {
            let health = endpoint(base, &["health"])?;
            let response = self
                .client
                .get(health.clone())
                .send()
                .await
                .with_context(|| format!("Failed to reach {health}"))?;
            if !response.status().is_success() {
                bail!("{health} answered {}", response.status());
            }
            debug!("Name server {} is healthy", base);
        }
        Ok(())
    }

    async fn post(&self, message: &Message) -> Result<SendResult> {
        let url = endpoint(
            self.next_url(),
            &["topics", message.topic.as_str(), "messages"],
        )?;
        let response = self
            .client
            .post(url)
            .body(message.body.clone())
            .send()
            .await?;

        let code = response.status();
        if !code.is_success() {
            return Ok(SendResult {
                status: SendStatus::Rejected(code.as_u16()),
            });
        }

        // A 2xx without a readable status field counts as OK.
        let status = match response.json::<serde_json::Value>().await {
            Ok(body) => match body.get("status").and_then(|s| s.as_str()) {
                Some(name) => SendStatus::from_name(name).unwrap_or_else(|| {
                    warn!("Unknown send status '{}' from broker", name);
                    SendStatus::Unknown
                }),
                None => SendStatus::Ok,
            },
            Err(_) => SendStatus::Ok,
        };
        Ok(SendResult { status })
    }
}

fn parse_address(raw: &str) -> Result<url::Url> {
    let raw = raw.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    let url = url::Url::parse(&with_scheme)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        bail!("unsupported scheme {}", url.scheme());
    }
    if url.host_str().is_none() {
        bail!("address has no host");
    }
    Ok(url)
}

/// `base` with `segments` appended below its path, trailing slash or not.
fn endpoint(base: &url::Url, segments: &[&str]) -> Result<url::Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("address cannot carry a path: {base}"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

impl MessageSender for HttpSender {
    fn name(&self) -> &'static str {
        "http"
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.check_health())
    }

    fn send_sync<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<SendResult>> {
        Box::pin(self.post(message))
    }

    fn shutdown(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
