//! Single probe execution: one HTTP request, ICMP echo or TCP connect with a
//! hard timeout and fixed-delay retries. Failures are values, never errors.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use taskclaw_core::config::HttpConfig;
use taskclaw_core::error::{Result, TaskClawError};
use taskclaw_core::types::{HttpMethod, HttpRequest, ProbeError, ProbeErrorKind, ProbeSettings, Protocol, StepResult};

/// Seam between orchestration and the network.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run one probe, retries included.
    async fn run(&self, protocol: &Protocol, settings: &ProbeSettings) -> StepResult;
}

/// Network-backed runner.
pub struct StepExecutor {
    client: reqwest::Client,
    ping_binary: String,
}

impl StepExecutor {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| TaskClawError::Http(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            ping_binary: config.ping_binary.clone(),
        })
    }

    async fn attempt(&self, protocol: &Protocol, timeout: Duration) -> StepResult {
        match protocol {
            Protocol::Http(request) => self.http(request, timeout).await,
            Protocol::Icmp { host } => self.icmp(host, timeout).await,
            Protocol::Tcp { host, port } => self.tcp(host, *port, timeout).await,
        }
    }

    async fn http(&self, request: &HttpRequest, timeout: Duration) -> StepResult {
        let started = Instant::now();
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        };

        let mut req = self.client.request(method, &request.url).timeout(timeout);
        for (key, value) in &request.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            req = req.body(body.clone());
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                let message = describe(&e);
                return StepResult::failed(classify(&e), message, elapsed_ms(started));
            }
        };

        let status = resp.status().as_u16();
        let headers: BTreeMap<String, String> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
            .collect();

        match resp.text().await {
            Ok(body) => StepResult {
                status_code: Some(status),
                headers,
                body,
                duration_ms: elapsed_ms(started),
                retry_attempt: 0,
                error: None,
            },
            Err(e) => StepResult {
                status_code: Some(status),
                headers,
                duration_ms: elapsed_ms(started),
                error: Some(ProbeError {
                    kind: classify(&e),
                    message: format!("reading body: {}", describe(&e)),
                }),
                ..Default::default()
            },
        }
    }

    async fn icmp(&self, host: &str, timeout: Duration) -> StepResult {
        let started = Instant::now();
        let wait_secs = timeout.as_secs().max(1).to_string();
        let mut cmd = tokio::process::Command::new(&self.ping_binary);
        cmd.args(["-c", "1", "-W", wait_secs.as_str(), host]).kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => StepResult::failed(
                ProbeErrorKind::Timeout,
                format!("ping {host} timed out after {}s", timeout.as_secs()),
                elapsed_ms(started),
            ),
            Ok(Err(e)) => StepResult::failed(
                ProbeErrorKind::Generic,
                format!("failed to run {}: {e}", self.ping_binary),
                elapsed_ms(started),
            ),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                if output.status.success() {
                    return StepResult {
                        body: stdout,
                        duration_ms: elapsed_ms(started),
                        ..Default::default()
                    };
                }
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let kind = match classify_message(&stderr) {
                    ProbeErrorKind::Generic if output.status.code() == Some(1) => ProbeErrorKind::Timeout,
                    kind => kind,
                };
                let detail = if stderr.trim().is_empty() { stdout } else { stderr };
                StepResult::failed(kind, format!("ping {host}: {}", detail.trim()), elapsed_ms(started))
            }
        }
    }

    async fn tcp(&self, host: &str, port: u16, timeout: Duration) -> StepResult {
        let started = Instant::now();
        let connect = async {
            let mut addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(|e| (ProbeErrorKind::DnsFailure, format!("failed to resolve {host}: {e}")))?;
            let addr = addrs
                .next()
                .ok_or_else(|| (ProbeErrorKind::DnsFailure, format!("{host} resolved to no addresses")))?;
            let stream = tokio::net::TcpStream::connect(addr).await.map_err(|e| {
                let kind = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    ProbeErrorKind::ConnectionRefused
                } else {
                    ProbeErrorKind::Generic
                };
                (kind, format!("connect {addr}: {e}"))
            })?;
            Ok::<_, (ProbeErrorKind, String)>(stream)
        };

        match tokio::time::timeout(timeout, connect).await {
            Err(_) => StepResult::failed(
                ProbeErrorKind::Timeout,
                format!("connect {host}:{port} timed out after {}s", timeout.as_secs()),
                elapsed_ms(started),
            ),
            Ok(Err((kind, message))) => StepResult::failed(kind, message, elapsed_ms(started)),
            Ok(Ok(_stream)) => StepResult {
                body: format!("connected to {host}:{port}"),
                duration_ms: elapsed_ms(started),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl StepRunner for StepExecutor {
    async fn run(&self, protocol: &Protocol, settings: &ProbeSettings) -> StepResult {
        let timeout = Duration::from_secs(u64::from(settings.timeout_seconds.max(1)));
        let mut attempt = 0;
        loop {
            let mut result = self.attempt(protocol, timeout).await;
            result.retry_attempt = attempt;
            if result.is_success() || attempt >= settings.retry_count {
                return result;
            }
            tracing::debug!(
                "🔁 Attempt {} failed ({}), retrying in {}s",
                attempt + 1,
                result.error_message().unwrap_or_default(),
                settings.retry_delay_seconds
            );
            tokio::time::sleep(Duration::from_secs(u64::from(settings.retry_delay_seconds))).await;
            attempt += 1;
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// The error plus its source chain; hyper/DNS details live in the sources.
fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn classify(err: &reqwest::Error) -> ProbeErrorKind {
    if err.is_timeout() {
        return ProbeErrorKind::Timeout;
    }
    classify_message(&describe(err))
}

fn classify_message(detail: &str) -> ProbeErrorKind {
    let detail = detail.to_lowercase();
    const DNS_MARKERS: [&str; 7] = [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "no such host",
        "nodename nor servname",
        "temporary failure in name resolution",
        "unknown host",
    ];
    if DNS_MARKERS.iter().any(|m| detail.contains(m)) {
        ProbeErrorKind::DnsFailure
    } else if detail.contains("connection refused") {
        ProbeErrorKind::ConnectionRefused
    } else if detail.contains("timed out") {
        ProbeErrorKind::Timeout
    } else {
        ProbeErrorKind::Generic
    }
}
