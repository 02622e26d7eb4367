use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::config::{HarvestConfig, LlmProvider, RetrySettings};
use crate::error::PipelineError;

pub fn build_client(timeout_secs: u64) -> Result<Client, PipelineError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("geo-harvester/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| PipelineError::Http {
                service: "client".to_string(),
                message: err.to_string(),
            })?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|err| PipelineError::Http {
            service: "client".to_string(),
            message: err.to_string(),
        })
}

/// E-utilities identification parameters taken from the environment.
pub fn ncbi_params() -> Vec<(String, String)> {
    let mut params = Vec::new();
    let tool = std::env::var("NCBI_TOOL").unwrap_or_else(|_| "geo_harvester".to_string());
    params.push(("tool".to_string(), tool));
    for (var, name) in [("NCBI_EMAIL", "email"), ("NCBI_API_KEY", "api_key")] {
        if let Ok(value) = std::env::var(var) {
            if !value.trim().is_empty() {
                params.push((name.to_string(), value.trim().to_string()));
            }
        }
    }
    params
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Result<T, PipelineError>,
    {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{label}: attempt {} failed ({err}); retrying in {}ms",
                        attempt + 1,
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Cooperative minimum-interval throttle shared by every worker that talks to
/// one upstream service.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let wait = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = match *next {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next = Some(slot + self.interval);
            slot - now
        };
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimits {
    pub geo: Arc<RateLimiter>,
    pub sra: Arc<RateLimiter>,
    pub pubmed: Arc<RateLimiter>,
    pub openai: Arc<RateLimiter>,
    pub anthropic: Arc<RateLimiter>,
}

impl RateLimits {
    pub fn from_config(config: &HarvestConfig) -> Self {
        let limits = &config.rate_limits;
        let limiter = |ms: u64| Arc::new(RateLimiter::new(Duration::from_millis(ms)));
        Self {
            geo: limiter(limits.geo_interval_ms),
            sra: limiter(limits.sra_interval_ms),
            pubmed: limiter(limits.pubmed_interval_ms),
            openai: limiter(limits.llm_interval_ms),
            anthropic: limiter(limits.llm_interval_ms),
        }
    }

    pub fn for_provider(&self, provider: LlmProvider) -> Arc<RateLimiter> {
        match provider {
            LlmProvider::OpenAi => self.openai.clone(),
            LlmProvider::Anthropic => self.anthropic.clone(),
        }
    }
}

/// Blocking GET plumbing for one upstream: throttle, send, classify. Retries
/// are applied by the calling resolver.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    service: &'static str,
    limiter: Arc<RateLimiter>,
}

impl HttpFetcher {
    pub fn new(client: Client, service: &'static str, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            service,
            limiter,
        }
    }

    pub fn get_text(
        &self,
        id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<String, PipelineError> {
        let response = self.send(id, || self.client.get(url).query(query))?;
        response.text().map_err(|err| self.transport_error(&err))
    }

    pub fn get_bytes(&self, id: &str, url: &str) -> Result<Vec<u8>, PipelineError> {
        let response = self.send(id, || self.client.get(url))?;
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| self.transport_error(&err))
    }

    fn send<F>(&self, id: &str, make_req: F) -> Result<Response, PipelineError>
    where
        F: FnOnce() -> RequestBuilder,
    {
        self.limiter.acquire();
        let response = make_req()
            .send()
            .map_err(|err| self.transport_error(&err))?;
        let status = response.status().as_u16();
        if response.status().is_success() {
            return Ok(response);
        }
        let message = response
            .text()
            .map(|body| body.chars().take(200).collect::<String>())
            .unwrap_or_else(|_| format!("{} request failed", self.service));
        Err(classify_status(self.service, id, status, message))
    }

    fn transport_error(&self, err: &reqwest::Error) -> PipelineError {
        if is_retryable_error(err) {
            PipelineError::TransientFetch {
                service: self.service.to_string(),
                message: err.to_string(),
            }
        } else {
            PipelineError::Http {
                service: self.service.to_string(),
                message: err.to_string(),
            }
        }
    }
}

pub fn classify_status(service: &str, id: &str, status: u16, message: String) -> PipelineError {
    if status == 404 {
        return PipelineError::not_found(service, id);
    }
    if is_retryable_status(status) {
        return PipelineError::TransientFetch {
            service: service.to_string(),
            message: format!("status {status}: {message}"),
        };
    }
    PipelineError::UpstreamStatus {
        service: service.to_string(),
        status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn retries_only_transient_errors() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        let calls = Cell::new(0);
        let result: Result<(), _> = policy.run("test", || {
            calls.set(calls.get() + 1);
            Err(PipelineError::TransientFetch {
                service: "geo".to_string(),
                message: "timeout".to_string(),
            })
        });
        assert_matches!(result, Err(PipelineError::TransientFetch { .. }));
        assert_eq!(calls.get(), 3);

        calls.set(0);
        let result: Result<(), _> = policy.run("test", || {
            calls.set(calls.get() + 1);
            Err(PipelineError::not_found("geo", "GSE1"))
        });
        assert_matches!(result, Err(PipelineError::NotFound { .. }));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn status_classification() {
        assert_matches!(
            classify_status("geo", "GSE1", 404, String::new()),
            PipelineError::NotFound { .. }
        );
        assert_matches!(
            classify_status("geo", "GSE1", 429, String::new()),
            PipelineError::TransientFetch { .. }
        );
        assert_matches!(
            classify_status("geo", "GSE1", 400, String::new()),
            PipelineError::UpstreamStatus { status: 400, .. }
        );
    }
}
