//! ECS instance metadata service client (token mode).

use core::error::Error;
use std::time::Duration;
use std::time::Instant;

use error_stack::Report;
use error_stack::ResultExt;
use rand::Rng;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

pub const DEFAULT_METADATA_ENDPOINT: &str = "http://100.100.100.200";

const TOKEN_PATH: &str = "/latest/api/token";
const METADATA_PATH: &str = "/latest/meta-data";
const TOKEN_HEADER: &str = "X-aliyun-ecs-metadata-token";
const TOKEN_TTL_HEADER: &str = "X-aliyun-ecs-metadata-token-ttl-seconds";
const TOKEN_TTL: Duration = Duration::from_secs(21600);

#[derive(Debug, derive_more::Display)]
pub enum MetadataError {
    #[display("metadata request {path} failed")]
    Transport { path: String },
    #[display("metadata request {path} returned {status}")]
    Status { path: String, status: u16 },
    #[display("metadata request {path} gave up after {attempts} attempts")]
    Exhausted { path: String, attempts: u32 },
    #[display("metadata token rejected for {path}")]
    Unauthorized { path: String },
}

impl Error for MetadataError {}

/// Exponential backoff with jitter and a fixed number of attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub steps: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 1.2,
            jitter: 0.1,
            steps: 4,
        }
    }
}

impl Backoff {
    /// Sleep before attempt `attempt + 1`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        self.initial.mul_f64(self.factor.powi(attempt as i32))
    }

    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        base + base.mul_f64(self.jitter * rand::thread_rng().gen_range(0.0..1.0))
    }
}

enum Outcome {
    Retry(Report<MetadataError>),
    Fatal(Report<MetadataError>),
}

fn classify(path: &str, status: StatusCode) -> Outcome {
    let report = if status == StatusCode::UNAUTHORIZED {
        Report::new(MetadataError::Unauthorized {
            path: path.to_string(),
        })
    } else {
        Report::new(MetadataError::Status {
            path: path.to_string(),
            status: status.as_u16(),
        })
    };
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Outcome::Retry(report)
    } else {
        Outcome::Fatal(report)
    }
}

/// The first line of a metadata value, without surrounding slashes.
pub fn first_value(body: &str) -> String {
    body.lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches('/')
        .to_string()
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct MetadataClient {
    http: reqwest::Client,
    endpoint: String,
    backoff: Backoff,
    token: Mutex<Option<CachedToken>>,
}

impl MetadataClient {
    pub fn new() -> Result<Self, Report<MetadataError>> {
        Self::with_endpoint(DEFAULT_METADATA_ENDPOINT, Backoff::default())
    }

    pub fn with_endpoint(endpoint: &str, backoff: Backoff) -> Result<Self, Report<MetadataError>> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .change_context(MetadataError::Transport {
                path: endpoint.to_string(),
            })?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            backoff,
            token: Mutex::new(None),
        })
    }

    pub async fn region_id(&self) -> Result<String, Report<MetadataError>> {
        self.get("region-id").await
    }

    pub async fn instance_id(&self) -> Result<String, Report<MetadataError>> {
        self.get("instance-id").await
    }

    pub async fn private_ip(&self, mac: &str) -> Result<String, Report<MetadataError>> {
        self.get(&format!("network/interfaces/macs/{mac}/primary-ip-address"))
            .await
    }

    pub async fn vswitch_cidr(&self, mac: &str) -> Result<String, Report<MetadataError>> {
        self.get(&format!("network/interfaces/macs/{mac}/vswitch-cidr-block"))
            .await
    }

    pub async fn gateway(&self, mac: &str) -> Result<String, Report<MetadataError>> {
        self.get(&format!("network/interfaces/macs/{mac}/gateway"))
            .await
    }

    /// Fetches `/latest/meta-data/{path}`. A rejected token is dropped and
    /// the request is tried once more with a fresh one.
    pub async fn get(&self, path: &str) -> Result<String, Report<MetadataError>> {
        let url = format!("{}{METADATA_PATH}/{path}", self.endpoint);
        let mut token_refreshed = false;
        loop {
            let token = self.token().await?;
            let result = self
                .with_retry(path, || {
                    self.http
                        .get(url.as_str())
                        .header(TOKEN_HEADER, token.as_str())
                })
                .await;
            match result {
                Err(e)
                    if !token_refreshed
                        && matches!(e.current_context(), MetadataError::Unauthorized { .. }) =>
                {
                    warn!("metadata token rejected, fetching a new one");
                    *self.token.lock().await = None;
                    token_refreshed = true;
                }
                other => return other.map(|body| first_value(&body)),
            }
        }
    }

    /// Cached token, fetched while holding the lock so concurrent callers
    /// share one request.
    async fn token(&self) -> Result<String, Report<MetadataError>> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }
        let url = format!("{}{TOKEN_PATH}", self.endpoint);
        let value = self
            .with_retry(TOKEN_PATH, || {
                self.http
                    .put(url.as_str())
                    .header(TOKEN_TTL_HEADER, TOKEN_TTL.as_secs().to_string())
            })
            .await?;
        debug!("fetched metadata token");
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now() + TOKEN_TTL / 2,
        });
        Ok(value)
    }

    async fn with_retry<F>(&self, path: &str, build: F) -> Result<String, Report<MetadataError>>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut last: Option<Report<MetadataError>> = None;
        for attempt in 0..self.backoff.steps {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
            }
            let outcome = match build().send().await {
                Ok(response) if response.status().is_success() => {
                    return response.text().await.change_context(MetadataError::Transport {
                        path: path.to_string(),
                    });
                }
                Ok(response) => classify(path, response.status()),
                Err(e) => Outcome::Retry(Report::new(e).change_context(
                    MetadataError::Transport {
                        path: path.to_string(),
                    },
                )),
            };
            match outcome {
                Outcome::Fatal(report) => return Err(report),
                Outcome::Retry(report) => {
                    debug!(path, attempt, "metadata request failed, retrying");
                    last = Some(report);
                }
            }
        }
        let exhausted = MetadataError::Exhausted {
            path: path.to_string(),
            attempts: self.backoff.steps,
        };
        Err(match last {
            Some(report) => report.change_context(exhausted),
            None => Report::new(exhausted),
        })
    }
}
