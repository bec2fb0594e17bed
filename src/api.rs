// API client module: a small blocking HTTP client that talks to the build
// server. All network interaction lives here: retry policy, the crumb
// (anti-forgery token) handshake, and response decoding are hidden behind
// the `Api` trait so the command runner never touches HTTP directly.

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

/// Errors raised by the client. Logical outcomes (unknown job, unsuccessful
/// build) are not errors; they are ordinary return values upstream.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("server returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("crumb issuer unreachable at {url}: {reason}")]
    CrumbIssuer { url: String, reason: String },

    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

/// Terminal state of a build as reported by the server. A build that is
/// still running has no result yet, which callers see as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildResult {
    Success,
    Failure,
    Aborted,
    Unstable,
    Other(String),
}

impl BuildResult {
    pub fn from_raw(raw: &str) -> BuildResult {
        match raw {
            "SUCCESS" => BuildResult::Success,
            "FAILURE" => BuildResult::Failure,
            "ABORTED" => BuildResult::Aborted,
            "UNSTABLE" => BuildResult::Unstable,
            other => BuildResult::Other(other.to_string()),
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildResult::Success => f.write_str("SUCCESS"),
            BuildResult::Failure => f.write_str("FAILURE"),
            BuildResult::Aborted => f.write_str("ABORTED"),
            BuildResult::Unstable => f.write_str("UNSTABLE"),
            BuildResult::Other(raw) => f.write_str(raw),
        }
    }
}

/// Bounded retry budget for idempotent reads. `attempts` counts the first
/// try as well, so the default of 4 means one call plus three retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 4,
            delay: Duration::from_secs(1),
        }
    }
}

/// The anti-forgery token pair handed out by the crumb issuer. The field
/// name becomes the HTTP header key on write requests, the value its value.
#[derive(Debug, Clone, Deserialize)]
pub struct Crumb {
    #[serde(rename = "crumbRequestField")]
    pub field: String,
    #[serde(rename = "crumb")]
    pub value: String,
}

/// The operations the command runner needs. `ApiClient` is the real thing;
/// tests substitute a fake.
pub trait Api {
    fn list_jobs(&mut self) -> Result<Vec<String>, ApiError>;
    fn get_result(&mut self, job: &str) -> Result<Option<BuildResult>, ApiError>;
    fn is_building(&mut self, job: &str) -> Result<bool, ApiError>;
    fn get_logs(&mut self, job: &str, build_id: &str) -> Result<String, ApiError>;
    fn build(&mut self, job: &str, params: &BTreeMap<String, String>) -> Result<(), ApiError>;
}

impl<T: Api> Api for &mut T {
    fn list_jobs(&mut self) -> Result<Vec<String>, ApiError> {
        (**self).list_jobs()
    }
    fn get_result(&mut self, job: &str) -> Result<Option<BuildResult>, ApiError> {
        (**self).get_result(job)
    }
    fn is_building(&mut self, job: &str) -> Result<bool, ApiError> {
        (**self).is_building(job)
    }
    fn get_logs(&mut self, job: &str, build_id: &str) -> Result<String, ApiError> {
        (**self).get_logs(job, build_id)
    }
    fn build(&mut self, job: &str, params: &BTreeMap<String, String>) -> Result<(), ApiError> {
        (**self).build(job, params)
    }
}

/// Session-scoped client: holds the reqwest blocking client, the server
/// coordinates and credentials, and the lazily-acquired crumb. The crumb is
/// fetched on the first write and reused for every later write in the same
/// process, and never re-fetched while present.
pub struct ApiClient {
    client: Client,
    base_url: String,
    context_root: String,
    user: String,
    token: String,
    retry: RetryPolicy,
    crumb: Option<Crumb>,
}

#[derive(Deserialize)]
struct JobsResponse {
    jobs: Vec<JobEntry>,
}

#[derive(Deserialize)]
struct JobEntry {
    name: String,
}

#[derive(Deserialize)]
struct ResultResponse {
    result: Option<String>,
}

#[derive(Deserialize)]
struct BuildStatusResponse {
    building: bool,
}

#[derive(Serialize)]
struct BuildParameter {
    name: String,
    value: String,
}

#[derive(Serialize)]
struct BuildPayload {
    parameter: Vec<BuildParameter>,
}

impl ApiClient {
    /// Create a client from a loaded configuration with the default retry
    /// budget (3 retries spaced 1 s apart).
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        Self::with_retry(config, RetryPolicy::default())
    }

    /// Same as `new` but with an explicit retry budget. Tests use this to
    /// drop the inter-attempt delay.
    pub fn with_retry(config: &Config, retry: RetryPolicy) -> anyhow::Result<Self> {
        use anyhow::Context;
        let client = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(ApiClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            context_root: config.context_root.clone(),
            user: config.user.clone(),
            token: config.token.clone(),
            retry,
            crumb: None,
        })
    }

    /// Issue a GET with the bounded retry loop. Connection failures, 5xx
    /// statuses and undecodable bodies are retried; 4xx statuses are logical
    /// failures and surface immediately.
    fn get_with_retry<T>(
        &self,
        url: &str,
        decode: impl Fn(Response) -> Result<T, ApiError>,
    ) -> Result<T, ApiError> {
        let attempts = self.retry.attempts.max(1);
        for attempt in 1..=attempts {
            tracing::debug!(%url, attempt, "GET");
            let failure = match self
                .client
                .get(url)
                .basic_auth(&self.user, Some(&self.token))
                .send()
            {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match decode(resp) {
                            Ok(value) => return Ok(value),
                            Err(e) => e,
                        }
                    } else if status.is_server_error() {
                        ApiError::Status {
                            status,
                            url: url.to_string(),
                        }
                    } else {
                        return Err(ApiError::Status {
                            status,
                            url: url.to_string(),
                        });
                    }
                }
                Err(source) => ApiError::Transport {
                    url: url.to_string(),
                    attempts: attempt,
                    source,
                },
            };
            if attempt == attempts {
                return Err(failure);
            }
            eprintln!("request failed, retrying ({attempt}/{attempts}): {failure}");
            thread::sleep(self.retry.delay);
        }
        unreachable!("retry loop always returns")
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        self.get_with_retry(url, |resp| {
            resp.json::<T>().map_err(|e| ApiError::Decode {
                url: url.to_string(),
                reason: e.to_string(),
            })
        })
    }

    fn get_text(&self, url: &str) -> Result<String, ApiError> {
        self.get_with_retry(url, |resp| {
            resp.text().map_err(|e| ApiError::Decode {
                url: url.to_string(),
                reason: e.to_string(),
            })
        })
    }

    /// The issuer lives at the scheme+host of the base URL plus the context
    /// root; any job-relative path on the base URL is deliberately skipped.
    fn crumb_url(&self) -> Result<String, ApiError> {
        let parsed = Url::parse(&self.base_url).map_err(|e| ApiError::CrumbIssuer {
            url: self.base_url.clone(),
            reason: format!("invalid base URL: {e}"),
        })?;
        let host = parsed.host_str().ok_or_else(|| ApiError::CrumbIssuer {
            url: self.base_url.clone(),
            reason: "base URL has no host".to_string(),
        })?;
        let mut origin = format!("{}://{}", parsed.scheme(), host);
        if let Some(port) = parsed.port() {
            origin.push_str(&format!(":{port}"));
        }
        Ok(format!("{origin}{}/crumbIssuer/api/json", self.context_root))
    }

    /// Fetch the crumb on first use and cache it for the rest of the
    /// session. The issuer call is not retried: if it is unreachable the
    /// pending write fails.
    fn crumb(&mut self) -> Result<Crumb, ApiError> {
        if let Some(crumb) = &self.crumb {
            return Ok(crumb.clone());
        }
        let url = self.crumb_url()?;
        tracing::debug!(%url, "fetching crumb");
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.user, Some(&self.token))
            .send()
            .map_err(|e| ApiError::CrumbIssuer {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if !resp.status().is_success() {
            return Err(ApiError::CrumbIssuer {
                url,
                reason: format!("status {}", resp.status()),
            });
        }
        let crumb: Crumb = resp.json().map_err(|e| ApiError::CrumbIssuer {
            url,
            reason: e.to_string(),
        })?;
        self.crumb = Some(crumb.clone());
        Ok(crumb)
    }
}

impl Api for ApiClient {
    /// List all job names in the order the server reports them.
    fn list_jobs(&mut self) -> Result<Vec<String>, ApiError> {
        let url = format!("{}/api/json?tree=jobs[name,order]", self.base_url);
        let body: JobsResponse = self.get_json(&url)?;
        Ok(body.jobs.into_iter().map(|j| j.name).collect())
    }

    /// Result of the last build. `None` means the build has not finished,
    /// which is distinct from any terminal state.
    fn get_result(&mut self, job: &str) -> Result<Option<BuildResult>, ApiError> {
        let url = format!("{}/job/{job}/lastBuild/api/json?tree=result", self.base_url);
        let body: ResultResponse = self.get_json(&url)?;
        Ok(body.result.as_deref().map(BuildResult::from_raw))
    }

    fn is_building(&mut self, job: &str) -> Result<bool, ApiError> {
        let url = format!("{}/job/{job}/lastBuild/api/json", self.base_url);
        let body: BuildStatusResponse = self.get_json(&url)?;
        Ok(body.building)
    }

    /// Raw console text for a build. `build_id` is a build number or the
    /// alias `lastBuild`.
    fn get_logs(&mut self, job: &str, build_id: &str) -> Result<String, ApiError> {
        let url = format!("{}/job/{job}/{build_id}/consoleText", self.base_url);
        self.get_text(&url)
    }

    /// Start a parameterized build. Attaches the cached crumb as a header,
    /// fetching it first if this is the session's first write.
    fn build(&mut self, job: &str, params: &BTreeMap<String, String>) -> Result<(), ApiError> {
        let crumb = self.crumb()?;
        let url = format!("{}/job/{job}/build", self.base_url);
        let payload = BuildPayload {
            parameter: params
                .iter()
                .map(|(name, value)| BuildParameter {
                    name: name.clone(),
                    value: value.clone(),
                })
                .collect(),
        };
        let body = serde_json::to_string(&payload).map_err(|e| ApiError::Decode {
            url: url.clone(),
            reason: e.to_string(),
        })?;
        let header =
            HeaderName::from_bytes(crumb.field.as_bytes()).map_err(|e| ApiError::Decode {
                url: url.clone(),
                reason: format!("invalid crumb field name: {e}"),
            })?;
        let value = HeaderValue::from_str(&crumb.value).map_err(|e| ApiError::Decode {
            url: url.clone(),
            reason: format!("invalid crumb value: {e}"),
        })?;
        tracing::debug!(%url, "POST build");
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.token))
            .header(header, value)
            .form(&[("json", body)])
            .send()
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                attempts: 1,
                source,
            })?;
        if !resp.status().is_success() {
            return Err(ApiError::Status {
                status: resp.status(),
                url,
            });
        }
        Ok(())
    }
}
