use crate::config::FetchConfig;
use crate::metrics_defs::{FETCH_DURATION, FETCH_FAILURE, FETCH_SUCCESS};
use crate::tabular;
use crate::types::{Payload, Row, SourceLocation};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use shared::{counter, histogram};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use url::{Url, form_urlencoded};

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("{0} timed out")]
    Timeout(String),

    #[error("invalid URL {0:?}")]
    InvalidUrl(String),

    #[error("could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("all sheet mirrors failed: {}", .0.join("; "))]
    AllMirrorsFailed(Vec<String>),
}

/// Retrieves and decodes one source from upstream.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, location: &SourceLocation) -> Result<Payload, FetchError>;
}

pub struct HttpUpstream {
    client: reqwest::Client,
    timeout: Duration,
    sheet_mirrors: Vec<String>,
}

impl HttpUpstream {
    pub fn new(config: &FetchConfig) -> Self {
        HttpUpstream {
            client: reqwest::Client::new(),
            timeout: config.timeout(),
            sheet_mirrors: config.sheet_mirrors.clone(),
        }
    }

    /// Tries each mirror in order and returns the first well-formed row array.
    async fn fetch_sheet(&self, spreadsheet_id: &str, tab: &str) -> Result<Payload, FetchError> {
        let mut errors = Vec::with_capacity(self.sheet_mirrors.len());

        for template in &self.sheet_mirrors {
            let attempt = match mirror_url(template, spreadsheet_id, tab) {
                Ok(url) => self.get_text(&url).await.and_then(|body| {
                    decode_sheet_rows(&body).map_err(|reason| FetchError::Decode {
                        url: url.to_string(),
                        reason,
                    })
                }),
                Err(e) => Err(e),
            };

            match attempt {
                Ok(rows) => return Ok(Payload::Rows(rows)),
                Err(e) => {
                    tracing::debug!(mirror = %template, error = %e, "Sheet mirror failed");
                    errors.push(e.to_string());
                }
            }
        }

        Err(FetchError::AllMirrorsFailed(errors))
    }

    async fn fetch_csv(
        &self,
        url: &str,
        sanitize_headers: bool,
        raw_number: bool,
    ) -> Result<Payload, FetchError> {
        let url = parse_url(url)?;
        let body = self.get_text(&url).await?;

        if raw_number {
            return Ok(Payload::Scalar {
                count: tabular::decode_scalar(&body),
            });
        }

        Ok(Payload::Rows(tabular::decode(&body, sanitize_headers)))
    }

    async fn fetch_document(&self, url: &str) -> Result<Payload, FetchError> {
        let url = parse_url(url)?;
        let body = self.get_text(&url).await?;
        Ok(Payload::Markup(body))
    }

    /// GETs `url` and reads the whole body. The timeout covers connecting,
    /// response headers and the body.
    async fn get_text(&self, url: &Url) -> Result<String, FetchError> {
        let request = async {
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Ok(Err(status));
            }
            let body = response.text().await?;
            Ok::<_, reqwest::Error>(Ok(body))
        };

        timeout(self.timeout, request)
            .await
            .map_err(|_| FetchError::Timeout(url.to_string()))?
            .map_err(|source| FetchError::Http {
                url: url.to_string(),
                source,
            })?
            .map_err(|status| FetchError::Status {
                url: url.to_string(),
                status,
            })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, location: &SourceLocation) -> Result<Payload, FetchError> {
        let kind = location.kind().as_str();
        let start = Instant::now();

        let result = match location {
            SourceLocation::Sheet {
                spreadsheet_id,
                tab,
            } => self.fetch_sheet(spreadsheet_id, tab).await,
            SourceLocation::Csv {
                url,
                sanitize_headers,
                raw_number,
            } => self.fetch_csv(url, *sanitize_headers, *raw_number).await,
            SourceLocation::Document { url } => self.fetch_document(url).await,
        };

        histogram!(FETCH_DURATION, "kind" => kind).record(start.elapsed().as_secs_f64());
        match &result {
            Ok(_) => counter!(FETCH_SUCCESS, "kind" => kind).increment(1),
            Err(_) => counter!(FETCH_FAILURE, "kind" => kind).increment(1),
        }

        result
    }
}

fn parse_url(url: &str) -> Result<Url, FetchError> {
    Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))
}

fn mirror_url(template: &str, spreadsheet_id: &str, tab: &str) -> Result<Url, FetchError> {
    let url = template
        .replace("{spreadsheet_id}", &encode_segment(spreadsheet_id))
        .replace("{tab}", &encode_segment(tab));
    parse_url(&url)
}

fn encode_segment(segment: &str) -> String {
    // form encoding turns spaces into '+'; a literal '+' is already escaped as %2B.
    form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Mirrors answer with a JSON array of flat objects. Anything else, including
/// an error object served with a 200, counts as a failed attempt.
fn decode_sheet_rows(body: &str) -> Result<Vec<Row>, String> {
    let value: Value = serde_json::from_str(body).map_err(|e| e.to_string())?;
    let Value::Array(items) = value else {
        return Err("expected a JSON array".to_string());
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(fields) => Ok(fields
                .into_iter()
                .map(|(key, value)| (key, cell_to_string(value)))
                .collect()),
            other => Err(format!("expected an object per row, got {other}")),
        })
        .collect()
}

fn cell_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
