//! Minimal triage HTTP client (`spec.md` §4.4 Stage 1, §2 "Triage client").
//! A thin JSON-over-HTTPS caller against an external model endpoint; used
//! for yes/no triage and short-title generation.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum TriageError {
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    BadResponseShape,
}

impl fmt::Display for TriageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriageError::Http(e) => write!(f, "triage request failed: {e}"),
            TriageError::BadStatus(status) => write!(f, "Anthropic API {status}: triage request rejected"),
            TriageError::BadResponseShape => write!(f, "triage response body had an unexpected shape"),
        }
    }
}

impl std::error::Error for TriageError {}

impl From<reqwest::Error> for TriageError {
    fn from(err: reqwest::Error) -> Self {
        TriageError::Http(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageVerdict {
    Accept,
    Reject,
}

#[derive(Serialize)]
struct TriageRequestBody<'a> {
    prompt: &'a str,
    model: Option<&'a str>,
}

#[derive(Deserialize)]
struct TriageResponseBody {
    result: String,
}

pub struct TriageClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl TriageClient {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder never fails with these options");
        Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        }
    }

    async fn call(&self, prompt: &str, model: Option<&str>) -> Result<String, TriageError> {
        let mut request = self.http.post(&self.endpoint).json(&TriageRequestBody { prompt, model });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(TriageError::BadStatus(response.status()));
        }
        let body: TriageResponseBody = response.json().await.map_err(|_| TriageError::BadResponseShape)?;
        Ok(body.result)
    }

    /// Returns `Accept` when the model's first response line starts with
    /// `YES`, `Reject` when it starts with `NO` (`spec.md` §4.4).
    pub async fn triage(&self, prompt: &str, model: Option<&str>) -> Result<TriageVerdict, TriageError> {
        let result = self.call(prompt, model).await?;
        let first_line = result.lines().next().unwrap_or("").trim();
        if first_line.starts_with("NO") {
            Ok(TriageVerdict::Reject)
        } else if first_line.starts_with("YES") {
            Ok(TriageVerdict::Accept)
        } else {
            Err(TriageError::BadResponseShape)
        }
    }

    /// An at-most-8-word title for a session (`spec.md` §4.6 "Title generation").
    pub async fn short_title(&self, prompt: &str, model: Option<&str>) -> Result<String, TriageError> {
        let title_prompt = format!(
            "Generate a title of at most 8 words for this request:\n\n{prompt}"
        );
        let result = self.call(&title_prompt, model).await?;
        let words: Vec<&str> = result.split_whitespace().take(8).collect();
        Ok(words.join(" "))
    }
}
