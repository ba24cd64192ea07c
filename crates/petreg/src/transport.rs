//! HTTP transport to the remote source.
//!
//! Not a browser: plain GET for session bootstrap and decoys, form-encoded
//! POST to the handler endpoint, JSON POST to the service endpoint. Retries
//! are the retry controller's job, so every method performs exactly one
//! exchange and reports non-2xx statuses as ordinary responses.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use serde_json::Value;

use crate::config::SourceConfig;
use crate::error::{AcquireError, AcquireResult};

/// Response from one HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Requested URL.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// All response headers, lowercase names. Repeated headers stay repeated.
    pub headers: Vec<(String, String)>,
    /// Response body as text.
    pub body: String,
}

impl HttpResponse {
    /// A 200 response with an HTML or JSON body.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            url: String::new(),
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// All values of a header (case-insensitive name).
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header_values("content-type").next()
    }
}

/// The three request shapes the engine needs from the network.
#[async_trait]
pub trait SourceTransport: Send + Sync {
    /// Plain page fetch.
    async fn get(&self, url: &str, headers: &[(String, String)]) -> AcquireResult<HttpResponse>;

    /// Form-encoded POST.
    async fn post_form(
        &self,
        url: &str,
        form_fields: &[(String, String)],
        headers: &[(String, String)],
    ) -> AcquireResult<HttpResponse>;

    /// JSON POST.
    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &[(String, String)],
    ) -> AcquireResult<HttpResponse>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    /// HTTP/1.1-only fallback client for servers that reject HTTP/2.
    h1_client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout_ms: u64) -> AcquireResult<Self> {
        let timeout = Duration::from_millis(timeout_ms);

        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8",
            ),
        );
        default_headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-TW,zh;q=0.9,en-US;q=0.8,en;q=0.7"),
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(user_agent)
            .default_headers(default_headers.clone())
            .build()?;

        let h1_client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(user_agent)
            .default_headers(default_headers)
            .http1_only()
            .build()?;

        Ok(Self {
            client,
            h1_client,
            timeout,
        })
    }

    pub fn from_config(source: &SourceConfig) -> AcquireResult<Self> {
        Self::new(&source.user_agent, source.timeout_ms)
    }

    async fn get_with(
        &self,
        client: &reqwest::Client,
        url: &str,
        headers: &[(String, String)],
    ) -> AcquireResult<HttpResponse> {
        let mut builder = client.get(url).timeout(self.timeout);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;
        Self::collect(url, response).await
    }

    async fn collect(url: &str, r: reqwest::Response) -> AcquireResult<HttpResponse> {
        let status = r.status().as_u16();
        let headers: Vec<(String, String)> = r
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = r.text().await.unwrap_or_default();

        tracing::debug!(url = %url, status, bytes = body.len(), "source responded");

        Ok(HttpResponse {
            url: url.to_string(),
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl SourceTransport for HttpTransport {
    /// Falls back to HTTP/1.1 on protocol errors (some front ends reject HTTP/2).
    async fn get(&self, url: &str, headers: &[(String, String)]) -> AcquireResult<HttpResponse> {
        match self.get_with(&self.client, url, headers).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("http2")
                    || err_str.contains("protocol")
                    || err_str.contains("connection closed")
                {
                    tracing::debug!(url = %url, "retrying GET over HTTP/1.1: {err_str}");
                    self.get_with(&self.h1_client, url, headers).await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn post_form(
        &self,
        url: &str,
        form_fields: &[(String, String)],
        headers: &[(String, String)],
    ) -> AcquireResult<HttpResponse> {
        let mut builder = self.client.post(url).timeout(self.timeout);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.form(form_fields).send().await?;
        Self::collect(url, response).await
    }

    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &[(String, String)],
    ) -> AcquireResult<HttpResponse> {
        let mut builder = self.client.post(url).timeout(self.timeout);
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.json(body).send().await?;
        Self::collect(url, response).await
    }
}

/// One scripted outcome for a replayed request.
#[derive(Debug, Clone)]
pub enum Scripted {
    Respond(HttpResponse),
    Unreachable(String),
}

impl Scripted {
    fn into_result(self, url: &str) -> AcquireResult<HttpResponse> {
        match self {
            Scripted::Respond(mut resp) => {
                resp.url = url.to_string();
                Ok(resp)
            }
            Scripted::Unreachable(msg) => Err(AcquireError::Connectivity(msg)),
        }
    }
}

/// A request observed by [`ReplayTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub form: Vec<(String, String)>,
    pub json: Option<Value>,
    pub headers: Vec<(String, String)>,
}

/// Offline transport that replays canned responses.
///
/// Every GET (entry page, decoys) is answered with the entry response.
/// POSTs consume the query queue in order; once it is drained the
/// fallback outcome is served.
pub struct ReplayTransport {
    entry: Mutex<Scripted>,
    queries: Mutex<VecDeque<Scripted>>,
    fallback: Scripted,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ReplayTransport {
    pub fn new(entry_page_html: impl Into<String>) -> Self {
        Self {
            entry: Mutex::new(Scripted::Respond(HttpResponse::ok(entry_page_html))),
            queries: Mutex::new(VecDeque::new()),
            fallback: Scripted::Respond(HttpResponse::ok("")),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// A source whose every endpoint is down.
    pub fn unreachable() -> Self {
        let down = Scripted::Unreachable("connection refused".to_string());
        Self {
            entry: Mutex::new(down.clone()),
            queries: Mutex::new(VecDeque::new()),
            fallback: down,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_entry(self, entry: Scripted) -> Self {
        *lock(&self.entry) = entry;
        self
    }

    pub fn with_fallback(mut self, fallback: Scripted) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn push(&self, outcome: Scripted) {
        lock(&self.queries).push_back(outcome);
    }

    pub fn push_response(&self, status: u16, body: impl Into<String>) {
        self.push(Scripted::Respond(HttpResponse::with_status(status, body)));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.requests).clone()
    }

    pub fn count(&self, method: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|r| r.method == method)
            .count()
    }

    fn record(&self, request: RecordedRequest) {
        lock(&self.requests).push(request);
    }

    fn next_query(&self, url: &str) -> AcquireResult<HttpResponse> {
        let outcome = lock(&self.queries)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        outcome.into_result(url)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl SourceTransport for ReplayTransport {
    async fn get(&self, url: &str, headers: &[(String, String)]) -> AcquireResult<HttpResponse> {
        self.record(RecordedRequest {
            method: "GET",
            url: url.to_string(),
            form: Vec::new(),
            json: None,
            headers: headers.to_vec(),
        });
        let entry = lock(&self.entry).clone();
        entry.into_result(url)
    }

    async fn post_form(
        &self,
        url: &str,
        form_fields: &[(String, String)],
        headers: &[(String, String)],
    ) -> AcquireResult<HttpResponse> {
        self.record(RecordedRequest {
            method: "POST_FORM",
            url: url.to_string(),
            form: form_fields.to_vec(),
            json: None,
            headers: headers.to_vec(),
        });
        self.next_query(url)
    }

    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        headers: &[(String, String)],
    ) -> AcquireResult<HttpResponse> {
        self.record(RecordedRequest {
            method: "POST_JSON",
            url: url.to_string(),
            form: Vec::new(),
            json: Some(body.clone()),
            headers: headers.to_vec(),
        });
        self.next_query(url)
    }
}
