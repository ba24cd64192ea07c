//! Source-side session state.
//!
//! The source only answers queries that replay the hidden form state and
//! cookies handed out by its entry page. A session is created lazily,
//! replaced wholesale on refresh, and invalidated when the retry controller
//! sees an auth failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};

use crate::error::{AcquireError, AcquireResult};
use crate::transport::{HttpResponse, SourceTransport};

/// Credential bundle required by the source.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Hidden form inputs in document order (`__VIEWSTATE`, ...).
    form_state: Vec<(String, String)>,
    cookies: BTreeMap<String, String>,
    valid: bool,
    created_at: DateTime<Utc>,
    created: Instant,
}

impl SessionContext {
    /// Build a context from the entry page response.
    pub fn from_entry_page(resp: &HttpResponse) -> Self {
        let mut ctx = Self {
            form_state: extract_hidden_fields(&resp.body),
            cookies: BTreeMap::new(),
            valid: true,
            created_at: Utc::now(),
            created: Instant::now(),
        };
        ctx.absorb_cookies(resp);
        ctx
    }

    pub fn form_state(&self) -> &[(String, String)] {
        &self.form_state
    }

    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Headers every request on this session must carry.
    pub fn request_headers(&self, referer: &str) -> Vec<(String, String)> {
        let mut headers = vec![("Referer".to_string(), referer.to_string())];
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.push(("Cookie".to_string(), cookie));
        }
        headers
    }

    /// Fold rotated view state and cookies from a query response into the context.
    pub fn absorb(&mut self, resp: &HttpResponse) {
        self.absorb_cookies(resp);
        let fresh = extract_hidden_fields(&resp.body);
        for (name, value) in fresh {
            match self.form_state.iter_mut().find(|(n, _)| *n == name) {
                Some(slot) => slot.1 = value,
                None => self.form_state.push((name, value)),
            }
        }
    }

    fn absorb_cookies(&mut self, resp: &HttpResponse) {
        for raw in resp.header_values("set-cookie") {
            let pair = raw.split(';').next().unwrap_or("");
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    self.cookies
                        .insert(name.to_string(), value.trim().to_string());
                }
            }
        }
    }
}

/// Collect `<input type="hidden">` name/value pairs in document order.
pub fn extract_hidden_fields(html: &str) -> Vec<(String, String)> {
    if !html.contains("<input") && !html.contains("<INPUT") {
        return Vec::new();
    }
    let document = Html::parse_document(html);
    let Ok(sel) = Selector::parse(r#"input[type="hidden"]"#) else {
        return Vec::new();
    };
    document
        .select(&sel)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or("");
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Owns the single live session for a run.
pub struct SessionManager<T: SourceTransport + ?Sized> {
    transport: Arc<T>,
    entry_page: String,
    context: Option<SessionContext>,
    refresh_count: u32,
}

impl<T: SourceTransport + ?Sized> SessionManager<T> {
    pub fn new(transport: Arc<T>, entry_page: impl Into<String>) -> Self {
        Self {
            transport,
            entry_page: entry_page.into(),
            context: None,
            refresh_count: 0,
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn entry_page(&self) -> &str {
        &self.entry_page
    }

    /// Fetch the entry page and install a fresh context.
    pub async fn acquire(&mut self) -> AcquireResult<&SessionContext> {
        let resp = self
            .transport
            .get(&self.entry_page, &[])
            .await
            .map_err(|e| match e {
                unreachable @ AcquireError::Connectivity(_) => unreachable,
                other => AcquireError::Connectivity(other.to_string()),
            })?;

        if !resp.is_success() {
            return Err(AcquireError::Connectivity(format!(
                "entry page {} returned HTTP {}",
                self.entry_page, resp.status
            )));
        }

        let ctx = SessionContext::from_entry_page(&resp);
        tracing::debug!(
            form_fields = ctx.form_state.len(),
            cookies = ctx.cookies.len(),
            "session acquired"
        );
        Ok(&*self.context.insert(ctx))
    }

    /// Discard the current context and acquire a new one.
    pub async fn refresh(&mut self) -> bool {
        self.context = None;
        self.refresh_count += 1;
        match self.acquire().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("session refresh failed: {e}");
                false
            }
        }
    }

    /// Return the live context, acquiring one if none is valid.
    pub async fn ensure(&mut self) -> AcquireResult<&SessionContext> {
        if !self.is_valid() {
            self.acquire().await?;
        }
        self.context
            .as_ref()
            .ok_or_else(|| AcquireError::Connectivity("no session available".to_string()))
    }

    pub fn is_valid(&self) -> bool {
        self.context.as_ref().map(|c| c.valid).unwrap_or(false)
    }

    /// Mark the current context unusable (auth-failure signal).
    pub fn invalidate(&mut self) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.valid = false;
        }
    }

    pub fn context(&self) -> Option<&SessionContext> {
        self.context.as_ref()
    }

    pub fn absorb(&mut self, resp: &HttpResponse) {
        if let Some(ctx) = self.context.as_mut() {
            ctx.absorb(resp);
        }
    }

    /// Number of `refresh()` calls so far.
    pub fn refresh_count(&self) -> u32 {
        self.refresh_count
    }
}
