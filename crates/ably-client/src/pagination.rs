//! Iteration over server-paginated REST resources, driven by relative
//! `Link` response headers.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::rest::Rest;

static REL_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<([^>]+)>; rel="([^"]+)""#).expect("static regex"));

pub(crate) type PageDecoder<T> =
    Arc<dyn Fn(serde_json::Value) -> Result<Vec<T>, Error> + Send + Sync>;

/// A page-oriented iterator over a paginated resource.
///
/// ```no_run
/// # async fn example(rest: ably_client::Rest) -> Result<(), ably_client::Error> {
/// let mut pages = rest.channel("orders").history(&Default::default()).await?;
/// while pages.next().await {
///     for msg in pages.items() {
///         println!("{:?}", msg.name);
///     }
/// }
/// if let Some(err) = pages.err() {
///     eprintln!("pagination stopped: {err}");
/// }
/// # Ok(())
/// # }
/// ```
pub struct PaginatedResult<T> {
    rest: Rest,
    decoder: PageDecoder<T>,
    base_path: String,
    first_link: String,
    next_link: Option<String>,
    /// Loaded but not yet decoded page body.
    pending: Option<serde_json::Value>,
    items: Vec<T>,
    first: bool,
    err: Option<Error>,
}

impl<T: DeserializeOwned + 'static> PaginatedResult<T> {
    pub(crate) async fn start(
        rest: Rest,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<Self, Error> {
        Self::start_decoded(rest, path, params, default_decoder()).await
    }

    pub(crate) async fn start_with(
        rest: Rest,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
        body: Option<Vec<u8>>,
    ) -> Result<Self, Error> {
        Self::start_with_decoder(rest, method, path, params, body, default_decoder()).await
    }
}

impl<T> PaginatedResult<T> {
    pub(crate) async fn start_decoded(
        rest: Rest,
        path: &str,
        params: Vec<(String, String)>,
        decoder: PageDecoder<T>,
    ) -> Result<Self, Error> {
        Self::start_with_decoder(rest, reqwest::Method::GET, path, params, None, decoder).await
    }

    pub(crate) async fn start_with_decoder(
        rest: Rest,
        method: reqwest::Method,
        path: &str,
        params: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        decoder: PageDecoder<T>,
    ) -> Result<Self, Error> {
        let first_link = if params.is_empty() {
            path.to_string()
        } else {
            let query: Vec<String> = params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencode(k), urlencode(v)))
                .collect();
            format!("{path}?{}", query.join("&"))
        };
        let mut result = PaginatedResult {
            rest,
            decoder,
            base_path: parent_path(path),
            first_link: first_link.clone(),
            next_link: None,
            pending: None,
            items: Vec::new(),
            first: true,
            err: None,
        };
        result.goto(method, &first_link, body).await?;
        Ok(result)
    }

    /// Reload the first page. `next` must be called before inspecting items.
    pub async fn first(&mut self) -> Result<(), Error> {
        self.first = true;
        let link = self.first_link.clone();
        self.goto(reqwest::Method::GET, &link, None).await
    }

    /// Make the next page current: the already-loaded first page on the first
    /// call, the `rel="next"` page afterwards. Returns `false` on exhaustion
    /// or error; check [`err`](Self::err) to distinguish.
    pub async fn next(&mut self) -> bool {
        if self.first {
            self.first = false;
        } else {
            let Some(link) = self.next_link.clone() else {
                return false;
            };
            if let Err(e) = self.goto(reqwest::Method::GET, &link, None).await {
                self.err = Some(e);
                return false;
            }
        }
        match self.pending.take() {
            Some(value) => match (self.decoder)(value) {
                Ok(items) => {
                    self.items = items;
                    true
                }
                Err(e) => {
                    self.err = Some(e);
                    false
                }
            },
            // 204: a page with no content.
            None => {
                self.items.clear();
                true
            }
        }
    }

    /// Items of the current page.
    pub fn items(&self) -> &[T] {
        &self.items
    }

    /// Whether a further page is available after the current one.
    pub fn has_next(&self) -> bool {
        self.next_link.is_some()
    }

    /// The error that made [`next`](Self::next) return `false`, if any.
    pub fn err(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    pub fn into_items(self) -> PaginatedItems<T> {
        PaginatedItems {
            pages: self,
            index: 0,
        }
    }

    async fn goto(
        &mut self,
        method: reqwest::Method,
        link: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let resp = self.rest.do_request(method, link, &[], body).await?;

        self.next_link = None;
        // Link header values are copied out before the response is consumed.
        for value in resp.headers().get_all(reqwest::header::LINK) {
            let Ok(value) = value.to_str() else { continue };
            for capture in REL_LINK_RE.captures_iter(value) {
                let target = resolve_link(&self.base_path, &capture[1]);
                match &capture[2] {
                    "first" => self.first_link = target,
                    "next" => self.next_link = Some(target),
                    _ => {}
                }
            }
        }

        if resp.status() == reqwest::StatusCode::NO_CONTENT {
            self.pending = None;
            return Ok(());
        }
        let value: serde_json::Value = crate::rest::decode_body(resp).await?;
        self.pending = Some(value);
        Ok(())
    }
}

/// An item-oriented view over a paginated resource; pages are fetched behind
/// the scenes as iteration crosses page boundaries. An empty page terminates
/// iteration.
pub struct PaginatedItems<T> {
    pages: PaginatedResult<T>,
    index: usize,
}

impl<T: Clone> PaginatedItems<T> {
    pub async fn next(&mut self) -> Option<T> {
        loop {
            if self.index < self.pages.items.len() {
                let item = self.pages.items[self.index].clone();
                self.index += 1;
                return Some(item);
            }
            if !self.pages.next().await {
                return None;
            }
            if self.pages.items.is_empty() {
                return None;
            }
            self.index = 0;
        }
    }

    pub fn err(&self) -> Option<&Error> {
        self.pages.err()
    }
}

fn default_decoder<T: DeserializeOwned + 'static>() -> PageDecoder<T> {
    Arc::new(|value| match value {
        v @ serde_json::Value::Array(_) => Ok(serde_json::from_value(v)?),
        // Some endpoints return a bare object for single-item results.
        v => Ok(vec![serde_json::from_value(v)?]),
    })
}

/// The directory of a request path, queries stripped:
/// `/channels/foo/history` → `/channels/foo`.
fn parent_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => ".".to_string(),
    }
}

/// Resolve a `Link` target against the directory of the current path. Targets
/// are server-relative when absolute, otherwise relative to the directory.
fn resolve_link(base_path: &str, link: &str) -> String {
    if link.starts_with('/') {
        return link.to_string();
    }
    let link = link.strip_prefix("./").unwrap_or(link);
    if base_path == "/" {
        format!("/{link}")
    } else {
        format!("{base_path}/{link}")
    }
}

fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
