//! REST client: authenticated requests with fallback-host retry, idempotent
//! publishing, history, presence, time and stats.

use std::sync::{Arc, Mutex};

use base64::Engine as _;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::Auth;
use crate::crypto::CipherParams;
use crate::error::{codes, Error, ErrorInfo};
use crate::hosts::Hosts;
use crate::message::{Message, PresenceMessage};
use crate::options::{ClientOptions, PROTOCOL_MSGPACK, PROTOCOL_VERSION};
use crate::pagination::{PaginatedItems, PaginatedResult};
use crate::protocol::{WireMessage, WirePresenceMessage};

/// REST client. Clone is a cheap Arc refcount bump.
#[derive(Clone)]
pub struct Rest {
    inner: Arc<RestInner>,
}

pub(crate) struct RestInner {
    pub(crate) opts: Arc<ClientOptions>,
    pub(crate) http: reqwest::Client,
    pub(crate) auth: Auth,
    hosts: Mutex<Hosts>,
}

/// One aggregated stats interval. The full schema is large and evolves
/// server-side; entries beyond the interval id are kept as raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    #[serde(default)]
    pub interval_id: String,
    #[serde(flatten)]
    pub entries: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forwards,
    Backwards,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Forwards => "forwards",
            Direction::Backwards => "backwards",
        }
    }
}

/// Query window and paging controls for history, presence history and stats.
#[derive(Debug, Clone, Default)]
pub struct PaginateParams {
    pub limit: Option<usize>,
    pub direction: Option<Direction>,
    /// Window start, milliseconds since epoch.
    pub start: Option<i64>,
    /// Window end, milliseconds since epoch.
    pub end: Option<i64>,
    /// Stats granularity (`minute`, `hour`, `day`, `month`).
    pub unit: Option<String>,
}

impl PaginateParams {
    pub(crate) fn to_query(&self) -> Result<Vec<(String, String)>, Error> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(Error::Request(ErrorInfo::new(
                    codes::BAD_REQUEST,
                    "start must be before end",
                )));
            }
        }
        let mut query = Vec::new();
        if let Some(limit) = self.limit {
            query.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(direction) = self.direction {
            query.push(("direction".to_string(), direction.as_str().to_string()));
        }
        if let Some(start) = self.start {
            query.push(("start".to_string(), start.to_string()));
        }
        if let Some(end) = self.end {
            query.push(("end".to_string(), end.to_string()));
        }
        if let Some(unit) = &self.unit {
            query.push(("unit".to_string(), unit.clone()));
        }
        Ok(query)
    }
}

impl Rest {
    pub fn new(opts: ClientOptions) -> Result<Self, Error> {
        Self::with_shared_options(Arc::new(opts))
    }

    pub(crate) fn with_shared_options(opts: Arc<ClientOptions>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(opts.http_request_timeout)
            .connect_timeout(opts.http_open_timeout)
            .build()?;
        let auth = Auth::new(opts.clone(), http.clone())?;
        let hosts = Mutex::new(Hosts::rest(&opts));
        Ok(Rest {
            inner: Arc::new(RestInner {
                opts,
                http,
                auth,
                hosts,
            }),
        })
    }

    pub(crate) fn options(&self) -> &Arc<ClientOptions> {
        &self.inner.opts
    }

    pub(crate) fn auth(&self) -> &Auth {
        &self.inner.auth
    }

    /// A channel handle for publishing and history. Handles are cheap; no
    /// server state is created until a request is made.
    pub fn channel(&self, name: impl Into<String>) -> RestChannel {
        RestChannel {
            rest: self.clone(),
            name: name.into(),
            cipher: None,
        }
    }

    /// Like [`channel`](Self::channel), with payload encryption.
    pub fn channel_with_cipher(&self, name: impl Into<String>, cipher: CipherParams) -> RestChannel {
        RestChannel {
            rest: self.clone(),
            name: name.into(),
            cipher: Some(cipher),
        }
    }

    /// Server time in milliseconds since epoch.
    pub async fn time(&self) -> Result<i64, Error> {
        let resp = self
            .do_request(reqwest::Method::GET, "/time", &[], None)
            .await?;
        let times: Vec<i64> = decode_body(resp).await?;
        times.into_iter().next().ok_or_else(|| {
            Error::Request(ErrorInfo::new(codes::INTERNAL_ERROR, "empty /time response"))
        })
    }

    /// Paginated application statistics.
    pub async fn stats(&self, params: &PaginateParams) -> Result<PaginatedResult<Stats>, Error> {
        PaginatedResult::start(self.clone(), "/stats", params.to_query()?).await
    }

    /// Issue an arbitrary authenticated request against a paginated endpoint.
    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<PaginatedResult<serde_json::Value>, Error> {
        let body = match body {
            Some(v) => Some(serde_json::to_vec(&v)?),
            None => None,
        };
        PaginatedResult::start_with(self.clone(), method, path, params.to_vec(), body).await
    }

    /// Used by the realtime connection to route REST traffic through its
    /// active host.
    pub(crate) fn set_active_realtime_host(&self, host: &str) {
        self.hosts().set_primary_fallback_host(host);
    }

    fn hosts(&self) -> std::sync::MutexGuard<'_, Hosts> {
        self.inner.hosts.lock().expect("hosts mutex poisoned")
    }

    /// Execute a request with fallback-host retry. Successful responses from
    /// a non-primary host cache that host; successes from the primary reset
    /// the visited cycle.
    pub(crate) async fn do_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, Error> {
        let primary = self.hosts().primary_host().to_string();
        let mut host = {
            let mut hosts = self.hosts();
            hosts.reset_visited();
            hosts.preferred_host()
        };
        let max_attempts = 1 + self.inner.opts.http_max_retry_count;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let auth_header = self.inner.auth.auth_header_value().await?;
            let url = format!("{}{path}", self.inner.opts.rest_url(&host));
            let mut req = self
                .inner
                .http
                .request(method.clone(), &url)
                .header(reqwest::header::AUTHORIZATION, &auth_header)
                .header("X-Ably-Version", PROTOCOL_VERSION)
                .header(reqwest::header::ACCEPT, self.inner.opts.protocol());
            if !params.is_empty() {
                req = req.query(params);
            }
            if let Some(body) = &body {
                req = req
                    .header(reqwest::header::CONTENT_TYPE, self.inner.opts.protocol())
                    .body(body.clone());
            }

            let last_err = match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let mut hosts = self.hosts();
                    if host == primary {
                        hosts.reset_visited();
                    } else {
                        hosts.cache_host(&host);
                    }
                    return Ok(resp);
                }
                Ok(resp) => {
                    let err = parse_error_response(resp).await;
                    if !err.is_retriable() {
                        return Err(err.into());
                    }
                    Error::from(err)
                }
                // Network-level failures (refused, DNS, timeout) are always
                // worth a fallback attempt.
                Err(e) => Error::Http(e),
            };

            if attempt >= max_attempts {
                return Err(last_err);
            }
            host = match self.hosts().fallback_host() {
                Some(h) => h,
                None => return Err(last_err),
            };
            tracing::debug!(host = %host, attempt, "retrying request against fallback host");
        }
    }
}

/// Error details from a non-2xx REST response body, falling back to the
/// status line when the body isn't in the documented shape.
async fn parse_error_response(resp: reqwest::Response) -> ErrorInfo {
    let status = resp.status().as_u16() as i32;
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorInfo,
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => {
            let mut err = body.error;
            if err.status_code.is_none() {
                err.status_code = Some(status);
            }
            err
        }
        Err(_) => ErrorInfo::new(codes::BAD_REQUEST, format!("HTTP status {status}"))
            .with_status(status),
    }
}

/// Decode a response body as JSON or MessagePack according to its
/// content type.
pub(crate) async fn decode_body<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = resp.bytes().await?;
    decode_bytes(&bytes, &content_type)
}

pub(crate) fn decode_bytes<T: DeserializeOwned>(bytes: &[u8], content_type: &str) -> Result<T, Error> {
    let value = if content_type.starts_with(PROTOCOL_MSGPACK) {
        crate::protocol::msgpack_to_json(bytes)?
    } else {
        serde_json::from_slice(bytes)?
    };
    Ok(serde_json::from_value(value)?)
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// A REST channel handle.
#[derive(Clone)]
pub struct RestChannel {
    rest: Rest,
    name: String,
    cipher: Option<CipherParams>,
}

impl RestChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn base_path(&self) -> String {
        format!("/channels/{}", urlencode_path(&self.name))
    }

    /// Publish a single message.
    pub async fn publish(&self, message: Message) -> Result<(), Error> {
        self.publish_batch(vec![message]).await
    }

    /// Publish a batch of messages in one request.
    ///
    /// With idempotent publishing enabled, messages without ids get
    /// `<randomNonce>:<index>` ids so server-side retries deduplicate.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Result<(), Error> {
        let mut wires = Vec::with_capacity(messages.len());
        let base_id = if self.rest.options().idempotent_rest_publishing {
            let mut nonce = [0u8; 9];
            rand::thread_rng().fill_bytes(&mut nonce);
            Some(base64::engine::general_purpose::STANDARD.encode(nonce))
        } else {
            None
        };
        for (i, message) in messages.iter().enumerate() {
            let mut wire = message.encoded(self.cipher.as_ref())?;
            if wire.id.is_none() {
                if let Some(base) = &base_id {
                    wire.id = Some(format!("{base}:{i}"));
                }
            }
            wires.push(wire);
        }
        let body = self.encode_request_body(&wires)?;
        self.rest
            .do_request(
                reqwest::Method::POST,
                &format!("{}/messages", self.base_path()),
                &[],
                Some(body),
            )
            .await?;
        Ok(())
    }

    /// Paginated message history for this channel.
    pub async fn history(
        &self,
        params: &PaginateParams,
    ) -> Result<PaginatedResult<Message>, Error> {
        let cipher = self.cipher.clone();
        PaginatedResult::start_decoded(
            self.rest.clone(),
            &format!("{}/history", self.base_path()),
            params.to_query()?,
            Arc::new(move |value| decode_message_page(value, cipher.as_ref())),
        )
        .await
    }

    /// Item-oriented history iteration.
    pub async fn history_items(
        &self,
        params: &PaginateParams,
    ) -> Result<PaginatedItems<Message>, Error> {
        Ok(self.history(params).await?.into_items())
    }

    /// The current presence set, via the REST presence endpoint.
    pub async fn presence_get(
        &self,
        params: &PaginateParams,
    ) -> Result<PaginatedResult<PresenceMessage>, Error> {
        let cipher = self.cipher.clone();
        PaginatedResult::start_decoded(
            self.rest.clone(),
            &format!("{}/presence", self.base_path()),
            params.to_query()?,
            Arc::new(move |value| decode_presence_page(value, cipher.as_ref())),
        )
        .await
    }

    /// Paginated presence history for this channel.
    pub async fn presence_history(
        &self,
        params: &PaginateParams,
    ) -> Result<PaginatedResult<PresenceMessage>, Error> {
        let cipher = self.cipher.clone();
        PaginatedResult::start_decoded(
            self.rest.clone(),
            &format!("{}/presence/history", self.base_path()),
            params.to_query()?,
            Arc::new(move |value| decode_presence_page(value, cipher.as_ref())),
        )
        .await
    }

    fn encode_request_body(&self, wires: &[WireMessage]) -> Result<Vec<u8>, Error> {
        if self.rest.options().binary_protocol {
            Ok(rmp_serde::to_vec_named(wires)?)
        } else {
            Ok(serde_json::to_vec(wires)?)
        }
    }
}

fn decode_message_page(
    value: serde_json::Value,
    cipher: Option<&CipherParams>,
) -> Result<Vec<Message>, Error> {
    let wires: Vec<WireMessage> = serde_json::from_value(value)?;
    Ok(wires
        .into_iter()
        .map(|w| {
            let (msg, err) = Message::from_wire(w, cipher);
            if let Some(err) = err {
                tracing::warn!(id = ?msg.id, "failed to fully decode history message: {err}");
            }
            msg
        })
        .collect())
}

fn decode_presence_page(
    value: serde_json::Value,
    cipher: Option<&CipherParams>,
) -> Result<Vec<PresenceMessage>, Error> {
    let wires: Vec<WirePresenceMessage> = serde_json::from_value(value)?;
    Ok(wires
        .into_iter()
        .map(|w| {
            let (msg, err) = PresenceMessage::from_wire(w, cipher);
            if let Some(err) = err {
                tracing::warn!(
                    client_id = ?msg.client_id,
                    "failed to fully decode presence message: {err}"
                );
            }
            msg
        })
        .collect())
}

/// Percent-encode a channel name for use in a path segment.
fn urlencode_path(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn test_rest(server: &MockServer) -> Rest {
        let mut opts = ClientOptions::with_key("app.key:secret");
        opts.tls = false;
        opts.use_token_auth = false;
        opts.rest_host = Some(server.host());
        opts.port = server.port();
        opts.fallback_hosts = Some(vec![]);
        opts.binary_protocol = false;
        // Basic auth over plain HTTP is rejected; pin a literal token instead.
        opts.token = Some("test-token".into());
        Rest::new(opts).unwrap()
    }

    #[tokio::test]
    async fn time_parses_first_element() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/time");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!([1700000000000i64, 1]));
        });
        let rest = test_rest(&server);
        assert_eq!(rest.time().await.unwrap(), 1700000000000);
    }

    #[tokio::test]
    async fn requests_carry_bearer_auth_and_version() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/time")
                .header("authorization", "Bearer test-token")
                .header_exists("x-ably-version");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!([0i64]));
        });
        let rest = test_rest(&server);
        rest.time().await.unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn publish_posts_encoded_messages() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/channels/orders/messages")
                .json_body_partial(r#"[{"name": "created", "data": "first"}]"#);
            then.status(201).json_body(serde_json::json!([]));
        });
        let rest = test_rest(&server);
        rest.channel("orders")
            .publish(Message::new("created", "first"))
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn idempotent_publish_assigns_indexed_ids() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/channels/orders/messages")
                .matches(|req| {
                    let body = req.body.as_deref().unwrap_or_default();
                    let Ok(wires) = serde_json::from_slice::<Vec<WireMessage>>(body) else {
                        return false;
                    };
                    let ids: Vec<_> = wires.iter().filter_map(|w| w.id.clone()).collect();
                    if ids.len() != 2 {
                        return false;
                    }
                    let (base0, idx0) = ids[0].rsplit_once(':').unwrap_or_default();
                    let (base1, idx1) = ids[1].rsplit_once(':').unwrap_or_default();
                    !base0.is_empty() && base0 == base1 && idx0 == "0" && idx1 == "1"
                });
            then.status(201).json_body(serde_json::json!([]));
        });
        let mut opts = ClientOptions::new();
        opts.tls = false;
        opts.rest_host = Some(server.host());
        opts.port = server.port();
        opts.fallback_hosts = Some(vec![]);
        opts.binary_protocol = false;
        opts.token = Some("test-token".into());
        opts.idempotent_rest_publishing = true;
        let rest = Rest::new(opts).unwrap();

        rest.channel("orders")
            .publish_batch(vec![Message::new("a", "1"), Message::new("b", "2")])
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn non_retriable_error_is_returned() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/time");
            then.status(401).json_body(serde_json::json!({
                "error": {"code": 40142, "message": "Token expired", "statusCode": 401}
            }));
        });
        let rest = test_rest(&server);
        let err = rest.time().await.unwrap_err();
        assert_eq!(err.code(), Some(40142));
    }

    #[tokio::test]
    async fn unreachable_primary_falls_back_and_caches() {
        let fallback = MockServer::start();
        let mock = fallback.mock(|when, then| {
            when.method(GET).path("/time");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!([42i64]));
        });

        // All hosts share the configured port, so the unreachable primary is
        // simulated with a non-resolving name rather than a closed port.
        let mut opts = ClientOptions::new();
        opts.tls = false;
        opts.rest_host = Some("primary.invalid".into());
        opts.port = fallback.port();
        opts.fallback_hosts = Some(vec![fallback.host()]);
        opts.binary_protocol = false;
        opts.token = Some("test-token".into());
        let rest = Rest::new(opts).unwrap();

        assert_eq!(rest.time().await.unwrap(), 42);
        // The fallback is now cached; the next request goes there directly.
        assert_eq!(rest.time().await.unwrap(), 42);
        mock.assert_hits(2);
    }

    #[test]
    fn paginate_params_validation() {
        let params = PaginateParams {
            start: Some(10),
            end: Some(5),
            ..Default::default()
        };
        assert!(params.to_query().is_err());

        let params = PaginateParams {
            limit: Some(25),
            direction: Some(Direction::Backwards),
            start: Some(5),
            end: Some(10),
            ..Default::default()
        };
        let query = params.to_query().unwrap();
        assert!(query.contains(&("limit".to_string(), "25".to_string())));
        assert!(query.contains(&("direction".to_string(), "backwards".to_string())));
    }

    #[test]
    fn channel_names_are_path_encoded() {
        assert_eq!(urlencode_path("orders:live"), "orders:live");
        assert_eq!(urlencode_path("a b/c"), "a%20b%2Fc");
    }
}
