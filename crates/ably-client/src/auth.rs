//! Authentication: API-key basic auth, token auth, local token-request
//! signing, and serialized token renewal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{codes, BoxError, Error, ErrorInfo};
use crate::options::ClientOptions;

/// Tokens are renewed this long before their stated expiry.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(15);

/// Capability granted when token params don't specify one.
const DEFAULT_CAPABILITY: &str = r#"{"*":["*"]}"#;

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Parameters for requesting a token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenParams {
    /// Requested lifetime in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    /// Capability JSON, e.g. `{"*":["*"]}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// A signed token request, exchangeable for [`TokenDetails`] at the REST API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub key_name: String,
    pub timestamp: i64,
    pub nonce: String,
    pub mac: String,
    pub capability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// An issued token.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetails {
    pub token: String,
    #[serde(default)]
    pub expires: i64,
    #[serde(default)]
    pub issued: i64,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl TokenDetails {
    /// Whether the token should be considered unusable at `now` (ms since
    /// epoch), applying the renewal margin.
    pub fn expired(&self, now: i64) -> bool {
        self.expires != 0 && self.expires <= now + TOKEN_EXPIRY_MARGIN.as_millis() as i64
    }
}

/// What an [`AuthCallback`] may yield.
#[derive(Debug, Clone)]
pub enum Token {
    /// A literal token string.
    Literal(String),
    Details(TokenDetails),
    Request(TokenRequest),
}

/// A future that resolves to a [`Token`].
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<Token, BoxError>> + Send>>;

/// Callback that produces tokens, e.g. by asking the application server.
pub type AuthCallback = Arc<dyn Fn(TokenParams) -> TokenFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthMethod {
    Basic,
    Token,
}

/// Token cache plus the machinery to mint or fetch new ones. Renewal is
/// serialized so concurrent callers share a single in-flight request.
pub(crate) struct Auth {
    opts: Arc<ClientOptions>,
    http: reqwest::Client,
    method: AuthMethod,
    state: tokio::sync::Mutex<AuthState>,
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth").field("method", &self.method).finish()
    }
}

#[derive(Default)]
struct AuthState {
    token: Option<TokenDetails>,
    /// Server clock minus local clock, cached from `/time`.
    server_time_offset: Option<i64>,
}

impl Auth {
    pub fn new(opts: Arc<ClientOptions>, http: reqwest::Client) -> Result<Self, Error> {
        let has_token_source = opts.token.is_some()
            || opts.token_details.is_some()
            || opts.auth_callback.is_some()
            || opts.auth_url.is_some();
        let method = if has_token_source || opts.use_token_auth || opts.client_id.is_some() {
            AuthMethod::Token
        } else if opts.key.is_some() {
            if !opts.tls {
                return Err(Error::Auth(ErrorInfo::new(
                    40103,
                    "basic auth requires TLS; set use_token_auth or enable TLS",
                )));
            }
            AuthMethod::Basic
        } else {
            return Err(Error::Auth(ErrorInfo::new(
                40106,
                "no means of authentication configured",
            )));
        };
        if method == AuthMethod::Token && !has_token_source && opts.key.is_none() {
            return Err(Error::Auth(ErrorInfo::new(
                40106,
                "token auth requested but no key or token source configured",
            )));
        }

        let state = AuthState {
            token: opts
                .token_details
                .clone()
                .or_else(|| opts.token.clone().map(|token| TokenDetails {
                    token,
                    ..Default::default()
                })),
            server_time_offset: None,
        };

        Ok(Auth {
            opts,
            http,
            method,
            state: tokio::sync::Mutex::new(state),
        })
    }

    pub fn method(&self) -> AuthMethod {
        self.method
    }

    /// The `Authorization` header value for a REST request, renewing the
    /// token first if needed.
    pub async fn auth_header_value(&self) -> Result<String, Error> {
        match self.method {
            AuthMethod::Basic => {
                let key = self.opts.key.as_deref().expect("basic auth implies key");
                Ok(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(key)
                ))
            }
            AuthMethod::Token => {
                let token = self.authorize(false).await?;
                Ok(format!("Bearer {}", token.token))
            }
        }
    }

    /// A valid token, renewing if the cached one is missing or expired.
    /// Pass `force` to discard the cache (e.g. after a 40142).
    pub async fn authorize(&self, force: bool) -> Result<TokenDetails, Error> {
        let mut state = self.state.lock().await;
        if !force {
            if let Some(token) = &state.token {
                // Tokens without a known expiry are trusted until the server
                // rejects them.
                if !token.expired(now_ms()) {
                    return Ok(token.clone());
                }
            }
        }
        let offset = if self.opts.use_query_time {
            Some(self.server_time_offset(&mut state).await?)
        } else {
            None
        };
        let params = {
            let mut p = self.opts.token_params_or_default();
            if p.client_id.is_none() {
                p.client_id = self.opts.client_id.clone();
            }
            if let Some(offset) = offset {
                p.timestamp = Some(now_ms() + offset);
            }
            p
        };
        let token = self.request_token(params).await?;
        state.token = Some(token.clone());
        Ok(token)
    }

    /// Obtain fresh token details, in source preference order: callback,
    /// auth URL, literal token, locally signed request from the key.
    pub async fn request_token(&self, params: TokenParams) -> Result<TokenDetails, Error> {
        if let Some(callback) = &self.opts.auth_callback {
            let token = callback(params).await.map_err(Error::TokenFetch)?;
            return match token {
                Token::Details(details) => Ok(details),
                Token::Literal(token) => Ok(TokenDetails {
                    token,
                    ..Default::default()
                }),
                Token::Request(req) => self.exchange_token_request(&req).await,
            };
        }
        if let Some(auth_url) = &self.opts.auth_url {
            return self.request_token_from_url(auth_url, &params).await;
        }
        if let Some(details) = &self.opts.token_details {
            return Ok(details.clone());
        }
        if let Some(token) = &self.opts.token {
            return Ok(TokenDetails {
                token: token.clone(),
                ..Default::default()
            });
        }
        let request = self.create_token_request(params)?;
        self.exchange_token_request(&request).await
    }

    /// Build and sign a token request from the configured key.
    pub fn create_token_request(&self, params: TokenParams) -> Result<TokenRequest, Error> {
        let key_name = self.opts.key_name().ok_or_else(|| {
            Error::Auth(ErrorInfo::new(
                40106,
                "cannot sign token request without a key",
            ))
        })?;
        let key_secret = self.opts.key_secret().unwrap_or_default();

        let timestamp = params.timestamp.unwrap_or_else(now_ms);
        let capability = params
            .capability
            .clone()
            .unwrap_or_else(|| DEFAULT_CAPABILITY.to_string());
        let mut nonce_bytes = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_bytes);
        let nonce = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(nonce_bytes);

        let mac = sign_token_request(
            key_secret,
            key_name,
            params.ttl,
            &capability,
            params.client_id.as_deref(),
            timestamp,
            &nonce,
        );

        Ok(TokenRequest {
            key_name: key_name.to_string(),
            timestamp,
            nonce,
            mac,
            capability,
            ttl: params.ttl,
            client_id: params.client_id,
        })
    }

    /// Exchange a signed token request for token details at the REST API.
    async fn exchange_token_request(&self, request: &TokenRequest) -> Result<TokenDetails, Error> {
        let base = self.opts.rest_url(&self.opts.primary_rest_host());
        let url = format!("{base}/keys/{}/requestToken", request.key_name);
        let resp = self
            .http
            .post(&url)
            .header("X-Ably-Version", crate::options::PROTOCOL_VERSION)
            .json(request)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Auth(
                ErrorInfo::new(codes::TOKEN_ERROR, "token request rejected")
                    .with_status(resp.status().as_u16() as i32),
            ));
        }
        Ok(resp.json::<TokenDetails>().await?)
    }

    async fn request_token_from_url(
        &self,
        auth_url: &str,
        params: &TokenParams,
    ) -> Result<TokenDetails, Error> {
        let mut query: Vec<(String, String)> = self.opts.auth_params.clone();
        if let Some(ttl) = params.ttl {
            query.push(("ttl".into(), ttl.to_string()));
        }
        if let Some(capability) = &params.capability {
            query.push(("capability".into(), capability.clone()));
        }
        if let Some(client_id) = &params.client_id {
            query.push(("clientId".into(), client_id.clone()));
        }

        let mut req = if self.opts.auth_method == reqwest::Method::POST {
            self.http.post(auth_url).form(&query)
        } else {
            self.http.get(auth_url).query(&query)
        };
        for (name, value) in &self.opts.auth_headers {
            req = req.header(name, value);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(Error::Auth(
                ErrorInfo::new(codes::TOKEN_ERROR, "auth URL request failed")
                    .with_status(resp.status().as_u16() as i32),
            ));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if content_type.starts_with("text/plain") {
            let token = resp.text().await?;
            return Ok(TokenDetails {
                token,
                ..Default::default()
            });
        }
        // JSON bodies carry either token details or a signed token request.
        let body: serde_json::Value = resp.json().await?;
        if body.get("mac").is_some() {
            let request: TokenRequest = serde_json::from_value(body)?;
            return self.exchange_token_request(&request).await;
        }
        Ok(serde_json::from_value(body)?)
    }

    async fn server_time_offset(&self, state: &mut AuthState) -> Result<i64, Error> {
        if let Some(offset) = state.server_time_offset {
            return Ok(offset);
        }
        let base = self.opts.rest_url(&self.opts.primary_rest_host());
        let times: Vec<i64> = self
            .http
            .get(format!("{base}/time"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let server_now = *times.first().ok_or_else(|| {
            Error::Request(ErrorInfo::new(codes::INTERNAL_ERROR, "empty /time response"))
        })?;
        let offset = server_now - now_ms();
        state.server_time_offset = Some(offset);
        Ok(offset)
    }
}

/// MAC over the canonical token-request text, HMAC-SHA256 with the key
/// secret, base64.
fn sign_token_request(
    key_secret: &str,
    key_name: &str,
    ttl: Option<i64>,
    capability: &str,
    client_id: Option<&str>,
    timestamp: i64,
    nonce: &str,
) -> String {
    let ttl_text = ttl.map(|t| t.to_string()).unwrap_or_default();
    let text = format!(
        "{key_name}\n{ttl_text}\n{capability}\n{}\n{timestamp}\n{nonce}\n",
        client_id.unwrap_or_default()
    );
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key_secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(text.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn opts_with_key() -> Arc<ClientOptions> {
        Arc::new(ClientOptions::with_key("appId.keyId:topsecret"))
    }

    fn auth(opts: Arc<ClientOptions>) -> Auth {
        Auth::new(opts, reqwest::Client::new()).unwrap()
    }

    #[test]
    fn key_only_with_tls_is_basic() {
        assert_eq!(auth(opts_with_key()).method(), AuthMethod::Basic);
    }

    #[test]
    fn key_without_tls_is_rejected() {
        let mut opts = ClientOptions::with_key("a.b:c");
        opts.tls = false;
        let err = Auth::new(Arc::new(opts), reqwest::Client::new()).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[test]
    fn use_token_auth_forces_token_method() {
        let mut opts = ClientOptions::with_key("a.b:c");
        opts.use_token_auth = true;
        let auth = Auth::new(Arc::new(opts), reqwest::Client::new()).unwrap();
        assert_eq!(auth.method(), AuthMethod::Token);
    }

    #[test]
    fn no_auth_configured_is_rejected() {
        let err = Auth::new(Arc::new(ClientOptions::new()), reqwest::Client::new()).unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn basic_auth_header() {
        let header = auth(opts_with_key()).auth_header_value().await.unwrap();
        let expected = base64::engine::general_purpose::STANDARD.encode("appId.keyId:topsecret");
        assert_eq!(header, format!("Basic {expected}"));
    }

    #[test]
    fn create_token_request_signs() {
        let auth = auth(opts_with_key());
        let request = auth
            .create_token_request(TokenParams {
                ttl: Some(3_600_000),
                client_id: Some("alice".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(request.key_name, "appId.keyId");
        assert_eq!(request.capability, DEFAULT_CAPABILITY);
        assert!(!request.nonce.is_empty());

        let expected = sign_token_request(
            "topsecret",
            "appId.keyId",
            Some(3_600_000),
            DEFAULT_CAPABILITY,
            Some("alice"),
            request.timestamp,
            &request.nonce,
        );
        assert_eq!(request.mac, expected);
    }

    #[test]
    fn sign_token_request_is_deterministic() {
        let a = sign_token_request("s", "k", Some(1000), "{}", None, 42, "n");
        let b = sign_token_request("s", "k", Some(1000), "{}", None, 42, "n");
        assert_eq!(a, b);
        let c = sign_token_request("other", "k", Some(1000), "{}", None, 42, "n");
        assert_ne!(a, c);
    }

    #[test]
    fn token_expiry_margin() {
        let token = TokenDetails {
            token: "t".into(),
            expires: 1_000_000,
            ..Default::default()
        };
        assert!(token.expired(1_000_000));
        assert!(token.expired(1_000_000 - 14_000));
        assert!(!token.expired(1_000_000 - 16_000));
        // Unknown expiry is trusted.
        let token = TokenDetails {
            token: "t".into(),
            ..Default::default()
        };
        assert!(!token.expired(i64::MAX));
    }

    #[tokio::test]
    async fn authorize_caches_and_renews_via_callback() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_cb = calls.clone();
        let mut opts = ClientOptions::new();
        opts.auth_callback = Some(Arc::new(move |_params| {
            let n = calls_cb.fetch_add(1, Ordering::Relaxed);
            Box::pin(async move {
                Ok(Token::Details(TokenDetails {
                    token: format!("token-{n}"),
                    expires: now_ms() + 3_600_000,
                    ..Default::default()
                }))
            })
        }));
        let auth = auth(Arc::new(opts));

        let first = auth.authorize(false).await.unwrap();
        let second = auth.authorize(false).await.unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        let forced = auth.authorize(true).await.unwrap();
        assert_ne!(forced.token, first.token);
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn expired_cached_token_is_renewed() {
        let mut opts = ClientOptions::new();
        opts.token_details = Some(TokenDetails {
            token: "stale".into(),
            expires: now_ms() - 1000,
            ..Default::default()
        });
        opts.auth_callback = Some(Arc::new(|_params| {
            Box::pin(async {
                Ok(Token::Literal("fresh".to_string()))
            })
        }));
        let auth = auth(Arc::new(opts));
        let token = auth.authorize(false).await.unwrap();
        assert_eq!(token.token, "fresh");
    }

    #[tokio::test]
    async fn literal_token_is_used_as_is() {
        let mut opts = ClientOptions::new();
        opts.token = Some("literal-token".into());
        let auth = auth(Arc::new(opts));
        assert_eq!(auth.method(), AuthMethod::Token);
        let header = auth.auth_header_value().await.unwrap();
        assert_eq!(header, "Bearer literal-token");
    }
}
