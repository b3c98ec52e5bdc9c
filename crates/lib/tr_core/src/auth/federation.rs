//! OAuth2 federation adapter.
//!
//! Builds authorize redirects and completes authorization-code flows against
//! the registered providers, normalizing userinfo payloads into
//! [`ExternalIdentity`] records. State correlation is the caller's job.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::models::auth::ExternalIdentity;

/// Deadline for each outbound call (token exchange, userinfo).
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Federation errors.
#[derive(Debug, Error)]
pub enum FederationError {
    #[error("unknown OAuth2 provider: {0}")]
    UnknownProvider(String),

    #[error("authorization code invalid: {0}")]
    CodeInvalid(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),
}

// =============================================================================
// Provider configuration
// =============================================================================

/// Endpoints and client credentials of one OAuth2 provider.
#[derive(Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
    pub callback_url: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("userinfo_url", &self.userinfo_url)
            .field("scopes", &self.scopes)
            .field("callback_url", &self.callback_url)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    /// Authorize redirect for this provider. `state` is passed through verbatim.
    pub fn authorization_request(&self, state: &str) -> Result<Url, FederationError> {
        let scope = self.scopes.join(" ");
        Url::parse_with_params(
            &self.authorize_url,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.callback_url.as_str()),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("state", state),
            ],
        )
        .map_err(|e| {
            FederationError::UnknownProvider(format!("{} (bad authorize url: {e})", self.name))
        })
    }
}

/// Fixed endpoints of a well-known provider.
struct Preset {
    name: &'static str,
    authorize_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    scopes: &'static [&'static str],
}

const PRESETS: &[Preset] = &[
    Preset {
        name: "github",
        authorize_url: "https://github.com/login/oauth/authorize",
        token_url: "https://github.com/login/oauth/access_token",
        userinfo_url: "https://api.github.com/user",
        scopes: &["read:user", "user:email"],
    },
    Preset {
        name: "google",
        authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
        scopes: &["openid", "email", "profile"],
    },
    Preset {
        name: "gitlab",
        authorize_url: "https://gitlab.com/oauth/authorize",
        token_url: "https://gitlab.com/oauth/token",
        userinfo_url: "https://gitlab.com/api/v4/user",
        scopes: &["read_user"],
    },
];

/// Okta endpoints hang off the organization URL.
const OKTA_SCOPES: &[&str] = &["openid", "profile", "email"];

/// Base of derived callback URLs.
const DEFAULT_CALLBACK_BASE: &str = "http://localhost:8080";

/// Registered providers keyed by their path name (`github`, `google`, …).
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, config: ProviderConfig) {
        self.providers.insert(config.name.clone(), config);
    }

    pub fn get(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Reads `{PROVIDER}_CLIENT_ID`, `{PROVIDER}_CLIENT_SECRET`,
    /// `{PROVIDER}_CALLBACK_URL` and optional `{PROVIDER}_SCOPES` from the
    /// process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
    }

    /// Like [`from_env`](Self::from_env) with an injectable variable source.
    ///
    /// | Variable                  | Default                                              |
    /// |---------------------------|------------------------------------------------------|
    /// | `{P}_CLIENT_ID`           | required                                             |
    /// | `{P}_CLIENT_SECRET`       | required                                             |
    /// | `{P}_CALLBACK_URL`        | `http://localhost:8080/api/auth/{p}/callback`        |
    /// | `{P}_SCOPES`              | provider preset                                      |
    /// | `OKTA_ORG_URL`            | required for `okta`                                  |
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut registry = Self::new();

        let okta = lookup("OKTA_ORG_URL").map(|org| {
            let org = org.trim_end_matches('/').to_string();
            (
                format!("{org}/oauth2/v1/authorize"),
                format!("{org}/oauth2/v1/token"),
                format!("{org}/oauth2/v1/userinfo"),
            )
        });

        let mut endpoints: Vec<(&str, String, String, String, &[&str])> = PRESETS
            .iter()
            .map(|p| {
                (
                    p.name,
                    p.authorize_url.to_string(),
                    p.token_url.to_string(),
                    p.userinfo_url.to_string(),
                    p.scopes,
                )
            })
            .collect();
        match okta {
            Some((authorize, token, userinfo)) => {
                endpoints.push(("okta", authorize, token, userinfo, OKTA_SCOPES))
            }
            None if lookup("OKTA_CLIENT_ID").is_some() => {
                warn!("OKTA_CLIENT_ID set without OKTA_ORG_URL; okta provider disabled");
            }
            None => {}
        }

        for (name, authorize_url, token_url, userinfo_url, default_scopes) in endpoints {
            let upper = name.to_uppercase();
            let (Some(client_id), Some(client_secret)) = (
                lookup(&format!("{upper}_CLIENT_ID")),
                lookup(&format!("{upper}_CLIENT_SECRET")),
            ) else {
                continue;
            };
            let callback_url = lookup(&format!("{upper}_CALLBACK_URL"))
                .unwrap_or_else(|| format!("{DEFAULT_CALLBACK_BASE}/api/auth/{name}/callback"));
            let scopes = lookup(&format!("{upper}_SCOPES"))
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| default_scopes.iter().map(|s| s.to_string()).collect());

            info!(provider = name, "registered OAuth2 provider");
            registry.register(ProviderConfig {
                name: name.to_string(),
                client_id,
                client_secret,
                authorize_url,
                token_url,
                userinfo_url,
                scopes,
                callback_url,
            });
        }
        registry
    }
}

// =============================================================================
// Federation capability
// =============================================================================

/// Third-party authorization-code flows.
#[async_trait]
pub trait Federation: Send + Sync {
    /// Authorize URL for `provider` carrying `state`.
    fn begin(&self, provider: &str, state: &str) -> Result<String, FederationError>;

    /// Exchange `code` for tokens and fetch the provider's view of the user.
    async fn complete(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<ExternalIdentity, FederationError>;
}

/// Response from a provider's token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Tokens granted for one completed flow.
struct GrantedTokens {
    access_token: String,
    refresh_token: String,
    expires_in: Option<i64>,
}

/// HTTP-backed federation over a [`ProviderRegistry`].
pub struct OAuth2Federation {
    registry: ProviderRegistry,
    client: reqwest::Client,
}

impl OAuth2Federation {
    pub fn new(registry: ProviderRegistry) -> Result<Self, FederationError> {
        let client = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .user_agent(concat!("tr_core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::TokenExchange(format!("http client: {e}")))?;
        Ok(Self { registry, client })
    }

    fn provider(&self, name: &str) -> Result<&ProviderConfig, FederationError> {
        self.registry
            .get(name)
            .ok_or_else(|| FederationError::UnknownProvider(name.to_string()))
    }

    async fn exchange_code(
        &self,
        provider: &ProviderConfig,
        code: &str,
    ) -> Result<GrantedTokens, FederationError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", provider.callback_url.as_str()),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
        ];

        let resp = self
            .client
            .post(&provider.token_url)
            .header(ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| FederationError::TokenExchange(format!("token endpoint: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(FederationError::TokenExchange(format!(
                "token endpoint HTTP {status}"
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| FederationError::TokenExchange(format!("token endpoint: {e}")))?;
        let parsed: TokenResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if status.is_client_error() => {
                return Err(FederationError::CodeInvalid(format!("HTTP {status}")));
            }
            Err(e) => {
                return Err(FederationError::TokenExchange(format!(
                    "token response parse error: {e}"
                )));
            }
        };

        // GitHub reports a bad code as 200 with an `error` field.
        if let Some(error) = parsed.error {
            let detail = match parsed.error_description {
                Some(desc) => format!("{error}: {desc}"),
                None => error.clone(),
            };
            return Err(
                if status.is_client_error() || is_code_error(&error) {
                    FederationError::CodeInvalid(detail)
                } else {
                    FederationError::TokenExchange(detail)
                },
            );
        }
        if status.is_client_error() {
            return Err(FederationError::CodeInvalid(format!("HTTP {status}")));
        }

        let access_token = parsed
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                FederationError::TokenExchange("token response missing access_token".into())
            })?;

        Ok(GrantedTokens {
            access_token,
            refresh_token: parsed.refresh_token.unwrap_or_default(),
            expires_in: parsed.expires_in,
        })
    }

    async fn fetch_userinfo(
        &self,
        provider: &ProviderConfig,
        access_token: &str,
    ) -> Result<Value, FederationError> {
        let resp = self
            .client
            .get(&provider.userinfo_url)
            .header(ACCEPT, "application/json")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| FederationError::TokenExchange(format!("userinfo endpoint: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FederationError::TokenExchange(format!(
                "userinfo HTTP {status}"
            )));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| FederationError::TokenExchange(format!("userinfo parse error: {e}")))
    }
}

#[async_trait]
impl Federation for OAuth2Federation {
    fn begin(&self, provider: &str, state: &str) -> Result<String, FederationError> {
        Ok(self.provider(provider)?.authorization_request(state)?.into())
    }

    async fn complete(
        &self,
        provider: &str,
        code: &str,
        _state: &str,
    ) -> Result<ExternalIdentity, FederationError> {
        let config = self.provider(provider)?;
        if code.is_empty() {
            return Err(FederationError::CodeInvalid("empty code".into()));
        }

        let tokens = self.exchange_code(config, code).await?;
        debug!(provider, "authorization code exchanged");
        let info = self.fetch_userinfo(config, &tokens.access_token).await?;
        normalize_identity(provider, &info, tokens)
    }
}

/// Token-endpoint error codes that mean the code itself was bad.
fn is_code_error(error: &str) -> bool {
    matches!(error, "invalid_grant" | "bad_verification_code")
}

// =============================================================================
// Identity normalization
// =============================================================================

/// First non-empty string (or number, stringified) among `keys`.
fn field(info: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| match info.get(*key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Absolute expiry for a provider-reported lifetime; `None` when out of range.
fn expiry_from_now(secs: i64) -> Option<DateTime<Utc>> {
    let lifetime = chrono::Duration::try_seconds(secs)?;
    let expiry = Utc::now().checked_add_signed(lifetime);
    if expiry.is_none() {
        warn!(expires_in = secs, "ignoring out-of-range token lifetime");
    }
    expiry
}

/// Map OIDC claims or REST-style profile fields onto an identity.
fn normalize_identity(
    provider: &str,
    info: &Value,
    tokens: GrantedTokens,
) -> Result<ExternalIdentity, FederationError> {
    let provider_id = field(info, &["sub", "id"]);
    if provider_id.is_empty() {
        return Err(FederationError::TokenExchange(
            "userinfo response has no subject".into(),
        ));
    }

    let name = field(info, &["name", "login", "username", "preferred_username"]);
    let mut first_name = field(info, &["given_name", "first_name"]);
    let mut last_name = field(info, &["family_name", "last_name"]);
    if first_name.is_empty()
        && last_name.is_empty()
        && let Some((first, last)) = name.split_once(' ')
    {
        first_name = first.to_string();
        last_name = last.trim().to_string();
    }

    Ok(ExternalIdentity {
        provider: provider.to_string(),
        provider_id,
        email: field(info, &["email"]),
        name,
        first_name,
        last_name,
        avatar_url: field(info, &["picture", "avatar_url"]),
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        expires_at: tokens.expires_in.and_then(expiry_from_now),
    })
}
