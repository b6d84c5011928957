//! Authorization state for a client.
//!
//! [`AuthorizationManager`] holds either a static API key, a token fetched
//! from the configured authorizer, or both. The fetched token wins when both
//! are present.

use std::collections::BTreeMap;
use std::sync::RwLock;

use reqwest::{Client, Method, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AuthorizerConfig, ClientConfig, Deferred};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

/// Resolves and holds the credential used to connect.
pub struct AuthorizationManager {
    http: Client,
    api_key: Option<SecretString>,
    authorizer: Option<AuthorizerConfig>,
    token: RwLock<Option<SecretString>>,
}

impl AuthorizationManager {
    /// Builds a manager from client configuration.
    ///
    /// Fails when neither an API key nor an authorizer is configured.
    pub fn new(config: &ClientConfig) -> Result<Self, AuthError> {
        let http = Client::builder().build().map_err(AuthError::Transport)?;
        Self::with_http_client(config, http)
    }

    /// Builds a manager that sends authorizer requests through `http`.
    ///
    /// Fails under the same condition as [`Self::new`].
    pub fn with_http_client(config: &ClientConfig, http: Client) -> Result<Self, AuthError> {
        if config.api_key.is_none() && config.authorizer.is_none() {
            return Err(AuthError::Configuration);
        }

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            authorizer: config.authorizer.clone(),
            token: RwLock::new(None),
        })
    }

    /// Returns true when an API key is configured or a token was fetched.
    ///
    /// Stays true once it becomes true.
    pub fn is_authorized(&self) -> bool {
        self.api_key.is_some() || self.has_token()
    }

    /// Returns the fetched token, or the API key when no token was fetched.
    pub fn token(&self) -> Result<SecretString, AuthError> {
        if let Some(token) = self.token.read().ok().and_then(|token| token.clone()) {
            return Ok(token);
        }
        self.api_key.clone().ok_or(AuthError::NotAuthorized)
    }

    /// Exchanges the authorizer configuration for a session token.
    ///
    /// The token is stored and later returned by [`Self::token`].
    pub async fn authorize(&self) -> Result<(), AuthError> {
        let authorizer = self.authorizer.as_ref().ok_or(AuthError::NoAuthorizer)?;
        let method = authorizer.method();

        let body = authorizer
            .body
            .as_ref()
            .filter(|body| !matches!(body, Deferred::Literal(text) if text.is_empty()));
        if method == Method::GET && body.is_some() {
            return Err(AuthError::InvalidRequest);
        }

        let params = match authorizer.extra_params.as_ref() {
            Some(params) => params.resolve().await,
            None => BTreeMap::new(),
        };
        let url = authorizer_url(authorizer, &params)?;
        let headers = match authorizer.extra_headers.as_ref() {
            Some(headers) => headers.resolve().await,
            None => BTreeMap::new(),
        };
        let body = match body {
            Some(body) => Some(body.resolve().await).filter(|body| !body.is_empty()),
            None => None,
        };

        debug!(event = "authorize_request", method = %method, url = %url);
        let mut builder = self.http.request(method, url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(AuthError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(AuthError::Transport)?;

        if !status.is_success() {
            warn!(event = "authorize_rejected", status = status.as_u16());
            return Err(AuthError::AuthorizationFailed {
                status,
                body: summarize_error_body(&body),
            });
        }

        let token = parse_token_response(&body)?;
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token);
        }
        debug!(event = "authorize_succeeded");
        Ok(())
    }

    fn has_token(&self) -> bool {
        self.token
            .read()
            .map(|token| token.is_some())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for AuthorizationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationManager")
            .field("has_api_key", &self.api_key.is_some())
            .field("has_token", &self.has_token())
            .field("authorizer", &self.authorizer)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Please supply either API Key or Authorizer Config")]
    Configuration,

    #[error("Please authorize client or provide API Key.")]
    NotAuthorized,

    #[error("No Authorizer Config is Provided.")]
    NoAuthorizer,

    #[error("Couldn't supply body to a GET Authorize Request. Please check your Authorizer Config.")]
    InvalidRequest,

    #[error("invalid authorizer url: {0}")]
    InvalidUrl(String),

    #[error("Authorization Failed. Please check config or authorizer endpoint. (http {status}: {body})")]
    AuthorizationFailed { status: StatusCode, body: String },

    #[error("authorizer response is missing a token: {0}")]
    MalformedResponse(String),

    #[error("authorizer request failed: {0}")]
    Transport(reqwest::Error),
}

fn authorizer_url(
    authorizer: &AuthorizerConfig,
    params: &BTreeMap<String, String>,
) -> Result<Url, AuthError> {
    let base = format!(
        "{}://{}:{}",
        authorizer.scheme(),
        authorizer.host,
        authorizer.port()
    );
    let mut url = Url::parse(&base)
        .and_then(|base| base.join(&authorizer.path))
        .map_err(|err| AuthError::InvalidUrl(err.to_string()))?;

    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}

fn parse_token_response(body: &str) -> Result<SecretString, AuthError> {
    #[derive(Deserialize)]
    struct TokenBody {
        token: String,
    }

    serde_json::from_str::<TokenBody>(body)
        .map(|parsed| SecretString::new(parsed.token))
        .map_err(|err| AuthError::MalformedResponse(err.to_string()))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

/// Exposes the credential for transport metadata.
pub(crate) fn auth_payload(token: &SecretString) -> serde_json::Value {
    serde_json::json!({ "token": token.expose_secret() })
}
