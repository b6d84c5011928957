//! Client and authorizer configuration.
//!
//! Authorizer headers, query parameters and body may be supplied as literal
//! values or computed lazily through [`Deferred`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use reqwest::Method;
use secrecy::SecretString;

use crate::backoff::ReconnectPolicy;

/// Endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";
/// Authorizer scheme used when none is configured.
pub const DEFAULT_SCHEME: &str = "https";
/// Authorizer port used when none is configured.
pub const DEFAULT_PORT: u16 = 80;

/// A configuration value that is either known up front or computed on use.
pub enum Deferred<T> {
    /// Used verbatim.
    Literal(T),
    /// Invoked on every resolution.
    Function(Arc<dyn Fn() -> T + Send + Sync>),
    /// Invoked and awaited on every resolution.
    AsyncFunction(Arc<dyn Fn() -> BoxFuture<'static, T> + Send + Sync>),
    /// A single pending computation, awaited once and shared afterwards.
    Pending(Shared<BoxFuture<'static, T>>),
}

impl<T> Deferred<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn literal(value: T) -> Self {
        Self::Literal(value)
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::Function(Arc::new(f))
    }

    pub fn from_async_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::AsyncFunction(Arc::new(move || f().boxed()))
    }

    pub fn pending<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        Self::Pending(future.boxed().shared())
    }

    /// Produces the current value.
    pub async fn resolve(&self) -> T {
        match self {
            Self::Literal(value) => value.clone(),
            Self::Function(f) => f(),
            Self::AsyncFunction(f) => f().await,
            Self::Pending(future) => future.clone().await,
        }
    }
}

impl<T: Clone> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Literal(value) => Self::Literal(value.clone()),
            Self::Function(f) => Self::Function(Arc::clone(f)),
            Self::AsyncFunction(f) => Self::AsyncFunction(Arc::clone(f)),
            Self::Pending(future) => Self::Pending(future.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
            Self::AsyncFunction(_) => f.write_str("AsyncFunction(..)"),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

impl<T> From<T> for Deferred<T> {
    fn from(value: T) -> Self {
        Self::Literal(value)
    }
}

/// Describes the HTTP endpoint that exchanges credentials for a session token.
#[derive(Clone, Debug)]
pub struct AuthorizerConfig {
    /// URL scheme, `https` when unset.
    pub scheme: Option<String>,
    pub host: String,
    /// Port, `80` when unset.
    pub port: Option<u16>,
    pub path: String,
    /// HTTP method, `GET` when unset.
    pub method: Option<Method>,
    pub extra_headers: Option<Deferred<BTreeMap<String, String>>>,
    pub extra_params: Option<Deferred<BTreeMap<String, String>>>,
    /// Request body. Not allowed with `GET`. An empty body counts as absent.
    pub body: Option<Deferred<String>>,
}

impl AuthorizerConfig {
    pub fn new(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: None,
            host: host.into(),
            port: None,
            path: path.into(),
            method: None,
            extra_headers: None,
            extra_params: None,
            body: None,
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_extra_headers(
        mut self,
        headers: impl Into<Deferred<BTreeMap<String, String>>>,
    ) -> Self {
        self.extra_headers = Some(headers.into());
        self
    }

    pub fn with_extra_params(
        mut self,
        params: impl Into<Deferred<BTreeMap<String, String>>>,
    ) -> Self {
        self.extra_params = Some(params.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Deferred<String>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn scheme(&self) -> &str {
        self.scheme.as_deref().unwrap_or(DEFAULT_SCHEME)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn method(&self) -> Method {
        self.method.clone().unwrap_or(Method::GET)
    }
}

/// Client configuration.
///
/// At least one of `api_key` or `authorizer` must be set.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    pub url: Option<String>,
    pub api_key: Option<SecretString>,
    pub authorizer: Option<AuthorizerConfig>,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the realtime server endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into().trim_end().to_string());
        self
    }

    /// Sets a static credential. The client connects immediately with it.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Sets the authorizer used by [`crate::client::Client::authorize`].
    pub fn with_authorizer(mut self, authorizer: AuthorizerConfig) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Endpoint to connect to, falling back to [`DEFAULT_ENDPOINT`].
    pub fn endpoint(&self) -> &str {
        self.url.as_deref().unwrap_or(DEFAULT_ENDPOINT)
    }
}
