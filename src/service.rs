use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::header::{CONTENT_TYPE, HOST, X_CONTENT_TYPE_OPTIONS};
use http::uri::Authority;
use http::{HeaderValue, Request, Response, StatusCode, Uri};
use tower_layer::Layer;
use tower_service::Service;

use crate::OriginalHost;
use crate::error::Error;
use crate::rule::{RewriteHostConfig, RewriteRule, RuleSet};
use crate::template::TemplateEngine;

/// Layer rewriting the request host with an ordered list of rules.
///
/// The current host is read from the `Host` header, or from the request URI
/// authority when the header is missing. Every rule receives the host
/// produced by the previous rule. Once all rules succeed the final host is
/// written to both the `Host` header and the URI authority (when the URI has
/// one) and the request is passed to the inner service.
///
/// When a rule fails (invalid pattern, invalid template) the inner service is
/// not called and a `500 Internal Server Error` response carrying the error
/// text is returned instead.
///
/// # Example
///
/// ```rust
/// use tower_dynamic_host::{RewriteHostLayer, RewriteRule};
/// let layer = RewriteHostLayer::new(
///     "dynamic-host",
///     [
///         RewriteRule::host(r"^([^.]+)\.localhost$", "$1.example.com"),
///         RewriteRule::host(r"^admin\.example\.com$", "[[ .Host ]].internal"),
///     ],
/// )?
/// .set_keep_original_host(false);
/// # Ok::<(), tower_dynamic_host::Error>(())
/// ```
#[derive(Clone)]
pub struct RewriteHostLayer {
    shared: Arc<Shared>,
    keep_original_host: bool,
}

struct Shared {
    name: String,
    rules: RuleSet,
    engine: TemplateEngine,
}

impl RewriteHostLayer {
    /// Create new layer with `[[` `]]` template delimiters
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyRules`] when no rule is provided
    pub fn new<I>(name: impl Into<String>, rules: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = RewriteRule>,
    {
        Self::with_engine(name, rules, TemplateEngine::new())
    }

    /// Create new layer with provided template engine
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tower_dynamic_host::template::TemplateEngine;
    /// use tower_dynamic_host::{RewriteHostLayer, RewriteRule};
    /// let layer = RewriteHostLayer::with_engine(
    ///     "dynamic-host",
    ///     [RewriteRule::host("^api$", "{% .Host %}.example.com")],
    ///     TemplateEngine::with_delimiters("{%", "%}"),
    /// )?;
    /// # Ok::<(), tower_dynamic_host::Error>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyRules`] when no rule is provided
    pub fn with_engine<I>(
        name: impl Into<String>,
        rules: I,
        engine: TemplateEngine,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = RewriteRule>,
    {
        let rules = RuleSet::new(rules, &engine)?;
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                rules,
                engine,
            }),
            keep_original_host: true,
        })
    }

    /// Create new layer from configuration payload
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyRules`] when configuration has no rule
    pub fn from_config(name: impl Into<String>, config: RewriteHostConfig) -> Result<Self, Error> {
        Self::new(name, config.rules)
    }

    /// Enable or disable storing [`OriginalHost`] extension on rewritten
    /// requests. Enabled by default.
    #[must_use]
    pub fn set_keep_original_host(mut self, keep_original_host: bool) -> Self {
        self.keep_original_host = keep_original_host;
        self
    }

    /// Name of layer used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Rules of layer
    #[must_use]
    pub fn rules(&self) -> &RuleSet {
        &self.shared.rules
    }

    /// Template engine used to parse rule templates
    #[must_use]
    pub fn engine(&self) -> &TemplateEngine {
        &self.shared.engine
    }

    /// Rewrite host of request in place. Request is left untouched when an
    /// error is returned.
    ///
    /// # Errors
    ///
    /// Returns error when a rule fails, when `Host` header is not UTF-8 or
    /// when rewritten host is not a valid host
    pub fn rewrite_request<B>(&self, req: &mut Request<B>) -> Result<(), Error> {
        if !self.shared.rules.targets_host() {
            return Ok(());
        }
        let original = current_host(req)?;
        let host = self
            .shared
            .rules
            .evaluate(req, original.as_deref().unwrap_or_default())?;

        let Some(original) = original else {
            if host.is_empty() {
                return Ok(());
            }
            commit_host(req, &host, true)?;
            #[cfg(feature = "tracing")]
            tracing::debug!("{}: set missing host to {}", self.name(), host);
            return Ok(());
        };

        if original == host {
            // authority is left as is, it may carry user info
            commit_host(req, &host, false)?;
            #[cfg(feature = "tracing")]
            tracing::debug!("{}: host {} unchanged", self.name(), host);
            return Ok(());
        }
        commit_host(req, &host, true)?;

        #[cfg(feature = "tracing")]
        tracing::debug!("{}: rewrote host {} to {}", self.name(), original, host);
        if self.keep_original_host {
            req.extensions_mut().insert(OriginalHost(original));
        }
        Ok(())
    }
}

impl<S> Layer<S> for RewriteHostLayer {
    type Service = RewriteHost<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Self::Service {
            inner,
            layer: self.clone(),
        }
    }
}

/// Rewrite host service that wraps the inner service and rewrites the
/// request host before calling it.
#[derive(Clone)]
pub struct RewriteHost<S> {
    inner: S,
    layer: RewriteHostLayer,
}

impl<S> RewriteHost<S> {
    /// Reference to inner service
    #[must_use]
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consume service and return inner service
    #[must_use]
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for RewriteHost<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: From<String>,
{
    type Error = S::Error;
    type Future = RewriteHostFuture<S::Future, ResBody>;
    type Response = Response<ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        match self.layer.rewrite_request(&mut req) {
            Ok(()) => RewriteHostFuture {
                kind: Kind::Forward {
                    future: self.inner.call(req),
                },
            },
            Err(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("{}: rejected request: {}", self.layer.name(), error);
                RewriteHostFuture {
                    kind: Kind::Rejected {
                        response: Some(error_response(error)),
                    },
                }
            }
        }
    }
}

/// Future for `RewriteHost` service.
#[pin_project::pin_project]
pub struct RewriteHostFuture<F, B> {
    #[pin]
    kind: Kind<F, B>,
}

#[pin_project::pin_project(project = KindProj)]
enum Kind<F, B> {
    Forward {
        #[pin]
        future: F,
    },
    Rejected {
        response: Option<Response<B>>,
    },
}

impl<F, B, E> Future for RewriteHostFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<B>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().kind.project() {
            KindProj::Forward { future } => future.poll(cx),
            KindProj::Rejected { response } => {
                let response = response
                    .take()
                    .expect("RewriteHostFuture polled after completion");
                Poll::Ready(Ok(response))
            }
        }
    }
}

/// Host of request, `Host` header first then URI authority.
fn current_host<B>(req: &Request<B>) -> Result<Option<String>, Error> {
    if let Some(value) = req.headers().get(HOST) {
        let host =
            std::str::from_utf8(value.as_bytes()).map_err(|_| Error::InvalidHostHeader)?;
        return Ok(Some(host.to_string()));
    }
    Ok(req
        .uri()
        .authority()
        .map(|authority| authority_host(authority).to_string()))
}

/// Host and port of authority without user info
pub(crate) fn authority_host(authority: &Authority) -> &str {
    let value = authority.as_str();
    value.rsplit_once('@').map_or(value, |(_, host)| host)
}

/// Write host to `Host` header and, when `update_uri` is set, to URI
/// authority. Both values are built before anything is written so a failure
/// leaves request untouched.
fn commit_host<B>(req: &mut Request<B>, host: &str, update_uri: bool) -> Result<(), Error> {
    let invalid = || Error::InvalidHost(host.to_string());
    let value = HeaderValue::from_str(host).map_err(|_| invalid())?;
    let uri = if update_uri && req.uri().authority().is_some() {
        let authority = host.parse::<Authority>().map_err(|_| invalid())?;
        let mut parts = req.uri().clone().into_parts();
        parts.authority = Some(authority);
        Some(Uri::from_parts(parts).map_err(|_| invalid())?)
    } else {
        None
    };

    if let Some(uri) = uri {
        *req.uri_mut() = uri;
    }
    req.headers_mut().insert(HOST, value);
    Ok(())
}

fn error_response<B>(error: Error) -> Response<B>
where
    B: From<String>,
{
    let mut response = Response::new(B::from(error.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    response.extensions_mut().insert(error);
    response
}
