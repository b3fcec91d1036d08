//! Request routing: map regex path patterns and HTTP methods to handlers.
//!
//! Patterns are regular expressions matched against the whole request path
//! (without the query string). Routes are kept in registration order and the
//! first pattern whose handler map contains the request method and whose
//! regex matches wins:
//!
//! | Pattern                | Example match   | Captures                  |
//! |------------------------|-----------------|---------------------------|
//! | `/hello`               | `/hello`        | `0 → "/hello"`            |
//! | `/users/([0-9]+)`      | `/users/42`     | `1 → "42"`                |
//! | `/files/(?P<rest>.*)`  | `/files/a/b`    | `1 → "a/b"`               |
//!
//! Requests no route accepts fall back to a per-method default handler. A
//! request carrying an `Upgrade` header bypasses the table entirely when an
//! upgrade hook is registered.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{Method, Request, Response};

/// Type-erased route handler.
///
/// Handlers run synchronously on a worker thread, fill in the [`Response`]
/// and return; the pipeline sends the response afterwards. A handler that
/// panics produces a `HandlerFault` on the error callback and no response.
pub type Handler = Arc<dyn Fn(&mut Request, &mut Response) + Send + Sync + 'static>;

/// A raw byte stream handed over to an upgrade hook.
pub trait UpgradedIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> UpgradedIo for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Ownership of a connection's transport after an `Upgrade` request.
pub type Upgraded = Pin<Box<dyn UpgradedIo>>;

/// Receives the raw transport and the request that asked for the upgrade.
/// The HTTP pipeline does not resume on that connection.
pub type UpgradeHook = Arc<dyn Fn(Upgraded, Request) + Send + Sync + 'static>;

/// Errors raised while building a [`Router`].
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid route pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

// A compiled pattern and the handlers registered on it, keyed by method.
struct Route {
    source: String,
    regex: Regex,
    handlers: HashMap<Method, Handler>,
}

impl Route {
    fn compile(pattern: &str) -> Result<Self, RouterError> {
        // Anchored so the pattern has to match the whole path.
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| RouterError::Pattern {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_owned(),
            regex,
            handlers: HashMap::new(),
        })
    }

    fn captures(&self, path: &str) -> Option<Vec<Option<String>>> {
        let caps = self.regex.captures(path)?;
        Some(
            caps.iter()
                .map(|group| group.map(|m| m.as_str().to_owned()))
                .collect(),
        )
    }
}

/// The result of looking a request up in the route table.
pub(crate) struct Selected {
    pub(crate) handler: Handler,
    pub(crate) path_match: Vec<Option<String>>,
}

/// Ordered route table, per-method defaults and an optional upgrade hook.
///
/// Built before the server starts and shared read-only by every connection.
///
/// # Examples
///
/// ```
/// use wicket::{Headers, Router, StatusCode};
///
/// let mut router = Router::new();
/// router
///     .get("/users/([0-9]+)", |req, res| {
///         let id = req.path_match(1).unwrap_or_default().to_owned();
///         res.write_ok(id, &Headers::new());
///     })
///     .unwrap();
/// router.default_handler("GET", |_req, res| {
///     res.write_status(StatusCode::NotFound, &Headers::new());
/// });
/// assert_eq!(router.len(), 1);
/// ```
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    defaults: HashMap<Method, Handler>,
    upgrade: Option<UpgradeHook>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` on `pattern`.
    ///
    /// Registering a pattern that is already present adds the method to that
    /// route and keeps its original position; a repeated method replaces the
    /// earlier handler.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Pattern`] if `pattern` is not a valid regex.
    pub fn route<H>(&mut self, method: impl Into<Method>, pattern: &str, handler: H) -> Result<&mut Self, RouterError>
    where
        H: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    {
        let index = match self.routes.iter().position(|r| r.source == pattern) {
            Some(index) => index,
            None => {
                self.routes.push(Route::compile(pattern)?);
                self.routes.len() - 1
            }
        };
        self.routes[index].handlers.insert(method.into(), Arc::new(handler));
        Ok(self)
    }

    pub fn get<H>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouterError>
    where
        H: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    {
        self.route(Method::Get, pattern, handler)
    }

    pub fn post<H>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouterError>
    where
        H: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    {
        self.route(Method::Post, pattern, handler)
    }

    pub fn put<H>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouterError>
    where
        H: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    {
        self.route(Method::Put, pattern, handler)
    }

    pub fn delete<H>(&mut self, pattern: &str, handler: H) -> Result<&mut Self, RouterError>
    where
        H: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    {
        self.route(Method::Delete, pattern, handler)
    }

    /// Registers the fallback handler for `method`, used when no pattern
    /// accepts a request.
    pub fn default_handler<H>(&mut self, method: impl Into<Method>, handler: H) -> &mut Self
    where
        H: Fn(&mut Request, &mut Response) + Send + Sync + 'static,
    {
        self.defaults.insert(method.into(), Arc::new(handler));
        self
    }

    /// Registers the hook that takes over connections sending `Upgrade`.
    pub fn upgrade<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Upgraded, Request) + Send + Sync + 'static,
    {
        self.upgrade = Some(Arc::new(hook));
        self
    }

    pub(crate) fn upgrade_hook(&self) -> Option<&UpgradeHook> {
        self.upgrade.as_ref()
    }

    /// Number of distinct patterns registered.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Finds the handler for `method` and `path`: the first route in
    /// registration order accepting both, else the method's default.
    pub(crate) fn select(&self, method: &Method, path: &str) -> Option<Selected> {
        for route in &self.routes {
            let Some(handler) = route.handlers.get(method) else {
                continue;
            };
            if let Some(path_match) = route.captures(path) {
                return Some(Selected {
                    handler: Arc::clone(handler),
                    path_match,
                });
            }
        }

        self.defaults.get(method).map(|handler| Selected {
            handler: Arc::clone(handler),
            path_match: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Headers, StatusCode};

    fn request(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        Request::parse(raw.as_bytes()).unwrap()
    }

    fn answer(status: StatusCode) -> impl Fn(&mut Request, &mut Response) + Send + Sync + 'static {
        move |_req: &mut Request, res: &mut Response| res.write_status(status, &Headers::new())
    }

    // Runs whatever `select` picked and returns the written status.
    fn dispatch(router: &Router, method: &str, path: &str) -> Option<StatusCode> {
        let mut req = request(method, path);
        let selected = router.select(req.method(), req.path())?;
        req.set_path_match(selected.path_match);
        let mut res = Response::new();
        (selected.handler)(&mut req, &mut res);
        res.status()
    }

    #[test]
    fn starts_empty() {
        assert!(Router::new().is_empty());
        assert!(Router::default().upgrade_hook().is_none());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut router = Router::new();
        let err = router.get("/broken(", answer(StatusCode::Ok)).err().unwrap();
        assert!(err.to_string().contains("/broken("));
        assert!(router.is_empty());
    }

    #[test]
    fn pattern_must_match_whole_path() {
        let mut router = Router::new();
        router.get("/hello", answer(StatusCode::Ok)).unwrap();
        assert_eq!(dispatch(&router, "GET", "/hello"), Some(StatusCode::Ok));
        assert_eq!(dispatch(&router, "GET", "/hello/world"), None);
        assert_eq!(dispatch(&router, "GET", "/say/hello"), None);
    }

    #[test]
    fn method_must_be_registered() {
        let mut router = Router::new();
        router.get("/hello", answer(StatusCode::Ok)).unwrap();
        assert_eq!(dispatch(&router, "POST", "/hello"), None);
    }

    #[test]
    fn registration_order_wins_over_pattern_text() {
        let mut router = Router::new();
        router.get("/b.*", answer(StatusCode::Accepted)).unwrap();
        router.get("/a.*|/b", answer(StatusCode::Created)).unwrap();
        assert_eq!(dispatch(&router, "GET", "/b"), Some(StatusCode::Accepted));
        assert_eq!(dispatch(&router, "GET", "/a1"), Some(StatusCode::Created));
    }

    #[test]
    fn earlier_route_without_method_is_skipped() {
        let mut router = Router::new();
        router.post("/item/.*", answer(StatusCode::Created)).unwrap();
        router.get("/item/[0-9]+", answer(StatusCode::Ok)).unwrap();
        assert_eq!(dispatch(&router, "GET", "/item/9"), Some(StatusCode::Ok));
        assert_eq!(dispatch(&router, "POST", "/item/9"), Some(StatusCode::Created));
    }

    #[test]
    fn same_pattern_keeps_its_position() {
        let mut router = Router::new();
        router.get("/x", answer(StatusCode::Ok)).unwrap();
        router.get("/.*", answer(StatusCode::Accepted)).unwrap();
        router.put("/x", answer(StatusCode::NoContent)).unwrap();
        assert_eq!(router.len(), 2);
        assert_eq!(dispatch(&router, "PUT", "/x"), Some(StatusCode::NoContent));
        assert_eq!(dispatch(&router, "GET", "/x"), Some(StatusCode::Ok));
    }

    #[test]
    fn captures_are_exposed_on_the_request() {
        let mut router = Router::new();
        router
            .get("/users/([0-9]+)/posts/(?P<post>[a-z]+)", |req: &mut Request, res: &mut Response| {
                let body = format!("{}:{}", req.path_match(1).unwrap(), req.path_match(2).unwrap());
                res.write_ok(body, &Headers::new());
            })
            .unwrap();

        let mut req = request("GET", "/users/7/posts/abc");
        let selected = router.select(req.method(), req.path()).unwrap();
        req.set_path_match(selected.path_match);
        let mut res = Response::new();
        (selected.handler)(&mut req, &mut res);
        assert_eq!(req.path_match(0), Some("/users/7/posts/abc"));
        assert!(String::from_utf8_lossy(res.buffer()).ends_with("7:abc"));
    }

    #[test]
    fn default_handler_is_per_method() {
        let mut router = Router::new();
        router.get("/known", answer(StatusCode::Ok)).unwrap();
        router.default_handler("GET", answer(StatusCode::NotFound));
        assert_eq!(dispatch(&router, "GET", "/unknown"), Some(StatusCode::NotFound));
        assert_eq!(dispatch(&router, "DELETE", "/unknown"), None);
    }

    #[test]
    fn custom_methods_route() {
        let mut router = Router::new();
        router.route("PURGE", "/cache", answer(StatusCode::Accepted)).unwrap();
        assert_eq!(dispatch(&router, "PURGE", "/cache"), Some(StatusCode::Accepted));
    }
}
