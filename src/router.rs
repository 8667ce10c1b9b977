//! Route table: exact routes plus ordered pattern routes.

use crate::{
    errors::HandlerError,
    http::{
        request::Request,
        response::{Chunks, Response},
        types::Method,
    },
};
use regex::Regex;
use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

/// What every handler returns.
pub type HandlerResult = Result<Response, HandlerError>;

/// Handler run on the loop thread or on a worker thread.
pub type SyncHandler = Arc<dyn Fn(&Request, &Captures) -> HandlerResult + Send + Sync>;

/// Future returned by a [`Strategy::Local`] handler. It may hold `!Send` state.
pub type LocalFuture = Pin<Box<dyn Future<Output = HandlerResult>>>;

/// Handler producing a future polled on the loop thread.
pub type LocalHandler = Arc<dyn Fn(Request, Captures) -> LocalFuture + Send + Sync>;

/// Handler run inside a worker process.
///
/// A plain function pointer: worker processes run their own copy of the
/// program, so handlers cannot carry captured state across.
pub type ProcessHandler = fn(&Request, &Captures) -> HandlerResult;

/// Handler run inside a worker process whose chunks are written to the
/// client as they are produced. Chunks are written raw; start with
/// [`stream_head`](crate::stream_head) to send a status line.
pub type StreamHandler = fn(&Request, &Captures) -> Result<Chunks, HandlerError>;

/// How a matched handler is executed.
#[derive(Clone)]
pub enum Strategy {
    /// Runs on the loop thread and blocks every other connection until it
    /// returns. No timeout.
    Inline(SyncHandler),
    /// Runs on the thread pool; the connection waits up to the handler
    /// timeout.
    Thread(SyncHandler),
    /// An async handler polled on the loop thread, up to the handler timeout.
    Local(LocalHandler),
    /// Runs in a worker process, up to the handler timeout.
    Process(ProcessHandler),
    /// Runs in a worker process and streams its chunks. No timeout.
    Stream(StreamHandler),
}

/// Tag of a [`Strategy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    Inline,
    Thread,
    Local,
    Process,
    Stream,
}

impl Strategy {
    pub fn inline<F>(handler: F) -> Self
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        Strategy::Inline(Arc::new(handler))
    }

    pub fn thread<F>(handler: F) -> Self
    where
        F: Fn(&Request, &Captures) -> HandlerResult + Send + Sync + 'static,
    {
        Strategy::Thread(Arc::new(handler))
    }

    pub fn local<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request, Captures) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + 'static,
    {
        Strategy::Local(Arc::new(move |req, caps| Box::pin(handler(req, caps))))
    }

    #[inline]
    pub fn process(handler: ProcessHandler) -> Self {
        Strategy::Process(handler)
    }

    #[inline]
    pub fn stream(handler: StreamHandler) -> Self {
        Strategy::Stream(handler)
    }

    #[inline]
    pub const fn kind(&self) -> StrategyKind {
        match self {
            Strategy::Inline(_) => StrategyKind::Inline,
            Strategy::Thread(_) => StrategyKind::Thread,
            Strategy::Local(_) => StrategyKind::Local,
            Strategy::Process(_) => StrategyKind::Process,
            Strategy::Stream(_) => StrategyKind::Stream,
        }
    }
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Strategy::{:?}", self.kind())
    }
}

/// Values captured by the `<name>` placeholders of a pattern route.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Captures {
    names: Arc<[String]>,
    values: Vec<String>,
}

impl Captures {
    pub(crate) fn new(names: Arc<[String]>, values: Vec<String>) -> Self {
        Self { names, values }
    }

    /// Captured values in placeholder order.
    #[inline]
    pub fn values(&self) -> &[String] {
        &self.values
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    /// Looks a value up by placeholder name.
    pub fn named(&self, name: &str) -> Option<&str> {
        let index = self.names.iter().position(|n| n == name)?;
        self.get(index)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A registered route.
#[derive(Debug)]
pub struct Route {
    method: Method,
    pattern: String,
    names: Arc<[String]>,
    strategy: Strategy,
}

impl Route {
    #[inline(always)]
    pub const fn method(&self) -> Method {
        self.method
    }

    #[inline(always)]
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    #[inline(always)]
    pub const fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// `"VERB pattern"`, the name a worker process uses to find the route.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.pattern)
    }

    #[inline]
    pub(crate) fn captures(&self, values: Vec<String>) -> Captures {
        Captures::new(self.names.clone(), values)
    }
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub route: Arc<Route>,
    pub captures: Captures,
}

#[derive(Debug)]
struct PatternRoute {
    matcher: Regex,
    route: Arc<Route>,
}

/// The route table.
///
/// Literal paths live in an exact map keyed by path and verb; paths with
/// `<name>` placeholders are kept in registration order and tried one by one
/// after the exact lookup fails.
///
/// Registering the same verb and literal path twice replaces the earlier
/// handler. Registering the same verb and pattern twice keeps both, and the
/// first one keeps matching. Both cases log a warning.
///
/// # Examples
/// ```
/// use pixie_web::{Method, Response, Router, Strategy};
///
/// let mut router = Router::new();
/// router
///     .register(Method::Get, "/", Strategy::inline(|_, _| Ok(Response::new("home"))))
///     .register(Method::Get, "/items/<id>", Strategy::thread(|_, caps| {
///         Ok(Response::new(format!("item {}", caps.named("id").unwrap_or("?"))))
///     }));
///
/// let found = router.resolve(Method::Get, "/items/42/").unwrap();
/// assert_eq!(found.captures.values(), ["42"]);
/// assert!(router.resolve(Method::Get, "/items/42/extra").is_none());
/// assert!(router.resolve(Method::Post, "/").is_none());
/// ```
#[derive(Debug, Default)]
pub struct Router {
    exact: HashMap<String, HashMap<Method, Arc<Route>>>,
    patterns: Vec<PatternRoute>,
}

impl Router {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route.
    ///
    /// A single trailing slash of `pattern` is ignored, as it is for
    /// incoming paths.
    ///
    /// # Panics
    ///
    /// Panics when a placeholder is not closed or its name is empty or not
    /// made of ASCII letters, digits and `_`.
    #[track_caller]
    pub fn register(&mut self, method: Method, pattern: &str, strategy: Strategy) -> &mut Self {
        let pattern = normalize_path(pattern);
        let (matcher, names) = match compile(pattern) {
            Ok(compiled) => compiled,
            Err(msg) => panic!("invalid route pattern `{pattern}`: {msg}"),
        };

        let route = Arc::new(Route {
            method,
            pattern: pattern.to_owned(),
            names: names.into(),
            strategy,
        });

        match matcher {
            None => {
                let previous = self
                    .exact
                    .entry(route.pattern.clone())
                    .or_default()
                    .insert(method, route);

                if previous.is_some() {
                    tracing::warn!(%method, pattern, "route registered again, replacing the previous handler");
                }
            }
            Some(matcher) => {
                if self.find_pattern(method, pattern).is_some() {
                    tracing::warn!(%method, pattern, "pattern route registered again, the first one keeps matching");
                }
                self.patterns.push(PatternRoute { matcher, route });
            }
        }

        self
    }

    #[track_caller]
    #[inline]
    pub fn get(&mut self, pattern: &str, strategy: Strategy) -> &mut Self {
        self.register(Method::Get, pattern, strategy)
    }

    #[track_caller]
    #[inline]
    pub fn post(&mut self, pattern: &str, strategy: Strategy) -> &mut Self {
        self.register(Method::Post, pattern, strategy)
    }

    /// Finds the route for an incoming request path (query string already
    /// removed).
    pub fn resolve(&self, method: Method, path: &str) -> Option<Resolved> {
        let path = normalize_path(path);

        if let Some(route) = self.exact.get(path).and_then(|verbs| verbs.get(&method)) {
            return Some(Resolved {
                route: route.clone(),
                captures: route.captures(Vec::new()),
            });
        }

        self.patterns
            .iter()
            .filter(|p| p.route.method == method)
            .find_map(|p| {
                let caps = p.matcher.captures(path)?;
                let values = caps
                    .iter()
                    .skip(1)
                    .map(|m| m.map_or_else(String::new, |m| m.as_str().to_owned()))
                    .collect();

                Some(Resolved {
                    route: p.route.clone(),
                    captures: p.route.captures(values),
                })
            })
    }

    /// Looks a route up by the verb and pattern it was registered with.
    pub fn find(&self, method: Method, pattern: &str) -> Option<&Arc<Route>> {
        let pattern = normalize_path(pattern);

        self.exact
            .get(pattern)
            .and_then(|verbs| verbs.get(&method))
            .or_else(|| self.find_pattern(method, pattern))
    }

    /// Looks a route up by its [`Route::key`].
    pub fn find_key(&self, key: &str) -> Option<&Arc<Route>> {
        let (method, pattern) = key.split_once(' ')?;
        self.find(method.parse().ok()?, pattern)
    }

    #[inline]
    fn find_pattern(&self, method: Method, pattern: &str) -> Option<&Arc<Route>> {
        self.patterns
            .iter()
            .map(|p| &p.route)
            .find(|r| r.method == method && r.pattern == pattern)
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.exact.values().map(HashMap::len).sum::<usize>() + self.patterns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drops one trailing slash; the empty path becomes `/`.
#[inline]
fn normalize_path(path: &str) -> &str {
    let path = path.strip_suffix('/').unwrap_or(path);
    if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// Compiles a pattern with `<name>` placeholders into an anchored regex.
///
/// Returns `None` for literal paths.
fn compile(pattern: &str) -> Result<(Option<Regex>, Vec<String>), String> {
    let mut names = Vec::new();
    let mut source = String::from("^");
    let mut rest = pattern;

    while let Some(open) = rest.find('<') {
        let close = rest[open..]
            .find('>')
            .map(|i| open + i)
            .ok_or("placeholder is not closed")?;
        let name = &rest[open + 1..close];

        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(format!("bad placeholder name `{name}`"));
        }

        source.push_str(&regex::escape(&rest[..open]));
        source.push_str("([^/]*?)");
        names.push(name.to_owned());
        rest = &rest[close + 1..];
    }

    if names.is_empty() {
        return Ok((None, names));
    }

    source.push_str(&regex::escape(rest));
    source.push('$');

    let matcher = Regex::new(&source).map_err(|e| e.to_string())?;
    Ok((Some(matcher), names))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn says(text: &'static str) -> Strategy {
        Strategy::inline(move |_, _| Ok(Response::new(text)))
    }

    fn run(router: &Router, method: Method, path: &str) -> Option<(String, Vec<String>)> {
        let found = router.resolve(method, path)?;
        let Strategy::Inline(handler) = found.route.strategy() else {
            panic!("expected an inline route");
        };
        let req = Request::parse(b"GET / HTTP/1.1\r\n\r\n".to_vec()).unwrap();
        let resp = handler(&req, &found.captures).unwrap();

        Some((
            String::from_utf8(resp.body_bytes().to_vec()).unwrap(),
            found.captures.values().to_vec(),
        ))
    }

    fn table() -> Router {
        let mut router = Router::new();
        router
            .register(Method::Get, "/", says("root"))
            .register(Method::Get, "/about", says("about"))
            .register(Method::Post, "/about", says("about-post"))
            .register(Method::Get, "/items/<id>", says("item"))
            .register(Method::Get, "/items/<id>/edit", says("edit"))
            .register(Method::Get, "/<page>", says("page"))
            .register(Method::Get, "/files/<name>.<ext>", says("file"))
            .register(Method::Get, "/a.b/<x>", says("dots"));
        router
    }

    #[test]
    fn resolution() {
        let router = table();

        #[rustfmt::skip]
        let cases: [(Method, &str, Option<(&str, &[&str])>); 15] = [
            (Method::Get,    "/",               Some(("root", &[]))),
            (Method::Get,    "",                Some(("root", &[]))),
            (Method::Get,    "/about",          Some(("about", &[]))),
            (Method::Get,    "/about/",         Some(("about", &[]))),
            (Method::Post,   "/about",          Some(("about-post", &[]))),
            (Method::Delete, "/about",          None),
            (Method::Get,    "/items/42",       Some(("item", &["42"]))),
            (Method::Get,    "/items/42/",      Some(("item", &["42"]))),
            (Method::Get,    "/items/42/edit",  Some(("edit", &["42"]))),
            (Method::Get,    "/items/42/extra", None),
            (Method::Get,    "/items/",         Some(("page", &["items"]))),
            (Method::Get,    "/contact",        Some(("page", &["contact"]))),
            (Method::Get,    "/files/a.tar.gz", Some(("file", &["a", "tar.gz"]))),
            (Method::Get,    "/aXb/1",          None),
            (Method::Get,    "/a.b/1",          Some(("dots", &["1"]))),
        ];

        for (method, path, expected) in cases {
            let got = run(&router, method, path);
            let expected = expected.map(|(body, caps)| {
                (body.to_owned(), caps.iter().map(|c| c.to_string()).collect::<Vec<_>>())
            });
            assert_eq!(got, expected, "{method} {path}");
        }
    }

    #[test]
    fn literal_beats_pattern_and_order_matters() {
        let mut router = Router::new();
        router
            .register(Method::Get, "/<a>", says("first"))
            .register(Method::Get, "/<b>", says("second"))
            .register(Method::Get, "/fixed", says("literal"));

        assert_eq!(run(&router, Method::Get, "/x").unwrap().0, "first");
        assert_eq!(run(&router, Method::Get, "/fixed").unwrap().0, "literal");
    }

    #[test]
    fn re_registration_replaces_literal_route() {
        let mut router = Router::new();
        router
            .register(Method::Get, "/x", says("old"))
            .register(Method::Get, "/x", says("new"));

        assert_eq!(run(&router, Method::Get, "/x").unwrap().0, "new");
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn dispatch_ignores_body_and_headers() {
        let router = table();
        let plain = router.resolve(Method::Post, "/about").unwrap();

        let req = Request::parse(
            b"POST /about?x=1 HTTP/1.1\r\nContent-Length: 3\r\nX-Any: y\r\n\r\nabc".to_vec(),
        )
        .unwrap();
        let with_body = router.resolve(req.method(), req.path()).unwrap();

        assert!(Arc::ptr_eq(&plain.route, &with_body.route));
    }

    #[test]
    fn named_captures_and_keys() {
        let router = table();
        let found = router.resolve(Method::Get, "/files/report.pdf").unwrap();

        assert_eq!(found.captures.named("name"), Some("report"));
        assert_eq!(found.captures.named("ext"), Some("pdf"));
        assert_eq!(found.captures.named("nope"), None);
        assert_eq!(found.route.key(), "GET /files/<name>.<ext>");

        let by_key = router.find_key("GET /files/<name>.<ext>").unwrap();
        assert!(Arc::ptr_eq(by_key, &found.route));
        assert!(router.find_key("GET /about").is_some());
        assert!(router.find_key("PUT /about").is_none());
        assert!(router.find_key("nonsense").is_none());
    }

    #[test]
    #[should_panic(expected = "placeholder is not closed")]
    fn unclosed_placeholder() {
        Router::new().register(Method::Get, "/items/<id", says("x"));
    }

    #[test]
    #[should_panic(expected = "bad placeholder name")]
    fn bad_placeholder_name() {
        Router::new().register(Method::Get, "/items/<i d>", says("x"));
    }
}
