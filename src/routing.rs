//! Path patterns and route dispatch.
//!
//! Patterns use `{name}` to capture one path segment and `{name:regex}`
//! to capture with an explicit regex. Compilation anchors the whole
//! path; dispatch scans routes in registration order and the first
//! match wins.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use http::Method;
use regex::Regex;

use crate::endpoint::{Bag, EndpointFactory};
use crate::http::Request;
use crate::response::Response;
use crate::sockjs::SockJsRoute;

/// Named captures produced by a pattern match.
pub type PathParams = HashMap<String, String>;

pub(crate) type CallbackFn =
    Arc<dyn Fn(Request, PathParams) -> BoxFuture<'static, Response> + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct PathPattern {
    regex: Regex,
    names: Vec<String>,
}

impl PathPattern {
    /// Compile a route pattern. Panics on an invalid embedded regex,
    /// which is a registration-time programmer error.
    pub(crate) fn new(pattern: &str) -> PathPattern {
        let placeholder = Regex::new(r"\{(\w+)(?::([^{}]+))?\}").expect("placeholder regex");

        let mut names = Vec::new();
        let compiled = placeholder.replace_all(pattern, |caps: &regex::Captures<'_>| {
            let name = caps.get(1).expect("placeholder name").as_str();
            let segment = caps.get(2).map(|m| m.as_str()).unwrap_or("[^/]+");
            names.push(name.to_owned());
            format!("(?P<{}>{})", name, segment)
        });

        let regex = Regex::new(&format!("^{}$", compiled))
            .expect("invalid regex generated from route pattern");

        PathPattern { regex, names }
    }

    pub(crate) fn matches(&self, path: &str) -> Option<PathParams> {
        let caps = self.regex.captures(path)?;
        let mut params = PathParams::new();
        for name in &self.names {
            if let Some(value) = caps.name(name) {
                params.insert(name.clone(), value.as_str().to_owned());
            }
        }
        Some(params)
    }
}

/// The set of HTTP methods a route answers; `*` matches any.
#[derive(Debug, Clone)]
pub(crate) struct MethodSet(Option<Vec<Method>>);

impl MethodSet {
    pub(crate) fn any() -> MethodSet {
        MethodSet(None)
    }

    pub(crate) fn from_strs(methods: &[&str]) -> MethodSet {
        if methods.iter().any(|m| *m == "*") {
            return MethodSet::any();
        }
        let methods = methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .expect("invalid method in route registration")
            })
            .collect();
        MethodSet(Some(methods))
    }

    pub(crate) fn matches(&self, method: &Method) -> bool {
        match &self.0 {
            None => true,
            Some(methods) => methods.contains(method),
        }
    }
}

pub(crate) enum RouteKind {
    /// A single request/response callback.
    Callback(CallbackFn),
    /// A long-lived WebSocket endpoint.
    WebSocket { factory: EndpointFactory },
    /// A SockJS endpoint absorbing the whole sub-tree under its prefix.
    SockJs(Arc<SockJsRoute>),
}

pub(crate) struct Route {
    pub(crate) pattern: PathPattern,
    pub(crate) methods: MethodSet,
    pub(crate) kind: RouteKind,
    pub(crate) bag: Bag,
}

#[derive(Default)]
pub(crate) struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub(crate) fn new() -> Router {
        Router::default()
    }

    pub(crate) fn push(&mut self, route: Route) {
        self.routes.push(route);
    }

    /// First registered route matching `(method, path)`, with its
    /// captures.
    pub(crate) fn dispatch(&self, method: &Method, path: &str) -> Option<(&Route, PathParams)> {
        for route in &self.routes {
            if !route.methods.matches(method) {
                continue;
            }
            if let Some(params) = route.pattern.matches(path) {
                return Some((route, params));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_match(pattern: &str, path: &str) {
        assert!(
            PathPattern::new(pattern).matches(path).is_some(),
            "`{}` doesn't match `{}`",
            path,
            pattern
        );
    }

    fn refute_match(pattern: &str, path: &str) {
        assert!(
            PathPattern::new(pattern).matches(path).is_none(),
            "`{}` matched `{}` (but shouldn't)",
            path,
            pattern
        );
    }

    #[test]
    fn literal_patterns_are_anchored() {
        assert_match("/", "/");
        assert_match("/foo", "/foo");
        refute_match("/foo", "/foo/");
        refute_match("/foo", "/foo/bar");
        refute_match("/foo/bar", "/foo");
    }

    #[test]
    fn named_captures_take_one_segment() {
        let pattern = PathPattern::new("/users/{id}");
        let params = pattern.matches("/users/42").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        refute_match("/users/{id}", "/users/42/action");
        refute_match("/users/{id}", "/users/");
    }

    #[test]
    fn explicit_regex_captures() {
        let pattern = PathPattern::new("/posts/{year:[0-9]+}/{slug}");
        let params = pattern.matches("/posts/2014/hello-world").unwrap();
        assert_eq!(params.get("year").map(String::as_str), Some("2014"));
        assert_eq!(params.get("slug").map(String::as_str), Some("hello-world"));
        refute_match("/posts/{year:[0-9]+}/{slug}", "/posts/abc/hello");
    }

    #[test]
    fn tail_capture_spans_slashes() {
        let pattern = PathPattern::new("/chat{tail:.*}");
        let params = pattern.matches("/chat/abc/s1/xhr").unwrap();
        assert_eq!(params.get("tail").map(String::as_str), Some("/abc/s1/xhr"));
        assert_eq!(
            pattern.matches("/chat").unwrap().get("tail").map(String::as_str),
            Some("")
        );
    }

    #[test]
    fn method_sets() {
        let set = MethodSet::from_strs(&["get", "POST"]);
        assert!(set.matches(&Method::GET));
        assert!(set.matches(&Method::POST));
        assert!(!set.matches(&Method::DELETE));
        assert!(MethodSet::from_strs(&["*"]).matches(&Method::PATCH));
    }
}
