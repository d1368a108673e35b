//! Route registration and the frozen route table
//!
//! Routes are registered single-threaded while the application is being
//! built, then frozen into an immutable [`RouteTable`] that request threads
//! read without locks. Literal paths resolve through a per-method map;
//! pattern paths are scanned in registration order, first match wins.

use std::collections::HashMap;
use std::sync::Arc;

use crate::http::chain::Controller;

/// HTTP methods the router distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    /// Registration-only wildcard, expanded to every concrete method
    All,
}

impl Method {
    const CONCRETE: [Method; 7] = [
        Method::Get,
        Method::Post,
        Method::Put,
        Method::Delete,
        Method::Head,
        Method::Options,
        Method::Patch,
    ];

    pub fn parse(s: &str) -> Option<Method> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            "PATCH" => Some(Method::Patch),
            "ALL" | "*" => Some(Method::All),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::All => "ALL",
        }
    }
}

/// Pipeline phase a route belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Runs before routing-dependent work, for every request
    Header,
    /// The matched route's own chain
    Route,
    /// Runs after the route chain, for every request
    Footer,
    /// Runs only when nothing responded
    Missing,
}

/// A compiled path pattern. `:name` segments capture, everything else
/// matches literally. Patterns without captures stay literal strings.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Option<Vec<Segment>>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

impl PathPattern {
    pub fn compile(path: &str) -> Self {
        if !path.contains(':') {
            return Self {
                raw: path.to_string(),
                segments: None,
            };
        }
        let segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(s.to_string()),
            })
            .collect();
        Self {
            raw: path.to_string(),
            segments: Some(segments),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_literal(&self) -> bool {
        self.segments.is_none()
    }

    /// Names of the capturing segments, in path order
    pub fn capture_names(&self) -> Vec<&str> {
        match &self.segments {
            None => Vec::new(),
            Some(segments) => segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Param(name) => Some(name.as_str()),
                    Segment::Literal(_) => None,
                })
                .collect(),
        }
    }

    /// Match a request path, returning captured parameters on success
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let segments = match &self.segments {
            None => {
                return if self.raw == path {
                    Some(Vec::new())
                } else {
                    None
                }
            }
            Some(segments) => segments,
        };
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != segments.len() {
            return None;
        }
        let mut captures = Vec::new();
        for (segment, part) in segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => captures.push((name.clone(), (*part).to_string())),
            }
        }
        Some(captures)
    }
}

/// An immutable registered route
pub struct Route {
    pub method: Method,
    pub phase: Phase,
    pub pattern: PathPattern,
    pub chain: Vec<Controller>,
}

/// Mutable registration surface, single-threaded by construction
#[derive(Default)]
pub struct RouterBuilder {
    routes: Vec<Route>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route in a phase. Header/footer/missing routes ignore the
    /// path for matching purposes but keep it for the summary.
    pub fn register(&mut self, method: Method, phase: Phase, path: &str, chain: Vec<Controller>) {
        self.routes.push(Route {
            method,
            phase,
            pattern: PathPattern::compile(path),
            chain,
        });
    }

    pub fn get(&mut self, path: &str, chain: Vec<Controller>) {
        self.register(Method::Get, Phase::Route, path, chain);
    }

    pub fn post(&mut self, path: &str, chain: Vec<Controller>) {
        self.register(Method::Post, Phase::Route, path, chain);
    }

    pub fn put(&mut self, path: &str, chain: Vec<Controller>) {
        self.register(Method::Put, Phase::Route, path, chain);
    }

    pub fn delete(&mut self, path: &str, chain: Vec<Controller>) {
        self.register(Method::Delete, Phase::Route, path, chain);
    }

    pub fn all(&mut self, path: &str, chain: Vec<Controller>) {
        self.register(Method::All, Phase::Route, path, chain);
    }

    pub fn header(&mut self, chain: Vec<Controller>) {
        self.register(Method::All, Phase::Header, "*", chain);
    }

    pub fn footer(&mut self, chain: Vec<Controller>) {
        self.register(Method::All, Phase::Footer, "*", chain);
    }

    pub fn missing(&mut self, chain: Vec<Controller>) {
        self.register(Method::All, Phase::Missing, "*", chain);
    }

    /// Freeze the registrations into an immutable table
    pub fn freeze(self) -> Arc<RouteTable> {
        let mut table = RouteTable {
            methods: HashMap::new(),
            header: Vec::new(),
            footer: Vec::new(),
            missing: Vec::new(),
            summary: Vec::new(),
        };
        for route in self.routes {
            let route = Arc::new(route);
            match route.phase {
                Phase::Header => table.header.push(route),
                Phase::Footer => table.footer.push(route),
                Phase::Missing => table.missing.push(route),
                Phase::Route => {
                    table.summary.push(format!(
                        "[{}] {}",
                        route.method.as_str(),
                        route.pattern.raw()
                    ));
                    let methods: &[Method] = match route.method {
                        Method::All => &Method::CONCRETE,
                        _ => std::slice::from_ref(&route.method),
                    };
                    for method in methods {
                        let bucket = table.methods.entry(*method).or_default();
                        if route.pattern.is_literal() {
                            bucket
                                .literal
                                .entry(route.pattern.raw().to_string())
                                .or_insert_with(|| route.clone());
                        } else {
                            bucket.patterns.push(route.clone());
                        }
                    }
                }
            }
        }
        Arc::new(table)
    }
}

#[derive(Default)]
struct MethodRoutes {
    literal: HashMap<String, Arc<Route>>,
    patterns: Vec<Arc<Route>>,
}

/// Frozen route table shared across request threads
pub struct RouteTable {
    methods: HashMap<Method, MethodRoutes>,
    header: Vec<Arc<Route>>,
    footer: Vec<Arc<Route>>,
    missing: Vec<Arc<Route>>,
    summary: Vec<String>,
}

impl RouteTable {
    /// Resolve a request to a route. Literal lookup first, then pattern
    /// routes in registration order.
    pub fn resolve(&self, method: &str, path: &str) -> Option<(Arc<Route>, Vec<(String, String)>)> {
        let method = Method::parse(method)?;
        let bucket = self.methods.get(&method)?;
        if let Some(route) = bucket.literal.get(path) {
            return Some((route.clone(), Vec::new()));
        }
        for route in &bucket.patterns {
            if let Some(captures) = route.pattern.matches(path) {
                return Some((route.clone(), captures));
            }
        }
        None
    }

    pub fn header(&self) -> &[Arc<Route>] {
        &self.header
    }

    pub fn footer(&self) -> &[Arc<Route>] {
        &self.footer
    }

    pub fn missing(&self) -> &[Arc<Route>] {
        &self.missing
    }

    /// One line per registered route, e.g. `[GET] /hello/:name`
    pub fn summary(&self) -> &[String] {
        &self.summary
    }
}
