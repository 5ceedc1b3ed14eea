//! Hostname matchers.
//!
//! A matcher decides whether a sniffed hostname belongs to a service. The
//! registry only ever sees `dyn MatchService`, so new matching rules can be
//! added without touching dispatch.

use std::fmt;
use std::sync::Arc;

/// Decides whether a hostname belongs to a service.
pub trait MatchService: Send + Sync {
    fn match_service(&self, name: &str) -> bool;
}

/// Exact, case-sensitive hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostName(pub String);

impl HostName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl MatchService for HostName {
    fn match_service(&self, name: &str) -> bool {
        self.0 == name
    }
}

/// Hostname suffix, e.g. `.example.com`. Case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostNameSuffix(pub String);

impl HostNameSuffix {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self(suffix.into())
    }
}

impl MatchService for HostNameSuffix {
    fn match_service(&self, name: &str) -> bool {
        name.ends_with(self.0.as_str())
    }
}

/// Matches if any member matches. An empty set matches nothing.
#[derive(Clone, Default)]
pub struct Hosts(pub Vec<Arc<dyn MatchService>>);

impl Hosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, matcher: impl MatchService + 'static) -> Self {
        self.0.push(Arc::new(matcher));
        self
    }

    pub fn push(&mut self, matcher: Arc<dyn MatchService>) {
        self.0.push(matcher);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl MatchService for Hosts {
    fn match_service(&self, name: &str) -> bool {
        self.0.iter().any(|m| m.match_service(name))
    }
}

impl fmt::Debug for Hosts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hosts").field(&self.0.len()).finish()
    }
}

impl<M: MatchService + ?Sized> MatchService for Arc<M> {
    fn match_service(&self, name: &str) -> bool {
        (**self).match_service(name)
    }
}

/// Parse the matcher syntax used in configuration.
///
/// Entries are comma separated. `*.example.com` and `.example.com` become
/// suffix matches on `.example.com`; anything else is an exact match. A
/// single entry yields that matcher alone, several yield a [`Hosts`] set.
pub fn parse_matcher(spec: &str) -> Option<Arc<dyn MatchService>> {
    let mut hosts: Vec<Arc<dyn MatchService>> = spec
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| -> Arc<dyn MatchService> {
            if let Some(suffix) = entry.strip_prefix('*') {
                Arc::new(HostNameSuffix::new(suffix))
            } else if entry.starts_with('.') {
                Arc::new(HostNameSuffix::new(entry))
            } else {
                Arc::new(HostName::new(entry))
            }
        })
        .collect();

    match hosts.len() {
        0 => None,
        1 => hosts.pop(),
        _ => Some(Arc::new(Hosts(hosts))),
    }
}
