// src/status.rs
//! Connection outcomes for crawled hosts and the status map drivers return.

use std::collections::HashMap;
use std::fmt;
use std::io;

/// Connection status of a domain node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainStatus {
    #[default]
    Unknown,
    Good,
    Timeout,
    NoHost,
    Refused,
    Error,
    Redirect,
    /// Discovered through a Certificate Transparency source, never dialed.
    Ct,
    /// Aggregated result of several drivers.
    Multi,
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainStatus::Unknown => "Unknown",
            DomainStatus::Good => "Good",
            DomainStatus::Timeout => "Timeout",
            DomainStatus::NoHost => "No Host",
            DomainStatus::Refused => "Refused",
            DomainStatus::Error => "Error",
            DomainStatus::Redirect => "Redirect",
            DomainStatus::Ct => "CT",
            DomainStatus::Multi => "MULTI",
        };
        f.write_str(s)
    }
}

/// A [`DomainStatus`] plus optional metadata, e.g. the redirect target or the
/// MX hosts behind an SMTP query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Status {
    pub status: DomainStatus,
    pub meta: String,
}

impl Status {
    pub fn new(status: DomainStatus) -> Self {
        Status {
            status,
            meta: String::new(),
        }
    }

    pub fn with_meta(status: DomainStatus, meta: impl Into<String>) -> Self {
        Status {
            status,
            meta: meta.into(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.meta.is_empty() {
            write!(f, "{}", self.status)
        } else {
            write!(f, "{}({})", self.status, self.meta)
        }
    }
}

/// Map of domain name to [`Status`]. Collisions overwrite.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusMap(HashMap<String, Status>);

impl StatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding a single entry.
    pub fn single(domain: impl Into<String>, status: Status) -> Self {
        let mut m = Self::new();
        m.set(domain, status);
        m
    }

    pub fn set(&mut self, domain: impl Into<String>, status: Status) {
        self.0.insert(domain.into(), status);
    }

    pub fn get(&self, domain: &str) -> Option<&Status> {
        self.0.get(domain)
    }

    pub fn remove(&mut self, domain: &str) -> Option<Status> {
        self.0.remove(domain)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.0.contains_key(domain)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Status)> {
        self.0.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (String, Status)> + '_ {
        self.0.drain()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Categorize a network error into a [`DomainStatus`].
///
/// `None` means the operation succeeded.
pub fn classify_net_error(err: Option<&io::Error>) -> DomainStatus {
    let Some(err) = err else {
        return DomainStatus::Good;
    };
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => DomainStatus::Timeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => DomainStatus::Refused,
        io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => DomainStatus::NoHost,
        // getaddrinfo failures surface as Other with a lookup message
        _ if err.to_string().contains("lookup") => DomainStatus::NoHost,
        _ => DomainStatus::Error,
    }
}
