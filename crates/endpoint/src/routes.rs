//! Destination routing table
//!
//! A destination string is either a bare `host:port`, or a comma separated list of
//! `path/host:port` peers used by the multiplexed tunnel to pick a destination
//! per path.

use crate::common::{Result, TunnelError};
use std::collections::HashSet;
use std::fmt;

const LIST_SEPARATOR: char = ',';
const PATH_SEPARATOR: char = '/';

/// One route: an optional path and the address it forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Path the route is served at; `None` for the single unnamed route
    pub path: Option<String>,
    /// Destination `host:port`
    pub destination: String,
}

impl RouteEntry {
    /// Path the route is registered at, falling back to `default_path`
    pub fn effective_path<'a>(&'a self, default_path: &'a str) -> &'a str {
        self.path.as_deref().unwrap_or(default_path)
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{path}{PATH_SEPARATOR}{}", self.destination),
            None => f.write_str(&self.destination),
        }
    }
}

/// Parsed routes, in declaration order
///
/// Either a single unnamed entry, or one or more entries each with a distinct
/// non-empty path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    /// Parse a destination string
    ///
    /// # Errors
    ///
    /// [`TunnelError::InvalidRouteSpec`] for empty input, a peer without a path
    /// separator, or an empty path or destination; [`TunnelError::DuplicatePath`]
    /// when two peers share a path.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.is_empty() {
            return Err(TunnelError::InvalidRouteSpec(spec.to_string()));
        }

        if !spec.contains([LIST_SEPARATOR, PATH_SEPARATOR]) {
            return Ok(Self {
                entries: vec![RouteEntry {
                    path: None,
                    destination: spec.to_string(),
                }],
            });
        }

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for peer in spec.split(LIST_SEPARATOR) {
            let entry = parse_peer(peer)?;
            if let Some(path) = &entry.path {
                if !seen.insert(path.clone()) {
                    return Err(TunnelError::DuplicatePath(path.clone()));
                }
            }
            entries.push(entry);
        }

        Ok(Self { entries })
    }

    /// Entries in the order they were declared
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Never true for a parsed table
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the table is a single route without a path
    pub fn is_single_unnamed(&self) -> bool {
        matches!(self.entries.as_slice(), [RouteEntry { path: None, .. }])
    }

    /// `(effective path, destination)` pairs in declaration order
    pub fn resolved<'a>(
        &'a self,
        default_path: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.entries
            .iter()
            .map(move |entry| (entry.effective_path(default_path), entry.destination.as_str()))
    }
}

impl<'a> IntoIterator for &'a RouteTable {
    type Item = &'a RouteEntry;
    type IntoIter = std::slice::Iter<'a, RouteEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn parse_peer(peer: &str) -> Result<RouteEntry> {
    let (path, destination) = peer
        .split_once(PATH_SEPARATOR)
        .ok_or_else(|| TunnelError::InvalidRouteSpec(peer.to_string()))?;

    if path.is_empty() || destination.is_empty() {
        return Err(TunnelError::InvalidRouteSpec(peer.to_string()));
    }

    Ok(RouteEntry {
        path: Some(path.to_string()),
        destination: destination.to_string(),
    })
}
