//! Segment-wise request dispatcher.
//!
//! Patterns are `/`-separated; `*` matches exactly one non-empty segment.
//! The literal first segment of every registered pattern is reserved, so
//! `GET /*` never captures `/u` or `/account`. When several patterns match,
//! the one with the most literal segments wins.

use axum::http::Method;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

#[derive(Debug, Clone)]
struct Route<T> {
    method: Method,
    segments: Vec<Segment>,
    endpoint: T,
}

impl<T> Route<T> {
    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }
}

/// A resolved request: the endpoint plus the segments its wildcards captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match<'p, T> {
    pub endpoint: T,
    pub params: Vec<&'p str>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher<T> {
    routes: Vec<Route<T>>,
    reserved: HashSet<String>,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            reserved: HashSet::new(),
        }
    }
}

fn split(path: &str) -> Vec<&str> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

impl<T: Copy> Dispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method pattern`.
    pub fn route(mut self, method: Method, pattern: &str, endpoint: T) -> Self {
        let segments: Vec<Segment> = split(pattern)
            .into_iter()
            .map(|s| match s {
                "*" => Segment::Wildcard,
                literal => Segment::Literal(literal.to_string()),
            })
            .collect();

        if let Some(Segment::Literal(first)) = segments.first() {
            self.reserved.insert(first.clone());
        }
        self.routes.push(Route {
            method,
            segments,
            endpoint,
        });
        self
    }

    /// Keep `segment` out of root-level wildcard matches.
    pub fn reserve(mut self, segment: &str) -> Self {
        self.reserved.insert(segment.trim_matches('/').to_string());
        self
    }

    pub fn is_reserved(&self, segment: &str) -> bool {
        self.reserved.contains(segment)
    }

    pub fn resolve<'p>(&self, method: &Method, path: &'p str) -> Option<Match<'p, T>> {
        let parts = split(path);
        let mut best: Option<(&Route<T>, usize)> = None;

        for route in &self.routes {
            if &route.method != method || route.segments.len() != parts.len() {
                continue;
            }
            if !self.segments_match(route, &parts) {
                continue;
            }
            let literals = route.literal_count();
            if best.is_none_or(|(_, current)| literals > current) {
                best = Some((route, literals));
            }
        }

        best.map(|(route, _)| Match {
            endpoint: route.endpoint,
            params: route
                .segments
                .iter()
                .zip(&parts)
                .filter(|(segment, _)| **segment == Segment::Wildcard)
                .map(|(_, part)| *part)
                .collect(),
        })
    }

    fn segments_match(&self, route: &Route<T>, parts: &[&str]) -> bool {
        for (position, (segment, part)) in route.segments.iter().zip(parts).enumerate() {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return false,
                Segment::Wildcard if part.is_empty() => return false,
                Segment::Wildcard if position == 0 && self.reserved.contains(*part) => return false,
                Segment::Wildcard => {}
            }
        }
        true
    }
}
