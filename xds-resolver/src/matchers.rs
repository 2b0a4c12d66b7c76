//! Matching predicates for route selection: hostname/domain patterns,
//! request paths, request headers and fractional (percentage) matches.

use std::collections::HashMap;

use regex::Regex;
use tonic::metadata::{KeyAndValueRef, MetadataMap};

use crate::random::ThreadSafeRandom;
use crate::resource::VirtualHost;

/// Returns whether `host_name` matches the domain `pattern`,
/// case-insensitively.
///
/// Wildcard rules: a single `*` matches any hostname; otherwise at most one
/// `*` is permitted and only in the left-most or right-most position, where
/// it must match one or more characters.
///
/// # Panics
///
/// Panics when either argument is empty or has a leading or trailing `.`;
/// such values are programming errors at the call site.
pub fn match_host_name(host_name: &str, pattern: &str) -> bool {
    assert!(
        !host_name.is_empty() && !host_name.starts_with('.') && !host_name.ends_with('.'),
        "invalid host name: {host_name:?}"
    );
    assert!(
        !pattern.is_empty() && !pattern.starts_with('.') && !pattern.ends_with('.'),
        "invalid pattern/domain name: {pattern:?}"
    );

    let host_name = host_name.to_ascii_lowercase();
    let pattern = pattern.to_ascii_lowercase();

    let Some(index) = pattern.find('*') else {
        // Not a wildcard pattern: the two must match exactly.
        return host_name == pattern;
    };
    if pattern.len() == 1 {
        return true;
    }
    // At most one asterisk, and only at an edge.
    if pattern[index + 1..].contains('*') {
        return false;
    }
    if index != 0 && index != pattern.len() - 1 {
        return false;
    }
    // The asterisk has to match at least one character.
    if host_name.len() < pattern.len() {
        return false;
    }
    if index == 0 {
        return host_name.ends_with(&pattern[1..]);
    }
    host_name.starts_with(&pattern[..pattern.len() - 1])
}

/// Selects the virtual host serving `host_name`.
///
/// Search order: exact domains first, then the longest matching wildcard,
/// with suffix wildcards (`*X`) preferred over prefix wildcards (`X*`) on a
/// length tie. The lone `*` has length one and loses to any longer match.
pub fn find_virtual_host<'a>(
    virtual_hosts: &'a [VirtualHost],
    host_name: &str,
) -> Option<&'a VirtualHost> {
    let mut matching_len: Option<usize> = None;
    let mut target: Option<&VirtualHost> = None;
    for virtual_host in virtual_hosts {
        for domain in virtual_host.domains() {
            if !match_host_name(host_name, domain) {
                continue;
            }
            if !domain.contains('*') {
                return Some(virtual_host);
            }
            let longer = matching_len.map_or(true, |len| domain.len() > len);
            let suffix_tie = matching_len == Some(domain.len()) && domain.starts_with('*');
            if longer || suffix_tie {
                matching_len = Some(domain.len());
                target = Some(virtual_host);
            }
        }
    }
    target
}

/// Matches the full method name of an RPC, e.g. `/HelloService/hi`.
#[derive(Debug, Clone)]
pub enum PathMatcher {
    Path { path: String, case_sensitive: bool },
    Prefix { prefix: String, case_sensitive: bool },
    Regex(Regex),
}

impl PathMatcher {
    pub fn from_path(path: impl Into<String>, case_sensitive: bool) -> Self {
        Self::Path {
            path: path.into(),
            case_sensitive,
        }
    }

    pub fn from_prefix(prefix: impl Into<String>, case_sensitive: bool) -> Self {
        Self::Prefix {
            prefix: prefix.into(),
            case_sensitive,
        }
    }

    /// The regex always matches against the full method name.
    pub fn from_regex(regex: Regex) -> Self {
        Self::Regex(regex)
    }

    pub fn matches(&self, full_method_name: &str) -> bool {
        match self {
            Self::Path {
                path,
                case_sensitive: true,
            } => path == full_method_name,
            Self::Path {
                path,
                case_sensitive: false,
            } => path.eq_ignore_ascii_case(full_method_name),
            Self::Prefix {
                prefix,
                case_sensitive: true,
            } => full_method_name.starts_with(prefix),
            Self::Prefix {
                prefix,
                case_sensitive: false,
            } => full_method_name
                .to_ascii_lowercase()
                .starts_with(&prefix.to_ascii_lowercase()),
            Self::Regex(regex) => full_match(regex, full_method_name),
        }
    }
}

/// Matches one request header against the indexed ASCII headers.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    name: String,
    kind: HeaderMatchKind,
    inverted: bool,
}

#[derive(Debug, Clone)]
pub enum HeaderMatchKind {
    /// Matches on presence (or absence, when the flag is false).
    Present(bool),
    Exact(String),
    /// Full match against the joined header value.
    SafeRegex(Regex),
    /// Inclusive range over the value parsed as a signed decimal integer.
    Range { start: i64, end: i64 },
    Prefix(String),
    Suffix(String),
}

impl HeaderMatcher {
    pub fn for_present(name: impl Into<String>, present: bool, inverted: bool) -> Self {
        Self::new(name, HeaderMatchKind::Present(present), inverted)
    }

    pub fn for_exact_value(name: impl Into<String>, value: impl Into<String>, inverted: bool) -> Self {
        Self::new(name, HeaderMatchKind::Exact(value.into()), inverted)
    }

    pub fn for_safe_regex(name: impl Into<String>, regex: Regex, inverted: bool) -> Self {
        Self::new(name, HeaderMatchKind::SafeRegex(regex), inverted)
    }

    pub fn for_range(name: impl Into<String>, start: i64, end: i64, inverted: bool) -> Self {
        Self::new(name, HeaderMatchKind::Range { start, end }, inverted)
    }

    pub fn for_prefix(name: impl Into<String>, prefix: impl Into<String>, inverted: bool) -> Self {
        Self::new(name, HeaderMatchKind::Prefix(prefix.into()), inverted)
    }

    pub fn for_suffix(name: impl Into<String>, suffix: impl Into<String>, inverted: bool) -> Self {
        Self::new(name, HeaderMatchKind::Suffix(suffix.into()), inverted)
    }

    fn new(name: impl Into<String>, kind: HeaderMatchKind, inverted: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            inverted,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Applies the matcher to the (joined) value of the named header, or
    /// `None` when the header is absent.
    pub fn matches(&self, value: Option<&str>) -> bool {
        if let HeaderMatchKind::Present(present) = self.kind {
            return value.is_none() == (present == self.inverted);
        }
        let Some(value) = value else {
            return false;
        };
        let base_match = match &self.kind {
            HeaderMatchKind::Present(_) => unreachable!("handled above"),
            HeaderMatchKind::Exact(expected) => expected == value,
            HeaderMatchKind::SafeRegex(regex) => full_match(regex, value),
            HeaderMatchKind::Range { start, end } => value
                .parse::<i64>()
                .map(|parsed| parsed >= *start && parsed <= *end)
                .unwrap_or(false),
            HeaderMatchKind::Prefix(prefix) => value.starts_with(prefix),
            HeaderMatchKind::Suffix(suffix) => value.ends_with(suffix),
        };
        base_match != self.inverted
    }
}

/// Admits a uniform fraction of RPCs: a draw in `[0, denominator)` below
/// `numerator` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FractionMatcher {
    numerator: u32,
    denominator: u32,
}

impl FractionMatcher {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub fn matches(&self, random: &dyn ThreadSafeRandom) -> bool {
        random.next_below(self.denominator) < self.numerator
    }
}

/// Indexes ASCII request metadata by header name, joining repeated values
/// with `,` in insertion order. Binary entries are skipped, and the
/// synthetic `content-type` gRPC implies on the wire is injected.
pub(crate) fn index_ascii_headers(metadata: &MetadataMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for entry in metadata.iter() {
        if let KeyAndValueRef::Ascii(key, value) = entry {
            let Ok(value) = value.to_str() else { continue };
            headers
                .entry(key.as_str().to_string())
                .and_modify(|joined: &mut String| {
                    joined.push(',');
                    joined.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
    }
    headers.insert("content-type".to_string(), "application/grpc".to_string());
    headers
}

fn full_match(regex: &Regex, input: &str) -> bool {
    regex
        .find(input)
        .is_some_and(|m| m.start() == 0 && m.end() == input.len())
}
