//! The `baggage` header, as a list of key/value members.
//!
//! The identity exchange uses a single member (key [`PEER_IDENTITY`]) to carry
//! a workload identity between proxies. Other members belong to other
//! subsystems and must keep flowing, so reads and removals here operate on
//! individual members, never on the whole header.

use core::fmt;
use core::ops;

use bytes::Bytes;
use nom::character::complete::char;
use nom::combinator::{map, opt, rest};
use nom::sequence::{pair, preceded, separated_pair};
use nom::IResult;
use thiserror::Error;

use super::parser::{is_baggage_octet, is_token, key, octets, strip_whitespace, NoTail as _};

/// The `baggage` header.
pub const BAGGAGE: http::HeaderName = http::HeaderName::from_static("baggage");

/// The baggage member key carrying a peer identity payload.
pub const PEER_IDENTITY: &str = "peer-identity";

fn member<'v>() -> impl FnMut(&'v [u8]) -> IResult<&'v [u8], Member> {
    map(
        pair(
            separated_pair(strip_whitespace(key()), char('='), strip_whitespace(octets())),
            opt(preceded(char(';'), rest)),
        ),
        |((key, value), properties)| {
            Member(MemberInner::Pair {
                key,
                value,
                properties: properties.map(Bytes::copy_from_slice),
            })
        },
    )
}

/// A single member of a `baggage` header.
///
/// Members that do not parse as `key=value` pairs are held raw, so a
/// malformed member survives the removal of its neighbors unchanged.
#[derive(Clone, PartialEq, Eq)]
pub struct Member(MemberInner);

#[derive(Clone, PartialEq, Eq)]
enum MemberInner {
    Pair {
        key: Bytes,
        value: Bytes,
        properties: Option<Bytes>,
    },
    Raw(Bytes),
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            MemberInner::Pair {
                key,
                value,
                properties,
            } => f
                .debug_struct("Member::Pair")
                .field("key", &String::from_utf8_lossy(key))
                .field("value", &String::from_utf8_lossy(value))
                .field("properties", &properties.as_deref().map(String::from_utf8_lossy))
                .finish(),
            MemberInner::Raw(raw) => f
                .debug_tuple("Member::Raw")
                .field(&String::from_utf8_lossy(raw))
                .finish(),
        }
    }
}

impl Member {
    /// Create a `key=value` member, validating both against the baggage
    /// grammar.
    pub fn new(key: &str, value: impl Into<Bytes>) -> Result<Self, InvalidMember> {
        if key.is_empty() || !key.bytes().all(is_token) {
            return Err(InvalidMember::Key(key.to_string()));
        }

        let value = value.into();
        if !value.iter().all(|&c| is_baggage_octet(c)) {
            return Err(InvalidMember::Value);
        }

        Ok(Self(MemberInner::Pair {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value,
            properties: None,
        }))
    }

    /// Parse a member from one comma-delimited segment of a header value.
    ///
    /// Segments that do not match the grammar are preserved raw.
    pub fn parse(segment: &[u8]) -> Self {
        member()(segment)
            .no_tail()
            .unwrap_or_else(|_| Self(MemberInner::Raw(Bytes::copy_from_slice(segment))))
    }

    /// The member key, if this member parsed as a pair.
    pub fn key(&self) -> Option<&[u8]> {
        match &self.0 {
            MemberInner::Pair { key, .. } => Some(key),
            MemberInner::Raw(_) => None,
        }
    }

    /// The member value, if this member parsed as a pair.
    pub fn value(&self) -> Option<&[u8]> {
        match &self.0 {
            MemberInner::Pair { value, .. } => Some(value),
            MemberInner::Raw(_) => None,
        }
    }

    /// Whether this member is a pair with the given key.
    ///
    /// Baggage keys are case sensitive.
    pub fn is(&self, key: &str) -> bool {
        self.key().is_some_and(|k| k == key.as_bytes())
    }

    /// Render the member as wire bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        match self.0 {
            MemberInner::Pair {
                key,
                value,
                properties,
            } => {
                let mut bytes = Vec::with_capacity(
                    key.len() + 1 + value.len() + properties.as_ref().map_or(0, |p| p.len() + 1),
                );
                bytes.extend_from_slice(&key);
                bytes.push(b'=');
                bytes.extend_from_slice(&value);
                if let Some(properties) = properties {
                    bytes.push(b';');
                    bytes.extend_from_slice(&properties);
                }
                bytes
            }
            MemberInner::Raw(raw) => raw.to_vec(),
        }
    }
}

/// The members of one or more `baggage` header values.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemberList {
    members: Vec<Member>,
}

impl MemberList {
    /// Parse the members of a single header value.
    pub fn from_value(value: &http::HeaderValue) -> Self {
        let members = value
            .as_bytes()
            .split(|&c| c == b',')
            .map(|segment| segment.trim_ascii())
            .filter(|segment| !segment.is_empty())
            .map(Member::parse)
            .collect();

        Self { members }
    }

    /// Collect the members of every `baggage` header in the map.
    pub fn from_headers(headers: &http::HeaderMap) -> Self {
        let mut members = Vec::new();
        for value in headers.get_all(BAGGAGE) {
            members.extend(Self::from_value(value).members);
        }

        Self { members }
    }

    /// The value of the first member with the given key.
    pub fn find(&self, key: &str) -> Option<&[u8]> {
        self.members.iter().find(|m| m.is(key)).and_then(Member::value)
    }

    /// Remove every member with the given key, reporting whether any were
    /// removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| !m.is(key));
        self.members.len() != before
    }

    /// Append a member to the list.
    pub fn push(&mut self, member: Member) {
        self.members.push(member);
    }

    /// Render the list as a header value, or `None` when the list is empty.
    pub fn into_header_value(self) -> Option<http::HeaderValue> {
        if self.members.is_empty() {
            return None;
        }

        let bytes = self
            .members
            .into_iter()
            .map(Member::into_bytes)
            .collect::<Vec<_>>()
            .join(&b", "[..]);

        Some(
            http::HeaderValue::from_bytes(&bytes)
                .expect("baggage members must contain valid header bytes"),
        )
    }
}

impl ops::Deref for MemberList {
    type Target = [Member];

    fn deref(&self) -> &Self::Target {
        &self.members
    }
}

impl FromIterator<Member> for MemberList {
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = Member>,
    {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

/// Look up a member value across every `baggage` header in the map.
pub fn find_member(headers: &http::HeaderMap, key: &str) -> Option<Bytes> {
    for value in headers.get_all(BAGGAGE) {
        let list = MemberList::from_value(value);
        if let Some(found) = list.find(key) {
            return Some(Bytes::copy_from_slice(found));
        }
    }

    None
}

/// Remove a member from every `baggage` header in the map.
///
/// Headers left with no members are dropped entirely; headers that never
/// carried the member pass through byte for byte.
pub fn strip_member(headers: &mut http::HeaderMap, key: &str) {
    if !headers.contains_key(BAGGAGE) {
        return;
    }

    let values = headers.get_all(BAGGAGE).iter().cloned().collect::<Vec<_>>();
    headers.remove(BAGGAGE);

    for value in values {
        let mut list = MemberList::from_value(&value);
        if list.remove(key) {
            if let Some(rebuilt) = list.into_header_value() {
                headers.append(BAGGAGE, rebuilt);
            }
        } else {
            headers.append(BAGGAGE, value);
        }
    }
}

/// Render a single member as a complete `baggage` header value.
pub fn member_value(key: &str, value: impl Into<Bytes>) -> Result<http::HeaderValue, InvalidMember> {
    let member = Member::new(key, value)?;
    Ok(http::HeaderValue::from_bytes(&member.into_bytes())
        .expect("a validated member contains valid header bytes"))
}

/// Error for a baggage member that cannot be represented on the wire.
#[derive(Debug, Error)]
pub enum InvalidMember {
    /// The key contains characters outside the token alphabet.
    #[error("invalid baggage key: {0}")]
    Key(String),

    /// The value contains bytes outside the baggage value alphabet.
    #[error("invalid baggage value")]
    Value,
}
