//! Request keys and storage key generation.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Separator between the handle, the request key and the window.
const FIELD_SEPARATOR: char = '|';
/// Separator between the parts of a composite request key.
const PART_SEPARATOR: char = '/';

/// A single scalar in a request key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Str(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Str(s) => f.write_str(s),
            KeyPart::Int(n) => write!(f, "{}", n),
            KeyPart::UInt(n) => write!(f, "{}", n),
            KeyPart::Bool(b) => write!(f, "{}", b),
        }
    }
}

macro_rules! key_part_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for KeyPart {
                fn from(value: $ty) -> Self {
                    KeyPart::$variant(value.into())
                }
            }

            impl From<$ty> for RequestKey {
                fn from(value: $ty) -> Self {
                    RequestKey(vec![KeyPart::from(value)])
                }
            }
        )*
    };
}

key_part_from! {
    String => Str,
    &str => Str,
    i64 => Int,
    i32 => Int,
    u64 => UInt,
    u32 => UInt,
    bool => Bool,
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::Str(value.clone())
    }
}

impl From<usize> for KeyPart {
    fn from(value: usize) -> Self {
        KeyPart::UInt(value as u64)
    }
}

/// The caller-supplied discriminator scoping a counter to one subject
/// (an account id, an IP address, a pair of both...).
///
/// May be empty, a single scalar, or an ordered sequence of scalars. Parts are
/// compared by their rendered text, so `1` and `"1"` address the same
/// counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RequestKey(Vec<KeyPart>);

impl RequestKey {
    /// A request key with no parts: the counter is shared by every caller.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Build a key from any sequence of parts.
    pub fn from_parts<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// Append a part.
    pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    /// The parts of this key, in order.
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Whether this key has no parts.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize into the stable form used inside storage keys.
    ///
    /// Separator characters inside parts are percent-escaped, so distinct
    /// keys never serialize to the same string.
    pub fn serialize(&self) -> String {
        let escaped: Vec<String> = self.0.iter().map(|p| escape(&p.to_string())).collect();
        escaped.join(&PART_SEPARATOR.to_string())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<none>");
        }
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("/"))
    }
}

impl From<()> for RequestKey {
    fn from(_: ()) -> Self {
        RequestKey::none()
    }
}

impl From<&String> for RequestKey {
    fn from(value: &String) -> Self {
        RequestKey(vec![KeyPart::from(value)])
    }
}

impl From<usize> for RequestKey {
    fn from(value: usize) -> Self {
        RequestKey(vec![KeyPart::from(value)])
    }
}

impl From<KeyPart> for RequestKey {
    fn from(part: KeyPart) -> Self {
        RequestKey(vec![part])
    }
}

impl<T: Into<KeyPart>> From<Vec<T>> for RequestKey {
    fn from(parts: Vec<T>) -> Self {
        RequestKey::from_parts(parts)
    }
}

impl<T: Into<KeyPart>, const N: usize> From<[T; N]> for RequestKey {
    fn from(parts: [T; N]) -> Self {
        RequestKey::from_parts(parts)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for RequestKey {
    fn from(part: Option<T>) -> Self {
        part.map(|p| RequestKey(vec![p.into()])).unwrap_or_default()
    }
}

/// Percent-escape the characters that carry structure in a storage key.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '|' => out.push_str("%7C"),
            _ => out.push(c),
        }
    }
    out
}

/// Start of the fixed window containing `now`, in epoch milliseconds.
///
/// Windows are aligned to the epoch, so every process sharing a store agrees
/// on the boundaries as long as their clocks agree.
pub fn window_start_millis(now: DateTime<Utc>, interval: Duration) -> i64 {
    let interval_ms = interval.as_millis().clamp(1, i64::MAX as u128) as i64;
    now.timestamp_millis().div_euclid(interval_ms) * interval_ms
}

/// Build the storage key for a counter.
///
/// Windowed keys end with the window start, so each window lands in a fresh
/// slot. Unwindowed keys (leaky bucket) persist across calls.
pub fn build_key(
    prefix: &str,
    handle: &str,
    key: &RequestKey,
    interval: Duration,
    windowed: bool,
    now: DateTime<Utc>,
) -> String {
    let mut out = format!(
        "{}{}{}{}",
        prefix,
        escape(handle),
        FIELD_SEPARATOR,
        key.serialize()
    );
    if windowed {
        out.push(FIELD_SEPARATOR);
        out.push_str(&window_start_millis(now, interval).to_string());
    }
    out
}
