//! Process-wide string interning.
//!
//! Interned strings are copyable handles into a table that lives for the
//! whole process. Two handles compare equal iff their contents are equal,
//! and the comparison itself is a single pointer compare. Ordering is by
//! table address: meaningless across runs, stable within one.

use fxhash::FxHashSet;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use serde::de::{Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

lazy_static! {
    static ref TABLE: Mutex<FxHashSet<&'static str>> = Mutex::new(FxHashSet::default());
}

/// Handle to a string inside the process-wide intern table.
#[derive(Clone, Copy)]
pub struct InternedString(&'static str);

/// Interns `value`, returning the canonical handle for its contents.
/// O(len) on first sight, a hash lookup afterwards. Entries are never freed.
pub fn intern(value: &str) -> InternedString {
    let mut table = TABLE.lock();
    if let Some(existing) = table.get(value) {
        return InternedString(existing);
    }

    let stored: &'static str = Box::leak(value.to_owned().into_boxed_str());
    table.insert(stored);
    InternedString(stored)
}

impl InternedString {
    pub fn new(value: &str) -> InternedString {
        intern(value)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0.is_empty()
    }

    fn address(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl PartialEq for InternedString {
    fn eq(&self, other: &InternedString) -> bool {
        self.address() == other.address()
    }
}

impl Eq for InternedString {}

impl Hash for InternedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.address());
    }
}

impl PartialOrd for InternedString {
    fn partial_cmp(&self, other: &InternedString) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedString {
    fn cmp(&self, other: &InternedString) -> Ordering {
        self.address().cmp(&other.address())
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl From<&str> for InternedString {
    fn from(value: &str) -> InternedString {
        intern(value)
    }
}

// Serialized by content so on-disk structures survive across runs.
impl Serialize for InternedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.0)
    }
}

struct InternedStringVisitor;

impl<'de> Visitor<'de> for InternedStringVisitor {
    type Value = InternedString;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string")
    }

    fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<InternedString, E> {
        Ok(intern(value))
    }
}

impl<'de> Deserialize<'de> for InternedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<InternedString, D::Error> {
        deserializer.deserialize_str(InternedStringVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity() {
        let a = intern("kiln.intern.identity");
        let b = intern(&"kiln.intern.identity".to_owned());
        let c = intern("kiln.intern.other");
        assert_eq!(a, b);
        assert_eq!(a.as_str().as_ptr(), b.as_str().as_ptr());
        assert_ne!(a, c);
    }

    #[test]
    fn ordering_is_stable() {
        let a = intern("kiln.intern.order.a");
        let b = intern("kiln.intern.order.b");
        let first = a.cmp(&b);
        assert_eq!(first, intern("kiln.intern.order.a").cmp(&intern("kiln.intern.order.b")));
    }

    #[test]
    fn serde_round_trip() {
        let value = intern("kiln.intern.serde");
        let encoded = serde_json::to_string(&value).unwrap();
        let decoded: InternedString = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value, decoded);
    }
}
