use std::iter::FromIterator;

use super::{Bson, Map};

/// An ordered sequence of (key, value) pairs, exactly as laid out on the
/// wire. Preserves insertion/decode order; duplicate keys are permitted on
/// the wire but [`Document::get`] and friends resolve to the first
/// occurrence, per `spec.md` §3.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    inner: Map,
}

impl Document {
    pub fn new() -> Self {
        Document { inner: Map::new() }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts a key/value pair. If the key already exists, its value is
    /// replaced in place (position preserved), matching `IndexMap::insert`
    /// semantics rather than "push a duplicate".
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Bson>) -> Option<Bson> {
        self.inner.insert(key.into(), value.into())
    }

    /// Used exclusively by the decoder, which must preserve "first
    /// occurrence wins" for wire-level duplicate keys rather than
    /// overwriting with the later value.
    pub(crate) fn insert_first_wins(&mut self, key: String, value: Bson) {
        if !self.inner.contains_key(&key) {
            self.inner.insert(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Bson> {
        self.inner.get_mut(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Bson> {
        self.inner.shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.inner.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Bson)> {
        self.inner.iter()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Bson::as_str)
    }

    pub fn get_document(&self, key: &str) -> Option<&Document> {
        self.get(key).and_then(Bson::as_document)
    }

    pub fn get_array(&self, key: &str) -> Option<&[Bson]> {
        self.get(key).and_then(Bson::as_array)
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(Bson::as_i32)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(Bson::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Bson::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Bson::as_bool)
    }

    pub fn get_timestamp(&self, key: &str) -> Option<super::Timestamp> {
        self.get(key).and_then(Bson::as_timestamp)
    }

    pub fn get_datetime(&self, key: &str) -> Option<super::DateTime> {
        self.get(key).and_then(Bson::as_datetime)
    }

    /// True iff every key in `self` is present in `other` with an equal
    /// value. Used by the tag-set filter (`spec.md` §4.5 step 4): a server's
    /// tags must superset a read-preference tag set.
    pub fn is_superset_of(&self, other: &Document) -> bool {
        other.iter().all(|(k, v)| self.get(k) == Some(v))
    }
}

impl FromIterator<(String, Bson)> for Document {
    fn from_iter<T: IntoIterator<Item = (String, Bson)>>(iter: T) -> Self {
        Document {
            inner: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Document {
    type Item = (String, Bson);
    type IntoIter = indexmap::map::IntoIter<String, Bson>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

/// Builds a [`Document`] with a map-literal-like syntax, e.g.
/// `doc! { "hello": 1, "topologyVersion": topology_version }`.
#[macro_export]
macro_rules! doc {
    () => {
        $crate::bson::Document::new()
    };
    ( $( $key:expr => $val:expr ),* $(,)? ) => {{
        #[allow(unused_mut)]
        let mut doc = $crate::bson::Document::new();
        $( doc.insert($key, $val); )*
        doc
    }};
}
