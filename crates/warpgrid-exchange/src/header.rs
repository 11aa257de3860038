use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, Result};

/// An ordered, case-insensitive, multi-valued header collection that can be
/// frozen.
///
/// Response headers are frozen atomically with the response start and
/// trailers are frozen once the exchange finishes. Every mutation of a
/// frozen collection fails with [`Error::InvalidOperation`].
#[derive(Debug, Clone, Default)]
pub struct HeaderDictionary {
    map: HeaderMap,
    read_only: bool,
}

impl HeaderDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: HeaderMap) -> Self {
        Self {
            map,
            read_only: false,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn freeze(&mut self) {
        self.read_only = true;
    }

    /// Get the first value for `name` (case-insensitive) if it is visible ASCII.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get every value for `name` in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.map
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Replace all values of `name` with `value`.
    pub fn insert(&mut self, name: &str, value: &str) -> Result<()> {
        self.ensure_writable()?;
        let (name, value) = parse_pair(name, value)?;
        self.map.insert(name, value);
        Ok(())
    }

    /// Add `value` after any existing values of `name`.
    pub fn append(&mut self, name: &str, value: &str) -> Result<()> {
        self.ensure_writable()?;
        let (name, value) = parse_pair(name, value)?;
        self.map.append(name, value);
        Ok(())
    }

    /// Remove every value of `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        self.ensure_writable()?;
        Ok(self.map.remove(name).is_some())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.map.iter()
    }

    pub fn as_map(&self) -> &HeaderMap {
        &self.map
    }

    pub fn into_map(self) -> HeaderMap {
        self.map
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::invalid_operation(
                "Headers are read-only, response has already started.",
            ));
        }
        Ok(())
    }
}

fn parse_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())?;
    let value = HeaderValue::from_str(value)?;
    Ok((name, value))
}
