//! Ordered HTTP header list
//!
//! Lookups are case-insensitive while the original casing and insertion
//! order are kept for emission.

use serde::{Deserialize, Serialize};

/// Header collection used by every request/response object in the context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Create an empty header list
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of header lines
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for `name`, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// All values for `name` in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Whether a header named `name` exists
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with a single value.
    ///
    /// The first existing line keeps its position and casing; later
    /// duplicates are dropped. Absent headers are appended.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(index) => {
                self.entries[index].1 = value;
                let mut seen = 0usize;
                self.entries.retain(|(key, _)| {
                    if key.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// Append a header line without touching existing ones
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Remove every line named `name`
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// Drop all headers
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate `(name, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_but_emission_keeps_it() {
        let mut headers = Headers::new();
        headers.append("X-Forwarded-For", "10.0.0.1");
        headers.append("Content-Type", "text/html");

        assert_eq!(headers.get("x-forwarded-for"), Some("10.0.0.1"));
        let names: Vec<&str> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["X-Forwarded-For", "Content-Type"]);
    }

    #[test]
    fn set_collapses_duplicates_in_place() {
        let mut headers: Headers = vec![
            ("Via", "a"),
            ("Accept", "*/*"),
            ("via", "b"),
        ]
        .into_iter()
        .collect();

        headers.set("VIA", "c");

        let lines: Vec<(&str, &str)> = headers.iter().collect();
        assert_eq!(lines, vec![("Via", "c"), ("Accept", "*/*")]);
    }

    #[test]
    fn remove_drops_all_matching_lines() {
        let mut headers: Headers = vec![("Cookie", "a=1"), ("cookie", "b=2")].into_iter().collect();
        assert!(headers.remove("COOKIE"));
        assert!(headers.is_empty());
        assert!(!headers.remove("cookie"));
    }
}
