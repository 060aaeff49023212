//! Key composition for namespaced key-value backends.
//!
//! Keys have the shape `{prefix}{delimiter}{category}{delimiter}{entry}`.

pub const DEFAULT_DELIMITER: &str = ":";

/// Namespace used to compose and parse backend keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
    delimiter: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>, delimiter: impl Into<String>) -> Self {
        let delimiter = delimiter.into();
        Self {
            prefix: prefix.into(),
            delimiter: if delimiter.is_empty() {
                DEFAULT_DELIMITER.to_string()
            } else {
                delimiter
            },
        }
    }

    pub fn delimiter(&self) -> &str {
        &self.delimiter
    }

    /// Full key for one record.
    pub fn record_key(&self, category: &str, entry: &str) -> String {
        let d = &self.delimiter;
        format!("{}{d}{category}{d}{entry}", self.prefix)
    }

    /// Glob pattern matching every record key in this namespace.
    pub fn all_pattern(&self) -> String {
        format!("{}{}*", self.prefix, self.delimiter)
    }

    /// Glob pattern matching every record key in one category.
    pub fn category_pattern(&self, category: &str) -> String {
        let d = &self.delimiter;
        format!("{}{d}{category}{d}*", self.prefix)
    }

    /// Split a backend key into `(category, entry)`.
    ///
    /// Returns `None` for keys outside the namespace or missing either segment.
    pub fn parse<'k>(&self, key: &'k str) -> Option<(&'k str, &'k str)> {
        let rest = key
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(self.delimiter.as_str())?;
        let (category, entry) = rest.split_once(self.delimiter.as_str())?;
        if category.is_empty() || entry.is_empty() {
            return None;
        }
        Some((category, entry))
    }
}
