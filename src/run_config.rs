//! Run configuration distributed by RunControl with `INIT` and `CONFIG`.
//!
//! The text is a TOML document. Each role reads the table named after its
//! role and name, with scalar keys of the role table acting as defaults:
//!
//! ```toml
//! [Producer]
//! EventRate = 100        # default for every Producer
//!
//! [Producer.tel1]
//! EventRate = 250        # only for the Producer named tel1
//!
//! [DataCollector.dc]
//! SyncAlgorithm = "index"
//! FileType = "memory"
//! ```

use crate::error::AppResult;
use serde::de::DeserializeOwned;
use toml::{Table, Value};

/// Parsed run configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    text: String,
    table: Table,
}

impl Configuration {
    /// Parses configuration text; empty text is an empty configuration.
    pub fn parse(text: &str) -> AppResult<Self> {
        let table = if text.trim().is_empty() {
            Table::new()
        } else {
            text.parse::<Table>()?
        };
        Ok(Self {
            text: text.to_string(),
            table,
        })
    }

    /// Original text, as sent over the wire.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Section for `role.name`.
    pub fn section(&self, role: &str, name: &str) -> ConfigSection {
        let mut merged = Table::new();
        if let Some(Value::Table(role_table)) = self.table.get(role) {
            for (key, value) in role_table {
                if !value.is_table() {
                    merged.insert(key.clone(), value.clone());
                }
            }
            if let Some(Value::Table(own)) = role_table.get(name) {
                for (key, value) in own {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        ConfigSection {
            role: role.to_string(),
            name: name.to_string(),
            table: merged,
        }
    }
}

/// Configuration keys visible to one role instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigSection {
    role: String,
    name: String,
    table: Table,
}

impl ConfigSection {
    /// Typed lookup with a fallback for missing or mistyped keys.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.table
            .get(key)
            .and_then(|value| value.clone().try_into().ok())
            .unwrap_or(default)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    /// Whether the section has no keys.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// `role.name` this section was resolved for.
    pub fn label(&self) -> String {
        format!("{}.{}", self.role, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = r#"
        [Producer]
        EventRate = 100
        Mode = "sim"

        [Producer.tel1]
        EventRate = 250

        [DataCollector.dc]
        SyncAlgorithm = "trigger"
    "#;

    #[test]
    fn test_section_merges_role_defaults() {
        let config = Configuration::parse(TEXT).unwrap();
        let tel1 = config.section("Producer", "tel1");
        assert_eq!(tel1.get("EventRate", 0u32), 250);
        assert_eq!(tel1.get("Mode", String::new()), "sim");

        let other = config.section("Producer", "other");
        assert_eq!(other.get("EventRate", 0u32), 100);
        assert!(!other.contains("tel1"));
    }

    #[test]
    fn test_missing_section_uses_defaults() {
        let config = Configuration::parse(TEXT).unwrap();
        let section = config.section("LogCollector", "log");
        assert!(section.is_empty());
        assert_eq!(section.get("Anything", 7i64), 7);
        assert_eq!(section.label(), "LogCollector.log");
    }

    #[test]
    fn test_mistyped_value_falls_back() {
        let config = Configuration::parse(TEXT).unwrap();
        let dc = config.section("DataCollector", "dc");
        assert_eq!(dc.get("SyncAlgorithm", 3u32), 3);
        assert_eq!(dc.get("SyncAlgorithm", String::new()), "trigger");
    }

    #[test]
    fn test_empty_and_invalid_text() {
        assert!(Configuration::parse("").unwrap().section("A", "b").is_empty());
        assert!(Configuration::parse("[[[").is_err());
    }
}
