//! The `davmail.*` settings store.
//!
//! A flat, string-keyed key/value space loaded once at startup from a
//! Java-properties-style file and read-only afterwards, so readers share it
//! as `Arc<Settings>` without locking.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use log::warn;

#[derive(Debug, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn load(path: &Path) -> io::Result<Settings> {
        let text = std::fs::read_to_string(path)?;
        Ok(Settings::parse(&text))
    }

    pub fn parse(text: &str) -> Settings {
        let mut values = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            match line.split_once('=') {
                Some((key, value)) => {
                    values.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => warn!("ignoring malformed settings line: {}", line),
            }
        }
        Settings { values }
    }

    /// Build a settings store from explicit pairs; used by tests.
    pub fn from_pairs<I, K, V>(pairs: I) -> Settings
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Settings {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self.values.get(key) {
            Some(v) if !v.is_empty() => Some(v),
            _ => None,
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get(key).map(|v| v.eq_ignore_ascii_case("true")).unwrap_or(false)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(v) => v.parse().unwrap_or_else(|_| {
                warn!("invalid integer for {}: {}", key, v);
                default
            }),
            None => default,
        }
    }

    /// Configured port, with `0` or absent falling back to the
    /// per-protocol default.
    pub fn get_port(&self, key: &str, default: u16) -> u16 {
        match self.get_int(key, 0) {
            0 => default,
            port if port > 0 && port <= i64::from(u16::MAX) => port as u16,
            port => {
                warn!("invalid port for {}: {}", key, port);
                default
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_properties() {
        let settings = Settings::parse(
            "# comment\n\
             davmail.url=http://exchange.example.net/exchange/\n\
             davmail.ldapPort = 1389\n\
             davmail.allowRemote=true\n\
             broken line\n\
             davmail.empty=\n",
        );
        assert_eq!(
            settings.get("davmail.url"),
            Some("http://exchange.example.net/exchange/")
        );
        assert_eq!(settings.get_port("davmail.ldapPort", 389), 1389);
        assert!(settings.get_bool("davmail.allowRemote"));
        assert_eq!(settings.get("davmail.empty"), None);
        assert_eq!(settings.get("davmail.missing"), None);
    }

    #[test]
    fn port_fallback() {
        let settings = Settings::from_pairs([("davmail.ldapPort", "0")]);
        assert_eq!(settings.get_port("davmail.ldapPort", 1389), 1389);
        assert_eq!(settings.get_port("davmail.popPort", 1110), 1110);
    }
}
