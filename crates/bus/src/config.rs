//! Hand-rolled INI-like config reader: `[Section]` headers, `key=value`
//! lines, `#`/`;` comments and blank lines skipped. No ecosystem INI crate
//! appears anywhere in the retrieved corpus, so this is written directly
//! rather than reached for.

use std::{collections::HashMap, fs, io, path::Path};

use bus_core::DuplexMode;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Controller,
    Segment,
    Proxy,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("malformed line {line}: {text:?}")]
    MalformedLine { line: usize, text: String },
    #[error("missing `role` key (one of controller, segment, proxy)")]
    MissingRole,
    #[error("unknown role {0:?}")]
    UnknownRole(String),
    #[error("unknown mode {0:?} (expected half or full)")]
    UnknownMode(String),
    #[error("at least one `bind` address is required")]
    MissingBind,
    #[error("at least one `backend` address is required")]
    MissingBackend,
    #[error("bad address {0:?}")]
    BadAddress(String),
}

pub struct Config {
    pub role: Role,
    pub mode: DuplexMode,
    pub bind: Vec<String>,
    pub backend: Vec<String>,
    pub ttl_default_secs: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, Vec<(String, String)>> = HashMap::new();
        let mut current = String::from("default");
        sections.entry(current.clone()).or_default();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                current = section.trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine { line: lineno + 1, text: raw.to_string() });
            };
            sections.get_mut(&current).unwrap().push((key.trim().to_string(), value.trim().to_string()));
        }

        let entries: Vec<(String, String)> = sections.into_values().flatten().collect();
        let get = |key: &str| entries.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        let get_all = |key: &str| -> Vec<String> {
            entries.iter().filter(|(k, _)| k == key).map(|(_, v)| v.clone()).collect()
        };

        let role = match get("role").ok_or(ConfigError::MissingRole)?.to_lowercase().as_str() {
            "controller" => Role::Controller,
            "segment" => Role::Segment,
            "proxy" => Role::Proxy,
            other => return Err(ConfigError::UnknownRole(other.to_string())),
        };

        let mode = match get("mode").unwrap_or_else(|| "half".to_string()).to_lowercase().as_str() {
            "half" => DuplexMode::Half,
            "full" => DuplexMode::Full,
            other => return Err(ConfigError::UnknownMode(other.to_string())),
        };

        let bind = get_all("bind");
        if bind.is_empty() {
            return Err(ConfigError::MissingBind);
        }
        let backend = get_all("backend");
        if backend.is_empty() {
            return Err(ConfigError::MissingBackend);
        }
        for addr in bind.iter().chain(backend.iter()) {
            validate_address(addr)?;
        }

        let ttl_default_secs = get("ttl_default_seconds").and_then(|v| v.parse().ok()).unwrap_or(30);

        Ok(Self { role, mode, bind, backend, ttl_default_secs })
    }
}

fn validate_address(addr: &str) -> Result<(), ConfigError> {
    if addr.starts_with("unix://") || addr.starts_with("tcp://") {
        Ok(())
    } else if addr.contains("://") {
        Ok(()) // opaque scheme, passed through to the resolver
    } else {
        Err(ConfigError::BadAddress(addr.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_controller_config() {
        let text = "\
role=controller
mode=half
bind=unix:///tmp/c.sock
backend=tcp://127.0.0.1:5555
ttl_default_seconds=60
";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.role, Role::Controller);
        assert_eq!(config.mode, DuplexMode::Half);
        assert_eq!(config.bind, vec!["unix:///tmp/c.sock"]);
        assert_eq!(config.backend, vec!["tcp://127.0.0.1:5555"]);
        assert_eq!(config.ttl_default_secs, 60);
    }

    #[test]
    fn multiple_backends_accumulate() {
        let text = "\
role=controller
bind=unix:///tmp/c.sock
backend=tcp://127.0.0.1:5555
backend=tcp://127.0.0.1:5556
";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.backend.len(), 2);
    }

    #[test]
    fn missing_role_is_an_error() {
        let text = "bind=unix:///tmp/c.sock\nbackend=tcp://127.0.0.1:1\n";
        assert!(matches!(Config::parse(text), Err(ConfigError::MissingRole)));
    }

    #[test]
    fn comments_and_sections_are_ignored() {
        let text = "\
; a comment
[Cloudbus]
# another comment
role=segment
bind=tcp://127.0.0.1:5555
backend=unix:///tmp/echo.sock
";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.role, Role::Segment);
    }
}
