//! Runtime configuration read from the process environment.

use std::time::Duration;

use uuid::Uuid;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} is not set")]
    Missing { key: &'static str },
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Collaboration core configuration.
#[derive(Debug, Clone)]
pub struct CollabConfig {
    /// HMAC secret used to verify collab tokens
    pub app_secret: String,
    /// Postgres connection string (None = in-memory store)
    pub database_url: Option<String>,
    /// Relay endpoint for cross-process sync (None = in-process bus)
    pub relay_url: Option<String>,
    /// Address the relay binary binds to
    pub relay_bind: String,
    /// Skip registering both sync extensions
    pub sync_disabled: bool,
    /// TTL of cached document snapshots
    pub doc_ttl: Duration,
    pub doc_key_prefix: String,
    pub update_channel: String,
    pub awareness_channel: String,
    /// Promote per-message sync diagnostics to info level
    pub debug: bool,
    /// Stable identity of this process on the sync channels
    pub process_id: String,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            app_secret: String::new(),
            database_url: None,
            relay_url: None,
            relay_bind: "127.0.0.1:9191".to_string(),
            sync_disabled: false,
            doc_ttl: Duration::from_secs(3600),
            doc_key_prefix: "wiki:doc:".to_string(),
            update_channel: "wiki:yjs:updates".to_string(),
            awareness_channel: "wiki:yjs:awareness".to_string(),
            debug: false,
            process_id: process_id(None),
        }
    }
}

impl CollabConfig {
    /// Read configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let doc_ttl = match get("COLLAB_DOC_TTL") {
            Some(raw) => {
                let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::Invalid {
                    key: "COLLAB_DOC_TTL",
                    value: raw.clone(),
                })?;
                Duration::from_secs(secs)
            }
            None => defaults.doc_ttl,
        };

        Ok(Self {
            app_secret: get("APP_SECRET").unwrap_or_default(),
            database_url: get("DATABASE_URL"),
            relay_url: get("COLLAB_RELAY_URL"),
            relay_bind: get("COLLAB_RELAY_BIND").unwrap_or(defaults.relay_bind),
            sync_disabled: parse_flag("COLLAB_DISABLE_REDIS", get("COLLAB_DISABLE_REDIS"))?,
            doc_ttl,
            doc_key_prefix: get("COLLAB_DOC_KEY_PREFIX").unwrap_or(defaults.doc_key_prefix),
            update_channel: get("COLLAB_UPDATE_CHANNEL").unwrap_or(defaults.update_channel),
            awareness_channel: get("COLLAB_AWARENESS_CHANNEL")
                .unwrap_or(defaults.awareness_channel),
            debug: parse_flag("DEBUG_COLLAB", get("DEBUG_COLLAB"))?,
            process_id: process_id(get("HOSTNAME")),
        })
    }

    /// The token secret, or an error when none is configured.
    pub fn require_secret(&self) -> Result<&str, ConfigError> {
        if self.app_secret.is_empty() {
            return Err(ConfigError::Missing { key: "APP_SECRET" });
        }
        Ok(&self.app_secret)
    }

    /// Cache key holding the snapshot of a document.
    pub fn doc_key(&self, document_name: &str) -> String {
        format!("{}{}", self.doc_key_prefix, document_name)
    }
}

fn parse_flag(key: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::trim) {
        None => Ok(false),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("FALSE") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            key,
            value: other.to_string(),
        }),
    }
}

/// Host name when available, else `node-` plus six random characters.
pub fn process_id(hostname: Option<String>) -> String {
    match hostname {
        Some(host) if !host.trim().is_empty() => host,
        _ => {
            let suffix: String = Uuid::new_v4().simple().to_string().chars().take(6).collect();
            format!("node-{suffix}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CollabConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.doc_ttl, Duration::from_secs(3600));
        assert_eq!(config.doc_key_prefix, "wiki:doc:");
        assert_eq!(config.update_channel, "wiki:yjs:updates");
        assert_eq!(config.awareness_channel, "wiki:yjs:awareness");
        assert!(!config.sync_disabled);
        assert!(!config.debug);
        assert!(config.process_id.starts_with("node-"));
    }

    #[test]
    fn test_overrides() {
        let config = CollabConfig::from_lookup(lookup(&[
            ("COLLAB_DOC_TTL", "60"),
            ("COLLAB_DISABLE_REDIS", "true"),
            ("DEBUG_COLLAB", "1"),
            ("HOSTNAME", "collab-7"),
            ("APP_SECRET", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(config.doc_ttl, Duration::from_secs(60));
        assert!(config.sync_disabled);
        assert!(config.debug);
        assert_eq!(config.process_id, "collab-7");
        assert_eq!(config.require_secret().unwrap(), "s3cret");
    }

    #[test]
    fn test_invalid_ttl() {
        let err = CollabConfig::from_lookup(lookup(&[("COLLAB_DOC_TTL", "soon")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "COLLAB_DOC_TTL", .. }));
    }

    #[test]
    fn test_missing_secret() {
        let config = CollabConfig::default();
        assert!(matches!(
            config.require_secret(),
            Err(ConfigError::Missing { key: "APP_SECRET" })
        ));
    }

    #[test]
    fn test_generated_process_id_shape() {
        let id = process_id(None);
        assert_eq!(id.len(), "node-".len() + 6);
        assert_ne!(process_id(None), id);
    }

    #[test]
    fn test_doc_key() {
        let config = CollabConfig::default();
        assert_eq!(config.doc_key("page.1"), "wiki:doc:page.1");
    }
}
