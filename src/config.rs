//! Typed engine configuration. Unlike the teacher's `config.rs`, which
//! loads a YAML settings file and caches it behind a global, this crate
//! has no on-disk settings format of its own: the embedding application
//! constructs `EngineConfig` directly and passes it to `Engine::start`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where the pairing store JSON file lives.
    pub pairing_store_path: PathBuf,
    /// Optional log file; if absent, logging goes to stdout only.
    pub log_file_path: Option<PathBuf>,
    #[serde(with = "level_filter_serde")]
    pub log_level: log::LevelFilter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pairing_store_path: PathBuf::from("keycard-pairings.json"),
            log_file_path: None,
            log_level: log::LevelFilter::Info,
        }
    }
}

mod level_filter_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(level: &log::LevelFilter, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(level.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<log::LevelFilter, D::Error> {
        let s = String::deserialize(d)?;
        log::LevelFilter::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.log_level, log::LevelFilter::Info);
        assert!(cfg.log_file_path.is_none());
    }
}
