//! JSON run configuration
//!
//! Loaded once at start and written back at exit. Keys this crate does not
//! know about are carried through untouched.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use normpath::PathExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transfer::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    #[serde(default, alias = "skip_directories")]
    pub ignore_directories: Vec<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default)]
    pub preserve_mtime: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Top-level keys present in the file this was loaded from.
    #[serde(skip)]
    loaded_keys: Option<BTreeSet<String>>,
}

/// Keys with a default; left out on write-back unless the file had them.
const DEFAULTED_KEYS: [&str; 5] = [
    "port",
    "password",
    "ignore_directories",
    "chunk_size",
    "preserve_mtime",
];

fn default_port() -> u16 {
    22
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        let keys = value
            .as_object()
            .map(|map| map.keys().cloned().collect::<BTreeSet<_>>());
        let mut config: Config = serde_json::from_value(value)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.loaded_keys = keys;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration back in the shape it was read: the exclusion
    /// list keeps its original key and defaults the file never named stay out.
    pub fn save(&self, path: &Path) -> Result<()> {
        let map = match serde_json::to_value(self).context("failed to serialize config")? {
            Value::Object(map) => map,
            other => return Err(anyhow!("config serialized to {other}, expected an object")),
        };
        let map = match &self.loaded_keys {
            Some(keys) => reshape(map, keys),
            None => map,
        };

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        map.serialize(&mut ser)
            .context("failed to serialize config")?;
        buf.push(b'\n');
        fs::write(path, buf)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(anyhow!("chunk_size must be greater than zero"));
        }
        if self.remote_path.trim().is_empty() {
            return Err(anyhow!("remote_path must not be empty"));
        }
        Ok(())
    }

    pub fn excluded_names(&self) -> BTreeSet<String> {
        self.ignore_directories.iter().cloned().collect()
    }

    /// Absolute, normalized local root. Works for paths that do not exist yet.
    pub fn local_root(&self) -> Result<PathBuf> {
        let absolute = if self.local_path.is_absolute() {
            self.local_path.clone()
        } else {
            std::env::current_dir()
                .context("current directory is unavailable")?
                .join(&self.local_path)
        };
        Ok(match absolute.normalize() {
            Ok(normalized) => normalized.into_path_buf(),
            Err(_) => lexical_normalize(&absolute),
        })
    }
}

fn reshape(map: Map<String, Value>, loaded: &BTreeSet<String>) -> Map<String, Value> {
    let legacy_excludes =
        loaded.contains("skip_directories") && !loaded.contains("ignore_directories");
    map.into_iter()
        .filter(|(key, value)| {
            loaded.contains(key.as_str())
                || !DEFAULTED_KEYS.contains(&key.as_str())
                || (key == "ignore_directories" && legacy_excludes)
                || default_for(key).as_ref() != Some(value)
        })
        .map(|(key, value)| {
            if legacy_excludes && key == "ignore_directories" {
                ("skip_directories".to_string(), value)
            } else {
                (key, value)
            }
        })
        .collect()
}

fn default_for(key: &str) -> Option<Value> {
    Some(match key {
        "port" => Value::from(default_port()),
        "password" => Value::from(""),
        "ignore_directories" => Value::Array(Vec::new()),
        "chunk_size" => Value::from(default_chunk_size()),
        "preserve_mtime" => Value::Bool(false),
        _ => return None,
    })
}

// `normalize` needs the path to exist; fall back to folding `.`/`..` by hand.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "hostname": "backup.example",
        "username": "mirror",
        "password": "secret",
        "remote_path": "/backup",
        "local_path": "./data/../mirror",
        "skip_directories": ["tmp", "cache"],
        "notes": "kept as-is"
    }"#;

    #[test]
    fn defaults_and_alias_are_applied() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!config.preserve_mtime);
        assert_eq!(config.ignore_directories, vec!["tmp", "cache"]);
        assert!(config.excluded_names().contains("cache"));
    }

    #[test]
    fn save_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(&path).unwrap();
        config.save(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["notes"], "kept as-is");
        assert_eq!(written["password"], "secret");
    }

    #[test]
    fn save_keeps_the_shape_of_the_loaded_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, SAMPLE).unwrap();

        Config::load(&path).unwrap().save(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let keys: Vec<&str> = written.as_object().unwrap().keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["hostname", "username", "password", "remote_path", "local_path", "skip_directories", "notes"]
        );
        assert_eq!(written["skip_directories"][1], "cache");
        assert_eq!(Config::load(&path).unwrap().ignore_directories, vec!["tmp", "cache"]);
    }

    #[test]
    fn changed_default_is_written_even_if_absent_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, SAMPLE).unwrap();

        let mut config = Config::load(&path).unwrap();
        config.port = 2222;
        config.save(&path).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["port"], 2222);
        assert!(written.get("chunk_size").is_none());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut value: serde_json::Value = serde_json::from_str(SAMPLE).unwrap();
        value["chunk_size"] = 0.into();
        fs::write(&path, value.to_string()).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn local_root_is_absolute_and_normalized() {
        let config: Config = serde_json::from_str(SAMPLE).unwrap();
        let root = config.local_root().unwrap();
        assert!(root.is_absolute());
        assert!(root.ends_with("mirror"));
        assert!(!root.components().any(|c| c.as_os_str() == ".."));
    }
}
