use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::model::ConfigDocument;

/// Top-level key every config document must carry.
pub const VERSION_KEY: &str = "samba-container-config";

/// Config format versions this build understands.
pub const VALID_VERSIONS: &[&str] = &["v0"];

/// Source format of a config document, selected by filename suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Anything without a recognized suffix is treated as JSON.
    pub fn detect(path: &Path) -> ConfigFormat {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }

    fn parser(&self) -> &'static dyn TreeParser {
        match self {
            ConfigFormat::Json => &JsonParser,
            ConfigFormat::Yaml => &YamlParser,
            ConfigFormat::Toml => &TomlParser,
        }
    }
}

/// Parse raw document bytes into the generic tree. One implementation
/// per supported format; the loader depends only on this interface.
pub trait TreeParser {
    fn parse(&self, bytes: &[u8]) -> std::result::Result<Value, String>;
}

struct JsonParser;

impl TreeParser for JsonParser {
    fn parse(&self, bytes: &[u8]) -> std::result::Result<Value, String> {
        serde_json::from_slice(bytes).map_err(|e| e.to_string())
    }
}

struct YamlParser;

impl TreeParser for YamlParser {
    fn parse(&self, bytes: &[u8]) -> std::result::Result<Value, String> {
        serde_yaml::from_slice(bytes).map_err(|e| e.to_string())
    }
}

struct TomlParser;

impl TreeParser for TomlParser {
    fn parse(&self, bytes: &[u8]) -> std::result::Result<Value, String> {
        let text = std::str::from_utf8(bytes).map_err(|e| e.to_string())?;
        toml::from_str(text).map_err(|e| e.to_string())
    }
}

/// Read and merge the container config from the given file paths.
///
/// Paths that do not exist are skipped, but at least one file must be
/// readable. Later files extend or override earlier ones section by
/// section: colliding entry names are replaced whole, non-colliding
/// names accumulate.
pub fn read_config_files(paths: &[PathBuf]) -> Result<ConfigDocument> {
    let mut merged = Value::Object(serde_json::Map::new());
    let mut read_any = false;

    for path in paths {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("config path {:?} does not exist, skipping", path);
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let tree = load_tree(path, &bytes)?;
        merge_sections(&mut merged, tree);
        read_any = true;
        info!("loaded config file {:?}", path);
    }

    if !read_any {
        return Err(Error::NoConfigFiles {
            paths: paths.to_vec(),
        });
    }

    let doc: ConfigDocument =
        serde_json::from_value(merged).map_err(|err| Error::InvalidConfig {
            reason: err.to_string(),
        })?;
    doc.validate()?;
    Ok(doc)
}

/// Parse one file into a generic tree, check its version marker, and
/// drop `_`-prefixed annotation keys.
fn load_tree(path: &Path, bytes: &[u8]) -> Result<Value> {
    let format = ConfigFormat::detect(path);
    let mut tree = format.parser().parse(bytes).map_err(|reason| Error::Parse {
        path: path.to_path_buf(),
        reason,
    })?;
    check_version(path, &tree)?;
    strip_annotations(&mut tree);
    Ok(tree)
}

fn check_version(path: &Path, tree: &Value) -> Result<()> {
    let version = tree
        .get(VERSION_KEY)
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MissingVersion {
            path: path.to_path_buf(),
        })?;
    if !VALID_VERSIONS.contains(&version) {
        return Err(Error::UnsupportedVersion {
            path: path.to_path_buf(),
            version: version.to_string(),
        });
    }
    Ok(())
}

/// Remove keys starting with `_` anywhere in the tree. They are
/// reserved for free-form annotations and no consumer may read them.
fn strip_annotations(tree: &mut Value) {
    match tree {
        Value::Object(map) => {
            map.retain(|key, _| !key.starts_with('_'));
            for value in map.values_mut() {
                strip_annotations(value);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                strip_annotations(item);
            }
        }
        _ => {}
    }
}

/// Fold `incoming`'s top-level sections into `merged`. Mapping-valued
/// sections combine entry by entry; anything else is replaced.
fn merge_sections(merged: &mut Value, incoming: Value) {
    let (Value::Object(base), Value::Object(update)) = (merged, incoming) else {
        return;
    };
    for (section, value) in update {
        let folded = match (base.remove(&section), value) {
            (Some(Value::Object(mut existing)), Value::Object(entries)) => {
                for (name, entry) in entries {
                    existing.insert(name, entry);
                }
                Value::Object(existing)
            }
            (_, value) => value,
        };
        base.insert(section, folded);
    }
}
