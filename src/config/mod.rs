//! Configuration loading.
//!
//! # Data Flow
//! ```text
//! config file (TOML or JSON)
//!     -> parse into a JSON tree
//!     -> refs.rs (resolve ${env.*} references)
//!     -> flatten.rs (linearize nested route trees, hoist inline blocks)
//!     -> ordered component blocks per section
//! ```
//!
//! A section is a named list of component blocks. The `cluster` section is
//! what a supervising primary runs; every other section is a worker group.
//! A standalone run uses the section named by the top-level `main` key
//! (default `app`).

pub mod flatten;
pub mod refs;

use std::collections::HashMap;
use std::path::Path;

use serde_json::Value;

use crate::component::registry::Block;
use crate::error::{Error, Result};

pub const DEFAULT_SECTION: &str = "app";

/// A parsed configuration document: environment values plus the named
/// sections of component blocks, already reference-resolved and flattened.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: serde_json::Map<String, Value>,
    pub main: String,
    sections: HashMap<String, Vec<Block>>,
}

impl AppConfig {
    /// Read and prepare a configuration file. TOML and JSON are accepted,
    /// chosen by file extension (anything that is not `.json` parses as
    /// TOML).
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let tree = if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str::<Value>(&raw)
                .map_err(|e| Error::Parse(format!("{}: {e}", path.display())))?
        } else {
            let doc: toml::Value = toml::from_str(&raw)
                .map_err(|e| Error::Parse(format!("{}: {e}", path.display())))?;
            serde_json::to_value(doc).map_err(|e| Error::Parse(e.to_string()))?
        };
        Self::from_value(tree)
    }

    /// Prepare an already-parsed configuration tree.
    pub fn from_value(tree: Value) -> Result<Self> {
        let mut root = match tree {
            Value::Object(map) => map,
            other => {
                return Err(Error::Config(format!(
                    "configuration root must be an object, got: {other}"
                )))
            }
        };

        let mut env = match root.remove("env") {
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(Error::Config(format!("env must be an object, got: {other}")))
            }
            None => serde_json::Map::new(),
        };
        if !env.contains_key("cwd") {
            let cwd = std::env::current_dir()?;
            env.insert("cwd".into(), Value::String(cwd.display().to_string()));
        }

        let main = match root.remove("main") {
            Some(Value::String(name)) => name,
            Some(other) => {
                return Err(Error::Config(format!("main must be a string, got: {other}")))
            }
            None => DEFAULT_SECTION.to_string(),
        };

        // Resolve ${env.*} references across the whole tree before
        // flattening; request-time references stay verbatim.
        let env_root = Value::Object({
            let mut scope = serde_json::Map::new();
            scope.insert("env".into(), Value::Object(env.clone()));
            scope
        });
        let mut sections = HashMap::new();
        for (name, value) in root {
            let mut value = value;
            refs::replace_value(&mut value, &|path| {
                refs::lookup_path(&env_root, path).map(refs::value_to_string)
            });
            let blocks = match value {
                Value::Array(items) => flatten::flatten_section(items)?,
                other => {
                    return Err(Error::Config(format!(
                        "section {name:?} must be an array of component blocks, got: {other}"
                    )))
                }
            };
            sections.insert(name, blocks);
        }

        Ok(Self {
            env,
            main,
            sections,
        })
    }

    /// The ordered component blocks of one section.
    pub fn section(&self, name: &str) -> Result<&[Block]> {
        self.sections
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::Config(format!("configuration has no section named {name:?}")))
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }
}
