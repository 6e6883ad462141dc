//! Function configuration
//!
//! The cluster ships one JSON document describing every registered
//! function. The engine validates handshakes and invocations against it and
//! returns the raw document to launchers and workers as the handshake
//! response payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{LumenError, Result};

/// One function entry in the cluster config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuncSpec {
    #[serde(rename = "funcId")]
    pub func_id: u16,
    #[serde(rename = "funcName")]
    pub name: String,
    #[serde(rename = "minWorkers", default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(rename = "maxWorkers", default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

/// The parsed cluster function config plus its raw JSON
#[derive(Debug, Clone)]
pub struct FuncConfig {
    by_id: HashMap<u16, FuncSpec>,
    raw_json: String,
}

impl FuncConfig {
    /// Parse from a JSON array of function entries
    pub fn load(raw_json: String) -> Result<Self> {
        let entries: Vec<FuncSpec> = serde_json::from_str(&raw_json)?;
        let mut by_id = HashMap::new();
        for entry in entries {
            if entry.func_id == 0 {
                return Err(LumenError::Config("func_id 0 is reserved".into()));
            }
            if by_id.insert(entry.func_id, entry.clone()).is_some() {
                return Err(LumenError::Config(format!(
                    "duplicate func_id {} in function config",
                    entry.func_id
                )));
            }
        }
        Ok(Self { by_id, raw_json })
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let raw_json = std::fs::read_to_string(path)?;
        Self::load(raw_json)
    }

    pub fn find_by_func_id(&self, func_id: u16) -> Option<&FuncSpec> {
        self.by_id.get(&func_id)
    }

    /// The raw document, returned as the handshake response payload
    pub fn raw_json(&self) -> &str {
        &self.raw_json
    }

    pub fn function_count(&self) -> usize {
        self.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"[
        {"funcId": 1, "funcName": "echo", "minWorkers": 2, "maxWorkers": 4},
        {"funcId": 2, "funcName": "wordcount"}
    ]"#;

    #[test]
    fn test_load_and_lookup() {
        let config = FuncConfig::load(CONFIG.to_string()).unwrap();
        assert_eq!(config.function_count(), 2);

        let echo = config.find_by_func_id(1).unwrap();
        assert_eq!(echo.name, "echo");
        assert_eq!(echo.min_workers, 2);

        let wc = config.find_by_func_id(2).unwrap();
        assert_eq!(wc.min_workers, 1);
        assert_eq!(wc.max_workers, 8);

        assert!(config.find_by_func_id(3).is_none());
    }

    #[test]
    fn test_duplicate_func_id_rejected() {
        let raw = r#"[{"funcId": 1, "funcName": "a"}, {"funcId": 1, "funcName": "b"}]"#;
        assert!(FuncConfig::load(raw.to_string()).is_err());
    }

    #[test]
    fn test_reserved_func_id_rejected() {
        let raw = r#"[{"funcId": 0, "funcName": "zero"}]"#;
        assert!(FuncConfig::load(raw.to_string()).is_err());
    }

    #[test]
    fn test_raw_json_preserved() {
        let config = FuncConfig::load(CONFIG.to_string()).unwrap();
        assert_eq!(config.raw_json(), CONFIG);
    }
}
