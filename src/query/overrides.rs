//! Row-level override sidecar.
//!
//! `<csv_path>_updates.json` maps stringified line numbers to
//! column → value patches. A non-empty store forces the executor onto the
//! full-scan path so every row can be patched before filtering.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{CidxError, Result};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RowOverrides {
    #[serde(default)]
    pub rows: HashMap<String, HashMap<String, String>>,
}

impl RowOverrides {
    /// Sidecar path for a CSV: the full file name plus `_updates.json`.
    pub fn sidecar_path(csv_path: &Path) -> PathBuf {
        let mut os = csv_path.as_os_str().to_os_string();
        os.push("_updates.json");
        PathBuf::from(os)
    }

    /// Load the sidecar if present. A missing file yields an empty store;
    /// a malformed file is an error.
    pub fn load(csv_path: &Path) -> Result<Self> {
        let path = Self::sidecar_path(csv_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(&path)?;
        if data.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(&data)
            .map_err(|e| CidxError::BadRequest(format!("updates file parse: {e}")))
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get_row(&self, line: i64) -> Option<&HashMap<String, String>> {
        self.rows.get(&line.to_string())
    }

    /// Patch a materialized row in place. Column names are matched
    /// case-insensitively against the header map.
    pub fn apply(&self, line: i64, header_map: &AHashMap<String, usize>, cols: &mut [String]) {
        let Some(patch) = self.get_row(line) else { return };
        for (col, val) in patch {
            if let Some(&idx) = header_map.get(col.to_lowercase().as_str()) {
                if idx < cols.len() {
                    cols[idx] = val.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_benign() {
        let dir = tempfile::tempdir().unwrap();
        let store = RowOverrides::load(&dir.path().join("data.csv")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_load_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("data.csv");
        std::fs::write(
            RowOverrides::sidecar_path(&csv),
            r#"{"rows":{"3":{"Dept":"Ops"}}}"#,
        )
        .unwrap();

        let store = RowOverrides::load(&csv).unwrap();
        assert!(!store.is_empty());
        assert!(store.get_row(3).is_some());
        assert!(store.get_row(4).is_none());

        let header_map: AHashMap<String, usize> =
            [("id".to_string(), 0), ("dept".to_string(), 1)].into_iter().collect();
        let mut cols = vec!["3".to_string(), "Eng".to_string()];
        store.apply(3, &header_map, &mut cols);
        assert_eq!(cols[1], "Ops");

        // other lines untouched
        let mut other = vec!["4".to_string(), "Eng".to_string()];
        store.apply(4, &header_map, &mut other);
        assert_eq!(other[1], "Eng");
    }

    #[test]
    fn test_malformed_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("data.csv");
        std::fs::write(RowOverrides::sidecar_path(&csv), "{broken").unwrap();
        assert!(matches!(RowOverrides::load(&csv), Err(CidxError::BadRequest(_))));
    }
}
