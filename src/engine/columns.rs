//! Persisted column-family registry.
//!
//! Формат: <root>/COLUMNS
//! {
//!   "next_id": 3,
//!   "columns": [ {"id":0,"name":"default"}, {"id":1,"name":"meta","merge_operator":"max"}, ... ]
//! }
//!
//! Запись выполняется атомарно через tmp+rename. The default column always
//! exists with id 0.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_COLUMN: &str = "default";
pub const DEFAULT_COLUMN_ID: u32 = 0;

const COLUMNS_FILE: &str = "COLUMNS";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnEntry {
    pub id: u32,
    pub name: String,
    /// Column-specific merge operator; replay must resolve merges the same way.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_operator: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnRegistry {
    pub next_id: u32,
    pub columns: Vec<ColumnEntry>,
}

impl Default for ColumnRegistry {
    fn default() -> Self {
        Self {
            next_id: DEFAULT_COLUMN_ID + 1,
            columns: vec![ColumnEntry {
                id: DEFAULT_COLUMN_ID,
                name: DEFAULT_COLUMN.to_string(),
                merge_operator: None,
            }],
        }
    }
}

fn registry_path(root: &Path) -> PathBuf {
    root.join(COLUMNS_FILE)
}

impl ColumnRegistry {
    pub fn load(root: &Path) -> Result<Self> {
        let p = registry_path(root);
        if !p.exists() {
            return Ok(Self::default());
        }
        let bytes = fs::read(&p).with_context(|| format!("read {}", p.display()))?;
        let mut reg: ColumnRegistry = serde_json::from_slice(&bytes).context("parse COLUMNS")?;
        if reg.by_name(DEFAULT_COLUMN).is_none() {
            reg.columns.insert(
                0,
                ColumnEntry {
                    id: DEFAULT_COLUMN_ID,
                    name: DEFAULT_COLUMN.to_string(),
                    merge_operator: None,
                },
            );
        }
        Ok(reg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = registry_path(root);
        let tmp = root.join(format!("{COLUMNS_FILE}.tmp"));
        let mut f = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .with_context(|| format!("open {}", tmp.display()))?;
        let data = serde_json::to_vec_pretty(self).context("serialize COLUMNS")?;
        f.write_all(&data)?;
        let _ = f.sync_all();
        fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<&ColumnEntry> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn by_id(&self, id: u32) -> Option<&ColumnEntry> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Id of `name`, registering it when new. The bool is true for new columns.
    pub fn ensure(&mut self, name: &str, merge_operator: Option<&str>) -> (u32, bool) {
        if let Some(c) = self.by_name(name) {
            return (c.id, false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.columns.push(ColumnEntry {
            id,
            name: name.to_string(),
            merge_operator: merge_operator.map(str::to_string),
        });
        (id, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_assigns_stable_ids_and_persists() -> Result<()> {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let root = std::env::temp_dir().join(format!("qltest-cols-{}-{t}", std::process::id()));
        fs::create_dir_all(&root)?;

        let mut reg = ColumnRegistry::load(&root)?;
        assert_eq!(reg.by_name(DEFAULT_COLUMN).unwrap().id, 0);
        assert_eq!(reg.ensure("meta", None), (1, true));
        assert_eq!(reg.ensure("blobs", Some("max")), (2, true));
        assert_eq!(reg.ensure("meta", Some("max")), (1, false));
        reg.save(&root)?;

        let back = ColumnRegistry::load(&root)?;
        assert_eq!(back.next_id, 3);
        assert_eq!(back.by_id(2).unwrap().name, "blobs");
        assert_eq!(back.by_id(2).unwrap().merge_operator.as_deref(), Some("max"));
        assert_eq!(back.by_id(1).unwrap().merge_operator, None);
        Ok(())
    }
}
