use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use serde_json::{json, Map, Value};
use std::io::Read;
use std::path::{Path, PathBuf};

use QuiverLevel::{ColumnHandle, Database, DbOptions};

/// Open the database at `path` with QL_* env overrides.
pub async fn open(path: &Path) -> Result<Database> {
    let options = DbOptions::from_env();
    log::debug!("options: {}", options);
    let db = Database::open_with(path, options)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    Ok(db)
}

/// Handle for `--column`, None for the default column.
pub fn column(db: &Database, name: Option<&str>) -> Result<Option<ColumnHandle>> {
    match name {
        None | Some("default") => Ok(None),
        Some(n) => Ok(Some(db.column(n)?)),
    }
}

pub fn decode_value_arg(arg: &str) -> Result<Vec<u8>> {
    if arg == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        return Ok(buf);
    }
    if let Some(p) = arg.strip_prefix('@') {
        let path = PathBuf::from(p);
        return std::fs::read(&path).with_context(|| format!("read value file {}", path.display()));
    }
    if let Some(hx) = arg.strip_prefix("hex:") {
        return decode_hex(hx);
    }
    Ok(arg.as_bytes().to_vec())
}

pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex string must have even length"));
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for i in (0..bytes.len()).step_by(2) {
        let h = (bytes[i] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i))?;
        let l = (bytes[i + 1] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i + 1))?;
        out.push(((h << 4) | l) as u8);
    }
    Ok(out)
}

pub fn display_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => format!("(binary {} B)", bytes.len()),
    }
}

/// `{"<name>": text}` for UTF-8, `{"<name>_b64": base64}` otherwise.
pub fn json_bytes(obj: &mut Map<String, Value>, name: &str, bytes: Option<&[u8]>) {
    let Some(bytes) = bytes else {
        return;
    };
    match std::str::from_utf8(bytes) {
        Ok(s) => {
            obj.insert(name.to_string(), json!(s));
        }
        Err(_) => {
            let enc = base64::engine::general_purpose::STANDARD.encode(bytes);
            obj.insert(format!("{name}_b64"), json!(enc));
        }
    }
}
