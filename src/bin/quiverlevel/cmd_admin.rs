use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;

use super::util::{column, open};

pub async fn exec_property(path: PathBuf, name: String) -> Result<()> {
    let db = open(&path).await?;
    let res = db.get_property(&name);
    db.close().await?;
    let value = res?;
    if value.is_empty() {
        println!("(unknown property '{}')", name);
    } else {
        println!("{}", value);
    }
    Ok(())
}

pub async fn exec_compact(path: PathBuf, column_name: Option<String>) -> Result<()> {
    let db = open(&path).await?;
    let res = async {
        match column(&db, column_name.as_deref())? {
            Some(h) => db.compact_range_cf(&h, None, None).await?,
            None => db.compact_range(None, None).await?,
        }
        anyhow::Ok(db.get_property("quiverlevel.checkpoint-sequence")?)
    }
    .await;
    db.close().await?;
    println!("OK compacted (checkpoint seq {})", res?);
    Ok(())
}

pub async fn exec_wal_files(path: PathBuf, json: bool) -> Result<()> {
    let db = open(&path).await?;
    let res = db.sorted_wal_files().await;
    db.close().await?;
    let files = res?;
    if json {
        let arr: Vec<_> = files
            .iter()
            .map(|f| {
                json!({
                    "path": f.path.display().to_string(),
                    "start_sequence": f.start_sequence,
                    "size_bytes": f.size_bytes,
                })
            })
            .collect();
        println!("{}", serde_json::Value::Array(arr));
    } else if files.is_empty() {
        println!("(no WAL files)");
    } else {
        for f in &files {
            println!("{:>20}  {:>10} B  {}", f.start_sequence, f.size_bytes, f.path.display());
        }
    }
    Ok(())
}
