use anyhow::Result;
use std::path::PathBuf;

use QuiverLevel::ReadOptions;

use super::util::{column, display_text, open};

pub async fn exec(
    path: PathBuf,
    key: String,
    column_name: Option<String>,
    out: Option<PathBuf>,
) -> Result<()> {
    let db = open(&path).await?;
    let mut options = ReadOptions::default();
    if let Some(h) = column(&db, column_name.as_deref())? {
        options = options.column(&h);
    }
    let res = db.get_with(key.as_bytes(), &options).await;
    db.close().await?;

    match res {
        Ok(v) => {
            if let Some(out_path) = out {
                std::fs::write(&out_path, &v)?;
                println!("FOUND '{}': {} B -> wrote to {}", key, v.len(), out_path.display());
            } else {
                println!("FOUND '{}': {} B", key, v.len());
                println!("text: {}", display_text(&v));
            }
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            println!("NOT FOUND '{}'", key);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
