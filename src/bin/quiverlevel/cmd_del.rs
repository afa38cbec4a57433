use anyhow::Result;
use std::path::PathBuf;

use QuiverLevel::WriteOptions;

use super::util::{column, open};

pub async fn exec(path: PathBuf, key: String, column_name: Option<String>) -> Result<()> {
    let db = open(&path).await?;
    let mut options = WriteOptions::default();
    if let Some(h) = column(&db, column_name.as_deref())? {
        options = options.column(&h);
    }
    let res = db.del_with(key.as_bytes(), &options).await;
    db.close().await?;
    res?;
    println!("OK del '{}'", key);
    Ok(())
}
