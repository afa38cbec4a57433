use anyhow::Result;
use std::path::PathBuf;

use QuiverLevel::WriteOptions;

use super::util::{column, decode_value_arg, open};

pub async fn exec(
    path: PathBuf,
    key: String,
    value: String,
    column_name: Option<String>,
    sync: bool,
) -> Result<()> {
    let db = open(&path).await?;
    let bytes = decode_value_arg(&value)?;
    let mut options = WriteOptions {
        sync,
        ..WriteOptions::default()
    };
    if let Some(h) = column(&db, column_name.as_deref())? {
        options = options.column(&h);
    }
    let res = db.put_with(key.as_bytes(), &bytes, &options).await;
    db.close().await?;
    res?;
    println!("OK put '{}' ({} B)", key, bytes.len());
    Ok(())
}
