use anyhow::Result;
use serde_json::{json, Map, Value};
use std::path::PathBuf;

use QuiverLevel::{Database, UpdatesOptions};

use super::util::{display_text, json_bytes, open};

async fn print_updates(db: &Database, since: u64, follow: bool, json: bool) -> Result<u64> {
    let mut feed = db
        .updates(UpdatesOptions::default().since(since).follow(follow))
        .await?;
    while let Some(update) = feed.next().await? {
        if json {
            let rows: Vec<Value> = update
                .rows
                .iter()
                .map(|r| {
                    let mut obj = Map::new();
                    obj.insert("op".into(), json!(r.op.as_str()));
                    if let Some(c) = &r.column {
                        obj.insert("column".into(), json!(c.name()));
                    }
                    json_bytes(&mut obj, "key", r.key.as_deref());
                    json_bytes(&mut obj, "value", r.value.as_deref());
                    Value::Object(obj)
                })
                .collect();
            println!("{}", json!({ "sequence": update.sequence, "rows": rows }));
        } else {
            println!("seq {} ({} op(s))", update.sequence, update.rows.len());
            for r in &update.rows {
                let column = r.column.as_ref().map_or("default", |c| c.name());
                println!(
                    "  {:<5} [{}] '{}' {}",
                    r.op.as_str(),
                    column,
                    r.key.as_deref().map(display_text).unwrap_or_default(),
                    r.value.as_deref().map(display_text).unwrap_or_default()
                );
            }
        }
    }
    let last = feed.last_sequence();
    feed.close().await?;
    Ok(last)
}

pub async fn exec(path: PathBuf, since: u64, follow: bool, json: bool) -> Result<()> {
    let db = open(&path).await?;
    let res = print_updates(&db, since, follow, json).await;
    db.close().await?;
    let last = res?;
    if !json {
        println!("caught up at seq {}", last);
    }
    Ok(())
}
