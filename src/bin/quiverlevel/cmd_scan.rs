use anyhow::Result;
use serde_json::{Map, Value};

use QuiverLevel::{Database, IteratorOptions};

use super::cli::ScanArgs;
use super::util::{column, display_text, json_bytes, open};

fn options(db: &Database, args: &ScanArgs) -> Result<IteratorOptions> {
    let mut o = IteratorOptions::default().reverse(args.reverse);
    if let Some(k) = &args.gt {
        o = o.gt(k);
    }
    if let Some(k) = &args.gte {
        o = o.gte(k);
    }
    if let Some(k) = &args.lt {
        o = o.lt(k);
    }
    if let Some(k) = &args.lte {
        o = o.lte(k);
    }
    if let Some(n) = args.limit {
        o = o.limit(n);
    }
    if let Some(p) = &args.key_filter {
        o = o.key_filter(p)?;
    }
    if let Some(p) = &args.value_filter {
        o = o.value_filter(p)?;
    }
    if let Some(h) = column(db, args.column.as_deref())? {
        o = o.column(&h);
    }
    Ok(o)
}

async fn print_rows(db: &Database, args: &ScanArgs) -> Result<usize> {
    let mut it = db.iterator(options(db, args)?).await?;
    let mut n = 0usize;
    while let Some(row) = it.next().await? {
        n += 1;
        if args.json {
            let mut obj = Map::new();
            json_bytes(&mut obj, "key", row.key.as_deref());
            json_bytes(&mut obj, "value", row.value.as_deref());
            println!("{}", Value::Object(obj));
        } else {
            let k = row.key.as_deref().unwrap_or_default();
            let v = row.value.as_deref().unwrap_or_default();
            println!(
                "key='{}' ({} B) -> value '{}' ({} B)",
                display_text(k),
                k.len(),
                display_text(v),
                v.len()
            );
        }
    }
    it.close().await?;
    Ok(n)
}

pub async fn exec(args: ScanArgs) -> Result<()> {
    let db = open(&args.path).await?;
    let res = print_rows(&db, &args).await;
    db.close().await?;
    let n = res?;
    if n == 0 && !args.json {
        println!("(no items)");
    }
    Ok(())
}
