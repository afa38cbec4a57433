use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use QuiverLevel::{ColumnOptions, Database, DbOptions, Entry, Error, IteratorOptions};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qltest-iter-{prefix}-{pid}-{t}-{id}"))
}

const KEYS: &[(&str, &str)] = &[
    ("user:1", "alice"),
    ("user:2", "bob"),
    ("user:3", "Carol"),
    ("post:1", "hello"),
    ("post:2", "world"),
    ("log:error:1", "disk full"),
    ("log:info:1", "started"),
    ("log:error:2", "DISK gone"),
];

async fn seeded(tag: &str) -> Result<Database> {
    let db = Database::open_with(unique_root(tag), DbOptions::default()).await?;
    let b = db.chained_batch();
    for (k, v) in KEYS {
        b.put(k, v)?;
    }
    b.write().await?;
    Ok(db)
}

fn keys(rows: &[Entry]) -> Vec<String> {
    rows.iter()
        .map(|e| String::from_utf8_lossy(e.key.as_deref().unwrap_or_default()).into_owned())
        .collect()
}

#[tokio::test]
async fn limit_counts_matches_after_filter() -> Result<()> {
    let db = seeded("limit").await?;

    // post:* и log:* идут раньше user:* — limit до фильтра вернул бы пусто
    let q = db
        .query(IteratorOptions::default().key_filter("^user:")?.limit(1))
        .await?;
    assert_eq!(keys(&q.rows), vec!["user:1"]);

    // по одной строке за fetch: фильтр и limit работают через границы чанков
    let q = db
        .query(
            IteratorOptions::default()
                .key_filter("^user:")?
                .limit(2)
                .high_water_mark_bytes(1),
        )
        .await?;
    assert_eq!(keys(&q.rows), vec!["user:1", "user:2"]);

    let q = db.query(IteratorOptions::default().key_filter("^log:error")?).await?;
    assert_eq!(keys(&q.rows), vec!["log:error:1", "log:error:2"]);

    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn case_insensitive_and_value_filters() -> Result<()> {
    let db = seeded("filters").await?;

    let q = db.query(IteratorOptions::default().key_filter("(?i)^USER:")?).await?;
    assert_eq!(keys(&q.rows), vec!["user:1", "user:2", "user:3"]);

    // без (?i) регистр важен
    let q = db.query(IteratorOptions::default().key_filter("^USER:")?).await?;
    assert!(q.rows.is_empty());

    let q = db.query(IteratorOptions::default().value_filter("(?i)disk")?).await?;
    assert_eq!(keys(&q.rows), vec!["log:error:1", "log:error:2"]);

    let q = db
        .query(
            IteratorOptions::default()
                .key_filter("^(user|post):")?
                .value_filter("^[a-z]")?,
        )
        .await?;
    assert_eq!(keys(&q.rows), vec!["post:1", "post:2", "user:1", "user:2"]);

    let err = IteratorOptions::default().key_filter("([unclosed").unwrap_err();
    assert!(matches!(err, Error::InvalidFilter { .. }));
    assert_eq!(err.code(), "LEVEL_INVALID_FILTER");

    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn bounds_and_reverse() -> Result<()> {
    let db = seeded("bounds").await?;

    let q = db
        .query(IteratorOptions::default().gte("post:").lt("user:"))
        .await?;
    assert_eq!(keys(&q.rows), vec!["post:1", "post:2"]);

    let q = db
        .query(IteratorOptions::default().gt("post:1").lte("user:2").reverse(true))
        .await?;
    assert_eq!(keys(&q.rows), vec!["user:2", "user:1", "post:2"]);

    // строго по убыванию на всём наборе
    let q = db.query(IteratorOptions::default().reverse(true)).await?;
    let ks = keys(&q.rows);
    assert_eq!(ks.len(), KEYS.len());
    assert!(ks.windows(2).all(|w| w[0] > w[1]));

    // reverse + limit берёт с верхнего конца
    let q = db
        .query(IteratorOptions::default().reverse(true).limit(2))
        .await?;
    assert_eq!(keys(&q.rows), vec!["user:3", "user:2"]);

    // пустой диапазон — ноль строк, не ошибка
    let q = db.query(IteratorOptions::default().gt("zzz")).await?;
    assert!(q.rows.is_empty());
    let q = db.query(IteratorOptions::default().gte("b").lt("a")).await?;
    assert!(q.rows.is_empty());

    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn keys_values_projection_and_exhaustion() -> Result<()> {
    let db = seeded("projection").await?;

    let mut it = db
        .iterator(IteratorOptions::default().keys(false).key_filter("^post:")?)
        .await?;
    let first = it.next().await?.expect("row");
    assert_eq!(first.key, None);
    assert_eq!(first.value.as_deref(), Some(&b"hello"[..]));
    let second = it.next().await?.expect("row");
    assert_eq!(second.value.as_deref(), Some(&b"world"[..]));
    // исчерпан: None повторно, без ошибок; курсор уже освобождён
    assert!(it.next().await?.is_none());
    assert!(it.next().await?.is_none());
    assert!(it.is_closed());
    assert_eq!(db.open_resources(), 0);
    it.close().await?;

    let rows = db
        .query(IteratorOptions::default().values(false).gte("user:"))
        .await?
        .rows;
    assert_eq!(keys(&rows), vec!["user:1", "user:2", "user:3"]);
    assert!(rows.iter().all(|r| r.value.is_none()));

    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn next_batch_all_and_seek() -> Result<()> {
    let db = Database::open_with(unique_root("paging"), DbOptions::default()).await?;
    let b = db.chained_batch();
    for i in 0..2500u32 {
        b.put(format!("k{i:05}"), i.to_be_bytes())?;
    }
    b.write().await?;

    let mut it = db.iterator(IteratorOptions::default()).await?;
    assert_eq!(it.sequence(), db.sequence()?);
    let page = it.next_batch(10).await?;
    assert_eq!(page.len(), 10);
    assert_eq!(page[9].key.as_deref(), Some(&b"k00009"[..]));
    let rest = it.all().await?;
    assert_eq!(rest.len(), 2490);
    assert!(it.next_batch(5).await?.is_empty());

    let mut it = db.iterator(IteratorOptions::default().limit(3)).await?;
    it.seek("k01000").await?;
    let rows = it.all().await?;
    assert_eq!(keys(&rows), vec!["k01000", "k01001", "k01002"]);

    let mut it = db.iterator(IteratorOptions::default().reverse(true)).await?;
    it.next().await?;
    it.seek("k00002").await?;
    assert_eq!(keys(&it.all().await?), vec!["k00002", "k00001", "k00000"]);

    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn iterator_close_and_database_close() -> Result<()> {
    let db = seeded("close").await?;

    let mut it = db.iterator(IteratorOptions::default()).await?;
    assert_eq!(db.open_resources(), 1);
    assert!(it.next().await?.is_some());
    it.close().await?;
    it.close().await?;
    assert_eq!(db.open_resources(), 0);
    // после явного close — "больше нет"
    assert!(it.next().await?.is_none());

    // drop без close тоже отцепляет курсор
    {
        let mut dropped = db.iterator(IteratorOptions::default()).await?;
        dropped.next().await?;
    }
    assert_eq!(db.open_resources(), 0);

    // close базы закрывает открытые итераторы
    let mut open = db.iterator(IteratorOptions::default().high_water_mark_bytes(1)).await?;
    assert!(open.next().await?.is_some());
    db.close().await?;
    assert_eq!(db.open_resources(), 0);
    assert!(matches!(open.next().await, Err(Error::NotOpen)));
    open.close().await?;

    assert!(matches!(
        db.iterator(IteratorOptions::default()).await,
        Err(Error::NotOpen)
    ));
    Ok(())
}

#[tokio::test]
async fn iterates_a_column_family() -> Result<()> {
    let db = seeded("column").await?;
    let tags = db.create_column("tags", ColumnOptions::default()).await?;
    db.put_with(b"rust", b"1", &QuiverLevel::WriteOptions::default().column(&tags))
        .await?;
    db.put_with(b"go", b"2", &QuiverLevel::WriteOptions::default().column(&tags))
        .await?;

    let q = db.query(IteratorOptions::default().column(&tags)).await?;
    assert_eq!(keys(&q.rows), vec!["go", "rust"]);

    // handle после close_column больше не действителен
    db.close_column(&tags)?;
    let err = db
        .query(IteratorOptions::default().column(&tags))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ColumnNotFound(_)));
    let again = db.column("tags")?;
    assert_eq!(db.query(IteratorOptions::default().column(&again)).await?.rows.len(), 2);

    db.close().await?;
    Ok(())
}
