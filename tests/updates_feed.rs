use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use QuiverLevel::{
    ColumnOptions, Database, DbOptions, Error, OpKind, Update, UpdatesOptions, WriteOptions,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qltest-feed-{prefix}-{pid}-{t}-{id}"))
}

async fn drain(db: &Database, options: UpdatesOptions) -> Result<Vec<Update>> {
    let mut feed = db.updates(options).await?;
    let mut out = Vec::new();
    while let Some(u) = feed.next().await? {
        out.push(u);
    }
    feed.close().await?;
    Ok(out)
}

#[tokio::test]
async fn one_entry_per_commit_in_order() -> Result<()> {
    let db = Database::open_with(unique_root("order"), DbOptions::default()).await?;
    db.put(b"a", b"1").await?;
    let b = db.chained_batch();
    b.put(b"b", b"2")?.del(b"a")?.merge(b"c", b"x")?.put_log_data(b"meta")?;
    b.write().await?;
    db.del(b"b").await?;

    let all = drain(&db, UpdatesOptions::default()).await?;
    let seqs: Vec<u64> = all.iter().map(|u| u.sequence).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let rows = &all[1].rows;
    let ops: Vec<OpKind> = rows.iter().map(|r| r.op).collect();
    assert_eq!(ops, vec![OpKind::Put, OpKind::Delete, OpKind::Merge, OpKind::Data]);
    assert_eq!(rows[0].key.as_deref(), Some(&b"b"[..]));
    assert_eq!(rows[0].value.as_deref(), Some(&b"2"[..]));
    assert_eq!(rows[1].value, None);
    assert_eq!(rows[2].value.as_deref(), Some(&b"x"[..]));
    assert_eq!(rows[3].key, None);
    assert_eq!(rows[3].value.as_deref(), Some(&b"meta"[..]));
    assert!(rows.iter().all(|r| r.column.is_none()));

    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn since_is_exclusive_and_resumable() -> Result<()> {
    let root = unique_root("since");
    let db = Database::open_with(&root, DbOptions::default()).await?;
    for i in 0..10u32 {
        db.put(format!("k{i}"), i.to_le_bytes()).await?;
    }

    let tail = drain(&db, UpdatesOptions::default().since(7)).await?;
    assert_eq!(tail.iter().map(|u| u.sequence).collect::<Vec<_>>(), vec![8, 9, 10]);

    // since = последний выданный: без новых записей пусто, и повторно тоже
    let last = tail.last().map(|u| u.sequence).unwrap_or(0);
    assert!(drain(&db, UpdatesOptions::default().since(last)).await?.is_empty());
    assert!(drain(&db, UpdatesOptions::default().since(last)).await?.is_empty());

    // since=0 — вся сохранённая история
    assert_eq!(drain(&db, UpdatesOptions::default()).await?.len(), 10);

    // переживает перезапуск
    db.close().await?;
    let db = Database::open_with(&root, DbOptions::default()).await?;
    db.put(b"after", b"restart").await?;
    let resumed = drain(&db, UpdatesOptions::default().since(last)).await?;
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].sequence, 11);
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn feed_filters_and_projection() -> Result<()> {
    let db = Database::open_with(unique_root("filters"), DbOptions::default()).await?;
    let events = db.create_column("events", ColumnOptions::default()).await?;

    let b = db.chained_batch();
    b.put(b"plain", b"1")?;
    b.put_cf(&events, b"e1", b"click")?;
    b.put_log_data(b"marker")?;
    b.write().await?;
    db.put(b"only-default", b"2").await?;

    // только колонка events: чужие строки и log data отброшены, коммиты без строк пропущены
    let only = drain(&db, UpdatesOptions::default().column(&events)).await?;
    assert_eq!(only.len(), 1);
    assert_eq!(only[0].rows.len(), 1);
    assert_eq!(only[0].rows[0].column.as_ref(), Some(&events));
    assert_eq!(only[0].rows[0].key.as_deref(), Some(&b"e1"[..]));

    let no_data = drain(&db, UpdatesOptions::default().data(false)).await?;
    assert_eq!(no_data[0].rows.len(), 2);
    assert!(no_data[0].rows.iter().all(|r| r.op != OpKind::Data));

    let keys_only = drain(&db, UpdatesOptions::default().values(false)).await?;
    assert!(keys_only.iter().flat_map(|u| &u.rows).all(|r| r.value.is_none()));
    let values_only = drain(&db, UpdatesOptions::default().keys(false)).await?;
    assert!(values_only.iter().flat_map(|u| &u.rows).all(|r| r.key.is_none()));

    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn follow_waits_for_new_commits() -> Result<()> {
    let db = Database::open_with(unique_root("follow"), DbOptions::default()).await?;
    db.put(b"first", b"1").await?;

    let mut feed = db
        .updates(UpdatesOptions::default().follow(true))
        .await?;
    assert_eq!(feed.next().await?.map(|u| u.sequence), Some(1));

    let writer = db.clone();
    let (next, ()) = tokio::join!(feed.next(), async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.put(b"second", b"2").await.ok();
    });
    let update = next?.expect("followed commit");
    assert_eq!(update.sequence, 2);
    assert_eq!(update.rows[0].key.as_deref(), Some(&b"second"[..]));
    feed.close().await?;
    feed.close().await?;
    assert!(feed.next().await?.is_none());

    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn database_close_releases_waiting_follower() -> Result<()> {
    let db = Database::open_with(unique_root("follow-close"), DbOptions::default()).await?;
    db.put_with(b"k", b"v", &WriteOptions::sync()).await?;

    let mut feed = db.updates(UpdatesOptions::default().since(1).follow(true)).await?;
    assert_eq!(db.open_resources(), 1);

    let closer = db.clone();
    let (next, closed) = tokio::join!(feed.next(), async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        closer.close().await
    });
    closed?;
    assert!(matches!(next, Err(Error::NotOpen)));
    assert_eq!(db.open_resources(), 0);
    assert!(feed.is_closed());
    feed.close().await?;
    Ok(())
}

#[tokio::test]
async fn database_close_waits_for_pending_feed_fetch() -> Result<()> {
    let root = unique_root("fetch-close");
    let db = Database::open_with(&root, DbOptions::default()).await?;
    let b = db.chained_batch();
    for i in 0..200_000u32 {
        b.put(format!("k{i:06}"), b"value")?;
    }
    b.write().await?;
    db.put(b"tail", b"x").await?;

    let mut feed = db.updates(UpdatesOptions::default()).await?;
    // join опрашивает next первым: чтение большого коммита уже идёт, когда close стартует
    let (first, closed) = tokio::join!(feed.next(), db.close());
    closed?;
    let first = first?.ok_or_else(|| anyhow::anyhow!("feed ended early"))?;
    assert_eq!(first.sequence, 1);
    assert_eq!(first.rows.len(), 200_000);
    assert_eq!(db.open_resources(), 0);

    // контекст освобождён базой: дальше NotOpen, close — no-op
    assert!(matches!(feed.next().await, Err(Error::NotOpen)));
    assert!(feed.is_closed());
    feed.close().await?;
    feed.close().await?;
    assert!(feed.next().await?.is_none());

    // состояние на диске цело
    let db = Database::open_with(&root, DbOptions::default()).await?;
    assert_eq!(db.sequence()?, 2);
    assert_eq!(db.get(b"k199999").await?, b"value");
    assert_eq!(drain(&db, UpdatesOptions::default().since(1)).await?.len(), 1);
    db.close().await?;
    Ok(())
}
