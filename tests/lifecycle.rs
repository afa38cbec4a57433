use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde_json::json;
use QuiverLevel::{
    Cache, CacheOptions, ColumnOptions, Database, DbOptions, Error, IteratorOptions,
    MergeOperator, ReadOptions, Status,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qltest-life-{prefix}-{pid}-{t}-{id}"))
}

#[tokio::test]
async fn state_machine_and_idempotent_close() -> Result<()> {
    let db = Database::new(unique_root("states"), DbOptions::default());
    assert_eq!(db.status(), Status::Closed);
    assert!(matches!(db.put(b"k", b"v").await, Err(Error::NotOpen)));
    assert!(matches!(db.get(b"k").await, Err(Error::NotOpen)));
    assert_eq!(db.sequence().unwrap_err().code(), "LEVEL_DATABASE_NOT_OPEN");

    // close закрытой базы — no-op
    db.close().await?;

    db.open().await?;
    assert!(db.is_open());
    // повторный open открытой базы — no-op
    db.open().await?;
    db.put(b"k", b"v").await?;
    let identity = db.identity()?;

    db.close().await?;
    db.close().await?;
    assert_eq!(db.status(), Status::Closed);

    // тот же handle можно открыть снова
    db.open().await?;
    assert_eq!(db.get(b"k").await?, b"v");
    assert_eq!(db.identity()?, identity);
    db.close().await?;
    Ok(())
}

#[tokio::test]
async fn open_failures() -> Result<()> {
    let root = unique_root("fail");

    let missing = Database::new(&root, DbOptions::default().with_create_if_missing(false));
    let err = missing.open().await.unwrap_err();
    assert_eq!(err.code(), "LEVEL_DATABASE_OPEN_FAILED");
    assert_eq!(missing.status(), Status::Closed);

    let db = Database::open_with(&root, DbOptions::default()).await?;

    // LOCK держит первый handle
    let second = Database::new(&root, DbOptions::default());
    assert!(matches!(second.open().await, Err(Error::Open { .. })));

    db.close().await?;
    // после close LOCK освобождён
    second.open().await?;
    second.close().await?;

    let exists = Database::new(&root, DbOptions::default().with_error_if_exists(true));
    assert!(matches!(exists.open().await, Err(Error::Open { .. })));

    // пустой путь отклоняется до обращения к диску
    let cwd = std::env::current_dir()?;
    let lock_before = cwd.join("LOCK").exists();
    let empty = Database::new("", DbOptions::default());
    let err = empty.open().await.unwrap_err();
    assert!(matches!(err, Error::InvalidLocation));
    assert_eq!(err.code(), "LEVEL_INVALID_LOCATION");
    assert_eq!(empty.status(), Status::Closed);
    assert_eq!(cwd.join("LOCK").exists(), lock_before);
    assert!(matches!(
        Database::open_with("", DbOptions::default()).await,
        Err(Error::InvalidLocation)
    ));
    Ok(())
}

#[tokio::test]
async fn close_waits_for_in_flight_get_many() -> Result<()> {
    let db = Database::open_with(unique_root("getmany"), DbOptions::default()).await?;
    let b = db.chained_batch();
    for i in 0..1000u32 {
        b.put(format!("k{i}"), b"v")?;
    }
    b.write().await?;

    let keys: Vec<Vec<u8>> = (0..200_000u32).map(|i| format!("k{}", i % 2000).into_bytes()).collect();
    // join опрашивает get_many первым: вызов уже учтён, когда close стартует
    let (got, closed) = tokio::join!(db.get_many(keys), db.close());
    closed?;
    let got = got?;
    assert_eq!(got.len(), 200_000);
    assert_eq!(got[5].as_deref(), Some(&b"v"[..]));
    assert_eq!(got[1500], None);
    assert_eq!(db.status(), Status::Closed);
    Ok(())
}

#[tokio::test]
async fn close_waits_for_pending_iterator_fetch() -> Result<()> {
    let db = Database::open_with(unique_root("iterfetch"), DbOptions::default()).await?;
    let b = db.chained_batch();
    for i in 0..5000u32 {
        b.put(format!("k{i:05}"), vec![0u8; 64])?;
    }
    b.write().await?;

    let mut it = db.iterator(IteratorOptions::default()).await?;
    // fetch стартует первым и держит курсор; close ждёт его
    let (first, closed) = tokio::join!(it.next(), db.close());
    closed?;
    assert_eq!(first?.and_then(|e| e.key), Some(b"k00000".to_vec()));
    assert_eq!(db.open_resources(), 0);
    // строки, полученные до close, ещё отдаются; следующий fetch — NotOpen
    let mut buffered = 0usize;
    let end = loop {
        match it.next().await {
            Ok(Some(_)) => buffered += 1,
            other => break other,
        }
    };
    assert!(buffered > 0);
    assert!(matches!(end, Err(Error::NotOpen)));
    it.close().await?;
    Ok(())
}

#[tokio::test]
async fn shared_cache_between_databases() -> Result<()> {
    let cache = Cache::new(CacheOptions::default().with_capacity_bytes(1 << 20));
    let token = cache.token();

    let db1 = Database::open_with(
        unique_root("cache1"),
        DbOptions::default().with_cache(Some(cache.clone())),
    )
    .await?;
    let opts = DbOptions::from_value(&json!({ "cache": token }))?;
    assert!(opts.cache.as_ref().map_or(false, |c| c.same_as(&cache)));
    let db2 = Database::open_with(unique_root("cache2"), opts).await?;

    db1.put(b"a", b"1").await?;
    db2.put(b"b", b"2").await?;
    assert_eq!(db1.get(b"a").await?, b"1");
    assert_eq!(db2.get(b"b").await?, b"2");
    assert!(db1.get(b"b").await.unwrap_err().is_not_found());
    assert!(db2.get(b"a").await.unwrap_err().is_not_found());

    // больше одного WAL-блока: полные блоки читаются через кэш,
    // дописываемый хвостовой блок идёт мимо него
    let bulk = db1.chained_batch();
    for i in 0..100u32 {
        bulk.put(format!("bulk{i:03}"), vec![(i % 251) as u8; 1024])?;
    }
    bulk.write().await?;

    // чтение ленты идёт через общий кэш
    let mut feed = db1.updates(Default::default()).await?;
    while feed.next().await?.is_some() {}
    assert!(cache.usage() > 0);
    assert_eq!(
        db2.get_property("quiverlevel.block-cache-capacity")?,
        (1u64 << 20).to_string()
    );

    db1.close().await?;
    db2.close().await?;
    // кэш живёт дольше баз
    assert!(Cache::from_token(token).is_ok());
    drop(feed);
    Ok(())
}

#[tokio::test]
async fn invalid_cache_token_and_legacy_options() -> Result<()> {
    let err = Cache::from_token(u64::MAX).unwrap_err();
    assert_eq!(err.code(), "LEVEL_INVALID_CACHE");

    let err = DbOptions::from_value(&json!("positional")).unwrap_err();
    assert!(matches!(err, Error::LegacyUsage(_)));
    let err = DbOptions::from_value(&json!({ "callback": true })).unwrap_err();
    assert_eq!(err.code(), "LEVEL_LEGACY");

    let opts = DbOptions::from_value(&json!({
        "createIfMissing": true,
        "parallelism": 2,
        "walTTL": 1000,
        "columns": ["a", "b"],
        "mergeOperator": "max",
    }))?;
    assert_eq!(opts.parallelism, 2);
    assert_eq!(opts.wal_ttl_ms, 1000);
    assert_eq!(opts.columns, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(opts.merge_operator, MergeOperator::Max);
    Ok(())
}

#[tokio::test]
async fn columns_persist_across_reopen() -> Result<()> {
    let root = unique_root("columns");
    {
        let db = Database::open_with(&root, DbOptions::default().with_columns(["meta"])).await?;
        let counters = db
            .create_column("counters", ColumnOptions::default().with_merge_operator(MergeOperator::Max))
            .await?;
        assert!(matches!(
            db.create_column("default", ColumnOptions::default()).await,
            Err(Error::ColumnNotFound(_))
        ));
        db.merge_with(b"hi", b"3", &QuiverLevel::WriteOptions::default().column(&counters))
            .await?;
        db.merge_with(b"hi", b"1", &QuiverLevel::WriteOptions::default().column(&counters))
            .await?;
        let names: Vec<String> = db.columns()?.iter().map(|c| c.name().to_string()).collect();
        assert_eq!(names, vec!["meta", "counters"]);
        db.close().await?;

        // handle закрытой сессии недействителен
        db.open().await?;
        let err = db
            .get_with(b"hi", &ReadOptions::default().column(&counters))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ColumnNotFound(_)));
        db.close().await?;
    }

    let db = Database::open_with(&root, DbOptions::default()).await?;
    let counters = db.column("counters")?;
    let read = ReadOptions::default().column(&counters);
    assert_eq!(db.get_with(b"hi", &read).await?, b"3");
    assert!(db.column("nope").is_err());
    assert_eq!(db.get_property("quiverlevel.num-columns")?, "3");
    db.close().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_partial_commits() -> Result<()> {
    let db = Database::open_with(unique_root("atomic"), DbOptions::default()).await?;
    db.batch(vec![
        QuiverLevel::Operation::put(b"left".to_vec(), 0u32.to_le_bytes().to_vec()),
        QuiverLevel::Operation::put(b"right".to_vec(), 0u32.to_le_bytes().to_vec()),
    ])
    .await?;

    let writer = {
        let db = db.clone();
        tokio::spawn(async move {
            for i in 1..=300u32 {
                let b = db.chained_batch();
                b.put(b"left", i.to_le_bytes())?;
                b.put(b"right", i.to_le_bytes())?;
                b.write().await?;
            }
            anyhow::Ok(())
        })
    };

    let reader = {
        let db = db.clone();
        tokio::spawn(async move {
            for _ in 0..300 {
                let got = db.get_many(vec![b"left".to_vec(), b"right".to_vec()]).await?;
                assert_eq!(got[0], got[1]);
                let rows = db.query(IteratorOptions::default()).await?.rows;
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0].value, rows[1].value);
            }
            anyhow::Ok(())
        })
    };

    writer.await??;
    reader.await??;
    db.close().await?;
    Ok(())
}
