//! Randomized model check: the database must agree with a BTreeMap after a
//! random mix of point writes, batches, merges and range clears, before and
//! after a reopen, and the change feed must replay into the same state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use oorandom::Rand64;
use QuiverLevel::{
    ClearOptions, Database, DbOptions, IteratorOptions, OpKind, Operation, UpdatesOptions,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("qltest-model-{prefix}-{pid}-{t}-{id}"))
}

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

fn random_key(rng: &mut Rand64) -> Vec<u8> {
    format!("key-{:03}", rng.rand_range(0..200)).into_bytes()
}

fn random_value(rng: &mut Rand64) -> Vec<u8> {
    let len = rng.rand_range(0..48) as usize;
    (0..len).map(|_| b'a' + (rng.rand_range(0..26) as u8)).collect()
}

fn apply(model: &mut Model, op: &Operation) {
    let (Some(key), value) = (op.key.clone(), op.value.clone()) else {
        return;
    };
    match op.kind {
        OpKind::Put => {
            model.insert(key, value.unwrap_or_default());
        }
        OpKind::Delete => {
            model.remove(&key);
        }
        OpKind::Merge => {
            let operand = value.unwrap_or_default();
            model.entry(key).or_default().extend_from_slice(&operand);
        }
        OpKind::Data => {}
    }
}

async fn assert_same(db: &Database, model: &Model) -> Result<()> {
    let rows = db.query(IteratorOptions::default()).await?.rows;
    let got: Model = rows
        .into_iter()
        .map(|e| (e.key.unwrap_or_default(), e.value.unwrap_or_default()))
        .collect();
    assert_eq!(&got, model);

    let reversed = db.query(IteratorOptions::default().reverse(true)).await?.rows;
    let expected: Vec<&Vec<u8>> = model.keys().rev().collect();
    let actual: Vec<Vec<u8>> = reversed.into_iter().filter_map(|e| e.key).collect();
    assert_eq!(actual.iter().collect::<Vec<_>>(), expected);
    Ok(())
}

#[tokio::test]
async fn random_ops_match_model() -> Result<()> {
    let root = unique_root("ops");
    let options = DbOptions::default()
        .with_wal_segment_bytes(4096)
        .with_write_buffer_size(32 * 1024)
        .with_wal_size_limit(u64::MAX);
    let db = Database::open_with(&root, options.clone()).await?;
    let mut model = Model::new();
    let mut rng = Rand64::new(0x5EED_CAFE);

    for step in 0..600u32 {
        match rng.rand_range(0..10) {
            0..=3 => {
                let op = Operation::put(random_key(&mut rng), random_value(&mut rng));
                db.put(op.key.as_deref().unwrap_or_default(), op.value.as_deref().unwrap_or_default())
                    .await?;
                apply(&mut model, &op);
            }
            4 => {
                let op = Operation::del(random_key(&mut rng));
                db.del(op.key.as_deref().unwrap_or_default()).await?;
                apply(&mut model, &op);
            }
            5 => {
                let op = Operation::merge(random_key(&mut rng), random_value(&mut rng));
                db.merge(op.key.as_deref().unwrap_or_default(), op.value.as_deref().unwrap_or_default())
                    .await?;
                apply(&mut model, &op);
            }
            6..=8 => {
                let n = rng.rand_range(1..8);
                let ops: Vec<Operation> = (0..n)
                    .map(|_| match rng.rand_range(0..3) {
                        0 => Operation::del(random_key(&mut rng)),
                        1 => Operation::merge(random_key(&mut rng), random_value(&mut rng)),
                        _ => Operation::put(random_key(&mut rng), random_value(&mut rng)),
                    })
                    .collect();
                db.batch(ops.clone()).await?;
                for op in &ops {
                    apply(&mut model, op);
                }
            }
            _ => {
                let a = random_key(&mut rng);
                let b = random_key(&mut rng);
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                let removed = db.clear(ClearOptions::default().gte(&lo).lt(&hi)).await?;
                let doomed: Vec<Vec<u8>> = model
                    .range(lo.clone()..hi.clone())
                    .map(|(k, _)| k.clone())
                    .collect();
                assert_eq!(removed, doomed.len(), "clear at step {step}");
                for k in doomed {
                    model.remove(&k);
                }
            }
        }
        if step % 150 == 149 {
            assert_same(&db, &model).await?;
        }
    }
    assert_same(&db, &model).await?;

    // feed с нуля проигрывает ту же историю (сегменты не удаляются: wal_size_limit)
    let mut replay = Model::new();
    let mut feed = db.updates(UpdatesOptions::default()).await?;
    let mut last = 0;
    while let Some(update) = feed.next().await? {
        assert!(update.sequence > last);
        last = update.sequence;
        for row in update.rows {
            let op = Operation {
                kind: row.op,
                key: row.key,
                value: row.value,
                column: None,
            };
            apply(&mut replay, &op);
        }
    }
    feed.close().await?;
    assert_eq!(last, db.sequence()?);
    assert_eq!(replay, model);

    db.close().await?;
    let db = Database::open_with(&root, options).await?;
    assert_same(&db, &model).await?;
    db.close().await?;
    Ok(())
}
