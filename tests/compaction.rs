//! Compaction: the destination holds exactly the live data of the source
//! snapshot, in less space whenever the source carries deletions.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use silo::{compact, Db, Options, Result};
use tempfile::tempdir;

type Contents = BTreeMap<Vec<u8>, BTreeMap<Vec<u8>, Vec<u8>>>;

/// Reads every (bucket, key, value) triple the workload wrote. The
/// workload's bucket names are known, so no directory iteration is needed.
fn dump(db: &Db) -> Result<Contents> {
    let mut contents = Contents::new();
    db.view(|tx| {
        for i in 0..BUCKETS {
            let name = bucket_name(i);
            let Ok(bucket) = tx.bucket(&name) else { continue };
            let mut entries = BTreeMap::new();
            bucket.for_each(|key, value| {
                entries.insert(key.to_vec(), value.expect("plain entry").to_vec());
                Ok(())
            })?;
            contents.insert(name, entries);
        }
        Ok(())
    })?;
    Ok(contents)
}

const BUCKETS: usize = 8;
const KEYS_PER_BUCKET: usize = 120;

fn bucket_name(index: usize) -> Vec<u8> {
    format!("bucket_{index}").into_bytes()
}

fn populate(db: &Db, rng: &mut ChaCha8Rng) -> Result<()> {
    for b in 0..BUCKETS {
        db.update(|tx| {
            let bucket = tx.create_bucket_if_not_exists(&bucket_name(b))?;
            for k in 0..KEYS_PER_BUCKET {
                let key = format!("key_{b}_{k:04}");
                let mut value = vec![0u8; 80];
                rng.fill(value.as_mut_slice());
                bucket.put(key.as_bytes(), &value)?;
            }
            Ok(())
        })?;
    }
    // Random point deletes, some of which legitimately miss.
    for _ in 0..BUCKETS * KEYS_PER_BUCKET / 2 {
        let b = rng.gen_range(0..BUCKETS);
        let k = rng.gen_range(0..KEYS_PER_BUCKET * 2);
        db.update(|tx| {
            tx.bucket(&bucket_name(b))?
                .delete(format!("key_{b}_{k:04}").as_bytes())
        })?;
    }
    Ok(())
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).unwrap().len()
}

#[test]
fn compaction_preserves_contents_and_shrinks_file() -> Result<()> {
    let dir = tempdir()?;
    let src_path = dir.path().join("src.db");
    let dst_path = dir.path().join("dst.db");

    let src = Db::open(&src_path, Options::default())?;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    populate(&src, &mut rng)?;

    let before = dump(&src)?;
    let dst = Db::open(&dst_path, Options::default())?;
    let copied = compact(&dst, &src, 0)?;

    let expected_bytes: u64 = before
        .values()
        .flat_map(|entries| entries.iter())
        .map(|(key, value)| (key.len() + value.len()) as u64)
        .sum();
    assert_eq!(copied, expected_bytes);

    assert_eq!(dump(&dst)?, before);
    // The source never changed.
    assert_eq!(dump(&src)?, before);

    assert!(
        file_size(&dst_path) <= file_size(&src_path),
        "compacted file must not exceed the source"
    );
    Ok(())
}

#[test]
fn batched_compaction_matches_single_transaction() -> Result<()> {
    let dir = tempdir()?;
    let src = Db::open(dir.path().join("src.db"), Options::default())?;
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    populate(&src, &mut rng)?;

    let single = Db::open(dir.path().join("single.db"), Options::default())?;
    let batched = Db::open(dir.path().join("batched.db"), Options::default())?;
    compact(&single, &src, 0)?;
    compact(&batched, &src, 8 * 1024)?;

    assert_eq!(dump(&single)?, dump(&batched)?);
    Ok(())
}

#[test]
fn compaction_keeps_nested_and_empty_buckets() -> Result<()> {
    let dir = tempdir()?;
    let src = Db::open(dir.path().join("src.db"), Options::default())?;
    src.update(|tx| {
        let outer = tx.create_bucket_if_not_exists(b"outer")?;
        outer.put(b"plain", b"value")?;
        let inner = outer.create_bucket_if_not_exists(b"inner")?;
        inner.put(b"deep", b"treasure")?;
        tx.create_bucket_if_not_exists(b"empty")?;
        Ok(())
    })?;

    let dst = Db::open(dir.path().join("dst.db"), Options::default())?;
    compact(&dst, &src, 0)?;

    dst.view(|tx| {
        let outer = tx.bucket(b"outer")?;
        assert_eq!(outer.get(b"plain")?.as_deref(), Some(&b"value"[..]));
        assert_eq!(
            outer.bucket(b"inner")?.get(b"deep")?.as_deref(),
            Some(&b"treasure"[..])
        );
        // Empty buckets survive with no entries.
        let empty = tx.bucket(b"empty")?;
        let mut cursor = empty.cursor()?;
        assert!(cursor.first()?.is_none());
        Ok(())
    })?;
    Ok(())
}

#[test]
fn compaction_carries_overflow_values() -> Result<()> {
    let dir = tempdir()?;
    let src = Db::open(dir.path().join("src.db"), Options::default())?;
    let big: Vec<u8> = (0..60_000u32).map(|i| (i % 241) as u8).collect();
    src.update(|tx| {
        tx.create_bucket_if_not_exists(b"blobs")?.put(b"big", &big)?;
        Ok(())
    })?;

    let dst = Db::open(dir.path().join("dst.db"), Options::default())?;
    let copied = compact(&dst, &src, 0)?;
    assert_eq!(copied, (3 + big.len()) as u64);

    dst.view(|tx| {
        assert_eq!(tx.bucket(b"blobs")?.get(b"big")?.as_deref(), Some(&big[..]));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn compaction_runs_alongside_source_readers() -> Result<()> {
    let dir = tempdir()?;
    let src = Db::open(dir.path().join("src.db"), Options::default())?;
    src.update(|tx| {
        let bucket = tx.create_bucket_if_not_exists(b"b")?;
        for i in 0..200u32 {
            bucket.put(format!("k{i:04}").as_bytes(), b"v")?;
        }
        Ok(())
    })?;

    let reader = src.begin()?;
    let dst = Db::open(dir.path().join("dst.db"), Options::default())?;
    compact(&dst, &src, 0)?;

    // The long-lived reader is untouched by the compaction pass.
    assert_eq!(
        reader.bucket(b"b")?.get(b"k0000")?.as_deref(),
        Some(&b"v"[..])
    );
    reader.rollback()?;
    Ok(())
}
