use anyhow::{Context, Result};

use crate::config::Config;
use crate::database::Database;
use crate::primitives::{Gpid, Mutation};
use crate::utils;

const ERR_MSG_ITER: &str = "error iterating scanned data";
const NUM_ENTRIES: u64 = 1_001;
const PREFIX_A: &[u8; 1] = b"a";
/// We use this in tests as it is middle in lexicographical sort order.
const PREFIX_B: &[u8; 1] = b"b";
const PREFIX_C: &[u8; 1] = b"c";

#[tokio::test]
async fn test_exhaustive_scan_prefix_and_range_behavior() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let tree = db.get_log_tree(Gpid::new(1, 0)).await?;

    // Load data distributed across three key prefixes which are used to assert correctness of
    // range scans and prefix scans, which depend upon the correctness of key encoding.
    load_data(&tree)?;

    // Assert that prefix scan finds the correct amount of data.
    let mut count = 0;
    for kv_res in tree.scan_prefix(PREFIX_B) {
        let (key, val) = kv_res.context(ERR_MSG_ITER)?;
        if key[0] != PREFIX_B[0] {
            println!("bad key prefix: got {}; expected: {};", key[0], PREFIX_B[0]);
        } else {
            count += 1;
        }
        let _key = utils::decode_u64(&key[1..])?;
        let _val = utils::decode_u64(&val)?;
    }
    assert_eq!(count, NUM_ENTRIES, "expected scan_prefix to find {} entries, got {}", NUM_ENTRIES, count);

    // Assert that range scans preserve sort order based on our key prefix strategy.
    let (start, stop, mut count, mut current_decree) = (PREFIX_B, PREFIX_C, 0, 0u64);
    for kv_res in tree.range::<_, std::ops::Range<&[u8]>>(start..stop) {
        let (key, val) = kv_res.context(ERR_MSG_ITER)?;
        if key[0] != PREFIX_B[0] {
            println!("bad key prefix: got {}; expected: {};", key[0], &PREFIX_B[0]);
        } else {
            count += 1;
        }
        let key = utils::decode_u64(&key[1..])?;
        let val = utils::decode_u64(&val)?;
        assert_eq!(key, current_decree, "db.range with prefix iterated out of order, expected key {} got {}", current_decree, key);
        assert_eq!(val, current_decree, "db.range with prefix iterated out of order, expected val {} got {}", current_decree, val);
        current_decree += 1;
    }
    assert_eq!(count, NUM_ENTRIES, "expected range to find {} entries, got {}", NUM_ENTRIES, count);

    Ok(())
}

#[test]
fn test_model_encoding_roundtrip() -> Result<()> {
    let mutation = Mutation {
        decree: 42,
        ballot: 7,
        payload: vec![0, 1, 2, 254, 255],
    };

    let encoded = utils::encode_model(&mutation)?;
    let decoded: Mutation = utils::decode_model(&encoded)?;

    assert_eq!(mutation, decoded, "decoded mutation differs from original, got {:?} expected {:?}", decoded, mutation);
    Ok(())
}

fn load_data(db: &sled::Tree) -> Result<()> {
    for prefix in [PREFIX_A, PREFIX_B, PREFIX_C] {
        let mut batch = sled::Batch::default();
        for decree in 0..NUM_ENTRIES {
            let key = utils::encode_byte_prefix(prefix, decree);
            batch.insert(&key, &utils::encode_u64(decree));
        }
        db.apply_batch(batch).context("error inserting data")?;
    }
    db.flush().context("error flusing data")?;
    Ok(())
}
