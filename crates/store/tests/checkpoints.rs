//! The cold tier: checkpoint files below the sort offset, loaded on demand
//! and cached behind weak references.

use std::fs;
use std::path::Path;

use blockdag_core::block::{Block, Validator};
use blockdag_core::fixtures;
use blockdag_core::metadata::BlockMetadata;
use blockdag_store::{BlockDagFileStorage, Config, StoreError};
use pretty_assertions::assert_eq;
use tempfile::tempdir;

/// --- helpers ----------------------------------------------------------------

fn open(dir: &Path) -> BlockDagFileStorage {
    BlockDagFileStorage::open(Config::in_dir(dir)).expect("open storage")
}

fn frame(bytes: &[u8]) -> Vec<u8> {
    let mut out = (bytes.len() as i32).to_be_bytes().to_vec();
    out.extend_from_slice(bytes);
    out
}

fn checkpoint_block(label: &str, sender: &Validator, block_num: i64) -> BlockMetadata {
    BlockMetadata {
        block_hash: fixtures::hash(label),
        parents: Vec::new(),
        block_num,
        seq_num: 0,
        sender: sender.clone(),
        justifications: Vec::new(),
        bonds: Vec::new(),
        invalid: false,
    }
}

fn write_checkpoint(dir: &Path, name: &str, records: &[BlockMetadata]) {
    let mut bytes = Vec::new();
    for record in records {
        bytes.extend_from_slice(&frame(&record.to_bytes()));
    }
    fs::write(dir.join("checkpoints").join(name), bytes).unwrap();
}

fn live_block(label: &str, sender: &Validator, block_num: i64) -> Block {
    Block {
        block_hash: fixtures::hash(label),
        parents: Vec::new(),
        justifications: Vec::new(),
        bonds: Vec::new(),
        block_num,
        seq_num: block_num as i32,
        sender: sender.clone(),
        deploy_ids: Vec::new(),
    }
}

/// --- tests ------------------------------------------------------------------

#[test]
fn topo_slice_spans_the_checkpoint_boundary() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("checkpoints")).unwrap();

    // one checkpoint covering [0, 100) with exactly two blocks per number
    let v = fixtures::validator("ck");
    let records: Vec<_> = (0i64..100)
        .flat_map(|n| {
            [
                checkpoint_block(&format!("ck-{n}-a"), &v, n),
                checkpoint_block(&format!("ck-{n}-b"), &v, n),
            ]
        })
        .collect();
    write_checkpoint(dir.path(), "0-100", &records);

    let storage = open(dir.path());
    let genesis = live_block("live-genesis", &v, 0);
    for n in 100i64..103 {
        storage
            .insert(&live_block(&format!("live-{n}"), &v, n), &genesis, false)
            .unwrap();
    }

    let dag = storage.get_representation();
    let rows = dag.topo_sort(98).unwrap();
    // checkpoint rows for 98 and 99, then the three live rows
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[0].len(), 2);
    assert_eq!(rows[1].len(), 2);
    assert_eq!(rows[2], vec![fixtures::hash("live-100")]);
    assert_eq!(rows[4], vec![fixtures::hash("live-102")]);

    // a slice starting inside the live window never touches the checkpoint
    assert_eq!(dag.topo_sort(101).unwrap().len(), 2);
    // and one starting at zero covers the full history
    assert_eq!(dag.topo_sort(0).unwrap().len(), 103);
}

#[test]
fn cold_lookups_resolve_through_checkpoints() {
    let dir = tempdir().unwrap();
    let v1 = fixtures::validator("v1");
    let v2 = fixtures::validator("v2");
    let bonded = [v1.clone(), v2.clone()];
    let genesis = fixtures::genesis(&bonded);
    let b1 = fixtures::child("b1", &v1, &[&genesis], &bonded);
    let b2 = fixtures::child("b2", &v2, &[&b1], &bonded);

    {
        let storage = open(dir.path());
        storage.insert(&genesis, &genesis, false).unwrap();
        storage.insert(&b1, &genesis, false).unwrap();
        storage.insert(&b2, &genesis, false).unwrap();
        storage.close().unwrap();
    }

    // rotate the whole metadata log into a checkpoint, the way a rotation
    // job would: the records move verbatim, the log restarts empty
    let log_path = dir.path().join("block-metadata.log");
    let bytes = fs::read(&log_path).unwrap();
    fs::write(dir.path().join("checkpoints").join("0-3"), bytes).unwrap();
    fs::write(&log_path, b"").unwrap();
    fs::remove_file(dir.path().join("block-metadata.crc")).unwrap();

    let storage = open(dir.path());
    let dag = storage.get_representation();

    // nothing lives in memory any more
    assert_eq!(dag.topo_sort(3).unwrap().len(), 0);

    // but every hash still resolves through the index and the checkpoint
    assert!(dag.contains(&b1.block_hash).unwrap());
    let meta = dag.lookup(&b1.block_hash).unwrap().unwrap();
    assert_eq!(meta.block_num, 1);
    assert_eq!(
        dag.children(&genesis.block_hash).unwrap().unwrap(),
        std::collections::BTreeSet::from([b1.block_hash.clone()])
    );
    assert_eq!(
        dag.latest_message(&v2).unwrap().unwrap().block_hash,
        b2.block_hash
    );

    // topo slices come out of the checkpoint too
    let rows = dag.topo_sort(0).unwrap();
    assert_eq!(
        rows,
        vec![
            vec![genesis.block_hash.clone()],
            vec![b1.block_hash.clone()],
            vec![b2.block_hash.clone()],
        ]
    );
    assert_eq!(dag.topo_sort(2).unwrap(), vec![vec![b2.block_hash.clone()]]);

    // the weak cache answers repeated lookups without re-reading anything
    assert!(dag.lookup(&b2.block_hash).unwrap().is_some());
    assert!(dag.lookup(&genesis.block_hash).unwrap().is_some());

    dag.verify_integrity().unwrap();
}

#[test]
fn checkpoint_gap_is_rejected() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("checkpoints")).unwrap();
    fs::write(dir.path().join("checkpoints").join("0-100"), b"").unwrap();
    fs::write(dir.path().join("checkpoints").join("150-200"), b"").unwrap();

    let err = BlockDagFileStorage::open(Config::in_dir(dir.path())).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::CheckpointsAreNotConsecutive { .. })
    ));
}

#[test]
fn checkpoints_must_start_from_zero() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("checkpoints")).unwrap();
    fs::write(dir.path().join("checkpoints").join("100-200"), b"").unwrap();

    let err = BlockDagFileStorage::open(Config::in_dir(dir.path())).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::CheckpointsDoNotStartFromZero { .. })
    ));
}

#[test]
fn stray_files_in_the_checkpoint_directory_are_ignored() {
    let dir = tempdir().unwrap();
    fs::create_dir_all(dir.path().join("checkpoints")).unwrap();
    fs::write(dir.path().join("checkpoints").join("README"), b"notes").unwrap();
    fs::write(dir.path().join("checkpoints").join("0-1.bak"), b"junk").unwrap();

    let storage = open(dir.path());
    let v = fixtures::validator("v");
    let genesis = fixtures::genesis(&[v.clone()]);
    let dag = storage.insert(&genesis, &genesis, false).unwrap();
    // no checkpoints parsed: genesis lands in row zero of the live sort
    assert_eq!(dag.topo_sort(0).unwrap(), vec![vec![genesis.block_hash.clone()]]);
}

#[test]
fn topo_tail_formula_is_pinned() {
    let dir = tempdir().unwrap();
    let v = fixtures::validator("v");
    let bonded = [v.clone()];
    let genesis = fixtures::genesis(&bonded);
    let b1 = fixtures::child("b1", &v, &[&genesis], &bonded);
    let b2 = fixtures::child("b2", &v, &[&b1], &bonded);

    let storage = open(dir.path());
    storage.insert(&genesis, &genesis, false).unwrap();
    storage.insert(&b1, &genesis, false).unwrap();
    let dag = storage.insert(&b2, &genesis, false).unwrap();

    // live only: offset 0, three rows
    assert_eq!(
        dag.topo_sort_tail(2).unwrap(),
        vec![vec![b1.block_hash.clone()], vec![b2.block_hash.clone()]]
    );
    assert_eq!(dag.topo_sort_tail(3).unwrap().len(), 3);
    // asking for more rows than exist returns everything
    assert_eq!(dag.topo_sort_tail(10).unwrap().len(), 3);
}

#[test]
fn topo_tail_reaches_into_checkpoints() {
    let dir = tempdir().unwrap();
    let v = fixtures::validator("v");
    let bonded = [v.clone()];
    let genesis = fixtures::genesis(&bonded);
    let b1 = fixtures::child("b1", &v, &[&genesis], &bonded);
    let b2 = fixtures::child("b2", &v, &[&b1], &bonded);

    {
        let storage = open(dir.path());
        storage.insert(&genesis, &genesis, false).unwrap();
        storage.insert(&b1, &genesis, false).unwrap();
        storage.insert(&b2, &genesis, false).unwrap();
        storage.close().unwrap();
    }
    let log_path = dir.path().join("block-metadata.log");
    let bytes = fs::read(&log_path).unwrap();
    fs::write(dir.path().join("checkpoints").join("0-3"), bytes).unwrap();
    fs::write(&log_path, b"").unwrap();
    fs::remove_file(dir.path().join("block-metadata.crc")).unwrap();

    let storage = open(dir.path());
    let dag = storage.get_representation();
    // offset 3, empty live sort: tail(1) starts at 3 - (1 - 0) = 2
    assert_eq!(dag.topo_sort_tail(1).unwrap(), vec![vec![b2.block_hash.clone()]]);
    // tail(4) clamps the start to zero and returns the full history
    assert_eq!(dag.topo_sort_tail(4).unwrap().len(), 3);
}
