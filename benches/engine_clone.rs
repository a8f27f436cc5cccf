//! Engine clone throughput on a synthetic payload tree.
//!
//! Compares the byte-copy engine against whatever `detect` picks for the
//! bench machine. On a CoW filesystem the detected engine should be far
//! ahead; on ext4/tmpfs the two converge.

use criterion::{Criterion, criterion_group, criterion_main};
use tempfile::tempdir;

use jvs::Cancel;
use jvs::engine::{CopyEngine, detect};

/// Build a payload tree with `files` files of `size` bytes each.
fn build_payload(root: &std::path::Path, files: usize, size: usize) {
    for i in 0..files {
        let dir = root.join(format!("dir{}", i % 8));
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join(format!("f{i}.bin")), vec![0x5a_u8; size]).expect("write");
    }
}

fn bench_copy_engine(c: &mut Criterion) {
    let src = tempdir().expect("tempdir");
    build_payload(src.path(), 64, 16 * 1024);
    let engine = CopyEngine::new();

    c.bench_function("copy_engine_64x16k", |b| {
        b.iter(|| {
            let work = tempdir().expect("tempdir");
            let dst = work.path().join("clone");
            engine
                .clone_tree(src.path(), &dst, &Cancel::new())
                .expect("clone");
        });
    });
}

fn bench_detected_engine(c: &mut Criterion) {
    let src = tempdir().expect("tempdir");
    build_payload(src.path(), 64, 16 * 1024);
    let engine = detect(src.path());

    c.bench_function("detected_engine_64x16k", |b| {
        b.iter(|| {
            let work = tempdir().expect("tempdir");
            let dst = work.path().join("clone");
            engine
                .clone_tree(src.path(), &dst, &Cancel::new())
                .expect("clone");
        });
    });
}

criterion_group!(benches, bench_copy_engine, bench_detected_engine);
criterion_main!(benches);
