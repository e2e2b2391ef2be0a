//! Criterion benchmarks for vbfix performance testing.
//!
//! These benchmarks measure the performance of the vbfix binary by invoking
//! it as a subprocess in dry-run mode. This approach tests real-world
//! performance including process startup, file I/O, and the complete
//! inspection pipeline.

use criterion::{Criterion, criterion_group, criterion_main};
use std::fs;
use std::path::PathBuf;
use std::process::Command;

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vbfix"))
}

/// Build a synthetic PHP source with a fix on every tenth line.
fn synthetic_php(lines: usize) -> String {
    let mut out = String::from("<?php\n");
    for i in 0..lines {
        if i % 10 == 0 {
            out.push_str(&format!("$obj{} =& new Handler();\n", i));
        } else if i % 10 == 5 {
            out.push_str("do_hook(&$vbulletin);\n");
        } else {
            out.push_str(&format!("$x{} = {} + 1; // filler\n", i, i));
        }
    }
    out
}

fn bench_file(c: &mut Criterion, name: &str, lines: usize) {
    let dir = std::env::temp_dir().join(format!("vbfix-bench-{}", lines));
    fs::create_dir_all(&dir).expect("Failed to create bench dir");
    let input = dir.join("input.php");
    fs::write(&input, synthetic_php(lines)).expect("Failed to write bench input");

    c.bench_function(name, |b| {
        b.iter(|| {
            // Dry-run exits 3 when fixes are pending; only a crash matters here
            Command::new(binary_path())
                .args(["-n", "--no-db", "--no-config"])
                .arg(&input)
                .output()
                .expect("Failed to execute vbfix")
        })
    });
}

/// Benchmark scanning a small file (100 lines)
fn bench_small_file(c: &mut Criterion) {
    bench_file(c, "small_file", 100);
}

/// Benchmark scanning a large file (5000 lines)
fn bench_large_file(c: &mut Criterion) {
    bench_file(c, "large_file", 5000);
}

criterion_group!(benches, bench_small_file, bench_large_file);
criterion_main!(benches);
