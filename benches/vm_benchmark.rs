//! VM performance benchmarks: recursive calls, loops, and
//! string/GC churn.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::process::Command;
use std::time::Duration;

/// Run kona on the given source code, returning execution time.
fn run_kona_timed(source: &str) -> Duration {
    let temp_dir = std::env::temp_dir();
    let temp_file = temp_dir.join(format!("kona_bench_{}.kona", std::process::id()));
    std::fs::write(&temp_file, source).unwrap();

    let start = std::time::Instant::now();

    let output = Command::new(env!("CARGO_BIN_EXE_kona"))
        .arg(temp_file.to_str().unwrap())
        .output()
        .expect("failed to execute kona");

    let elapsed = start.elapsed();

    assert!(
        output.status.success(),
        "benchmark should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    std::fs::remove_file(&temp_file).ok();

    elapsed
}

/// Fibonacci benchmark - tests recursive function calls.
fn fibonacci_source(n: u32) -> String {
    format!(
        r#"
fun fib(n) {{
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}}

print fib({});
"#,
        n
    )
}

/// Loop benchmark - tests dispatch and local variable traffic.
fn loop_source(n: u32) -> String {
    format!(
        r#"
var total = 0;
for (var i = 0; i < {}; i = i + 1) {{
    total = total + i;
}}
print total;
"#,
        n
    )
}

/// Allocation benchmark - tests instance creation and GC pressure.
fn allocation_source(n: u32) -> String {
    format!(
        r#"
class Node {{ init(v) {{ this.v = v; this.next = nil; }} }}
var head = nil;
for (var i = 0; i < {}; i = i + 1) {{
    var node = Node(i);
    node.next = head;
    head = node;
}}
print head.v;
"#,
        n
    )
}

fn bench_fibonacci(c: &mut Criterion) {
    let mut group = c.benchmark_group("fibonacci");
    group.sample_size(10);
    for n in [15u32, 20] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let source = fibonacci_source(n);
            b.iter(|| run_kona_timed(&source));
        });
    }
    group.finish();
}

fn bench_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("loop");
    group.sample_size(10);
    for n in [10_000u32, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let source = loop_source(n);
            b.iter(|| run_kona_timed(&source));
        });
    }
    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    group.sample_size(10);
    for n in [1_000u32, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let source = allocation_source(n);
            b.iter(|| run_kona_timed(&source));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fibonacci, bench_loop, bench_allocation);
criterion_main!(benches);
