// Criterion benchmark suite for compile and match paths.
//
// Run: cargo bench
// Specific group: cargo bench -- compile
// HTML report: target/criterion/report/index.html

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use evrex::api::Regex;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("compile failed")
}

const PATTERNS: &[(&str, &str)] = &[
    ("literal", "hello world"),
    ("class_runs", "[a-z]+[0-9]+[a-z]+"),
    ("alternation", "alpha|beta|gamma|delta"),
    ("anchored", "^[A-Za-z]+: .+$"),
    ("backref", r"([a-z]+)\s+\1"),
    ("recursion", "(a(?R)?b)"),
];

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for (name, pattern) in PATTERNS {
        group.bench_with_input(BenchmarkId::from_parameter(name), pattern, |b, pattern| {
            b.iter(|| compile(black_box(pattern)));
        });
    }
    group.finish();
}

fn bench_match(c: &mut Criterion) {
    let mut group = c.benchmark_group("match");

    let cases: &[(&str, &str, &str)] = &[
        ("literal_hit", "hello world", "hello world and more"),
        ("class_runs", "[a-z]+[0-9]+[a-z]+", "abcdef123456xyz"),
        ("alternation_last", "alpha|beta|gamma|delta", "delta"),
        ("backref", r"([a-z]+)\s+\1", "sample   sample"),
        ("recursion_deep", "(a(?R)?b)", "aaaaaaaabbbbbbbb"),
    ];

    for (name, pattern, text) in cases {
        let mut re = compile(pattern);
        group.bench_with_input(BenchmarkId::from_parameter(name), text, |b, text| {
            b.iter(|| re.is_match(black_box(text)));
        });
    }
    group.finish();
}

fn bench_find_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_all");

    let haystack = "lorem 12 ipsum 345 dolor 6789 sit 0 amet ".repeat(16);
    let mut re = compile("[0-9]+");
    group.bench_function("digits_x64", |b| {
        b.iter(|| re.find_all(black_box(&haystack)));
    });

    group.finish();
}

criterion_group!(benches, bench_compile, bench_match, bench_find_all);
criterion_main!(benches);
