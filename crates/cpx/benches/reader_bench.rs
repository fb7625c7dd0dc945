use std::fmt::Write as _;
use std::path::Path;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use cpx::common::Split;
use cpx::readers::{InputConfig, InputType, ReaderKind};

const ROWS: usize = 10_000;

fn write_csv(dir: &Path) -> std::path::PathBuf {
    let mut body = String::from("id,name,city,score\n");
    for i in 0..ROWS {
        let _ = writeln!(body, "{i},name-{i},\"Springfield, {}\",{}", i % 50, i * 7);
    }
    let path = dir.join("rows.csv");
    std::fs::write(&path, body).unwrap();
    path
}

fn write_aggregate(dir: &Path) -> std::path::PathBuf {
    let mut body = String::from("<feed>");
    for i in 0..ROWS {
        let _ = write!(body, r#"<item id="{i}"><title>item {i}</title><body>lorem &amp; ipsum</body></item>"#);
    }
    body.push_str("</feed>");
    let path = dir.join("feed.xml");
    std::fs::write(&path, body).unwrap();
    path
}

fn drain(kind: ReaderKind, split: &Split, config: &InputConfig) -> usize {
    kind.stream(split, config)
        .unwrap()
        .map(|record| record.unwrap())
        .count()
}

fn bench_delimited(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let split = Split::whole(write_csv(dir.path())).unwrap();
    let config = InputConfig {
        input_type: InputType::DelimitedText,
        id_field_name: Some("id".to_string()),
        ..Default::default()
    };

    c.bench_function("delimited_10k_rows", |b| {
        b.iter(|| black_box(drain(ReaderKind::Delimited, &split, &config)))
    });
}

fn bench_aggregate(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let split = Split::whole(write_aggregate(dir.path())).unwrap();
    let config = InputConfig {
        input_type: InputType::Aggregates,
        record_element_name: Some("item".to_string()),
        id_field_name: Some("@id".to_string()),
        ..Default::default()
    };

    c.bench_function("aggregate_10k_records", |b| {
        b.iter(|| black_box(drain(ReaderKind::Aggregate, &split, &config)))
    });
}

criterion_group!(benches, bench_delimited, bench_aggregate);
criterion_main!(benches);
