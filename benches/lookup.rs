use aqqu_frontend::mentions::{strip_entity_mentions, wikify_completion};
use aqqu_frontend::{EntityIndex, WikiInfo};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::OnceLock;

const ENTITIES: usize = 200_000;

fn index() -> &'static EntityIndex {
    static INDEX: OnceLock<EntityIndex> = OnceLock::new();
    INDEX.get_or_init(|| {
        let info = (0..ENTITIES).map(|i| {
            (
                format!("Q{i}"),
                WikiInfo::new(
                    format!("Article {i}"),
                    format!("https://upload.wikimedia.org/thumb/{i}.jpg"),
                    "A synthetic abstract used for benchmarking lookups.",
                ),
            )
        });
        let mids = (0..ENTITIES).map(|i| (format!("m.{i:x}"), format!("Q{i}")));
        EntityIndex::new(info, mids)
    })
}

fn bench_info_lookups(c: &mut Criterion) {
    let index = index();
    const QIDS: &[&str] = &["Q1", "q150000", " Q199999 ", "Q404404404"];
    for &qid in QIDS {
        let id = BenchmarkId::new("info_by_qid", qid.trim());
        c.bench_with_input(id, &qid, |b, &qid| {
            b.iter(|| black_box(index.info_by_qid(qid).title.len()));
        });
    }
    c.bench_function("info_by_mid", |b| {
        b.iter(|| black_box(index.info_by_mid("m.2a").url()));
    });
}

fn bench_completion_rewrites(c: &mut Criterion) {
    let index = index();
    const CASES: &[(&str, &[&str])] = &[
        ("who directed [Q12] ", &["Q12"]),
        ("[Q1] and [Q2] starred in [Q3]", &["Q1", "Q2", "Q3"]),
        ("how tall is [Q404404404] ", &["Q404404404"]),
    ];
    for (i, &(completion, qids)) in CASES.iter().enumerate() {
        c.bench_with_input(
            BenchmarkId::new("wikify_completion", i),
            &(completion, qids),
            |b, &(completion, qids)| {
                b.iter(|| black_box(wikify_completion(index, completion, qids)));
            },
        );
    }
    c.bench_function("strip_entity_mentions", |b| {
        b.iter(|| {
            black_box(strip_entity_mentions(
                "who played [Q1|Bar Film:Bar Film] in [nested [Q2]] films",
            ))
        });
    });
}

criterion_group!(benches, bench_info_lookups, bench_completion_rewrites);
criterion_main!(benches);
