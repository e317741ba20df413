use criterion::{criterion_group, criterion_main, Criterion, black_box};

use story_graph_server::graph::{EdgeKind, SledStoryGraph, StoryGraph};
use story_graph_server::prompts::parse_choice_set;

fn bench_story_context(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("kv")).unwrap();
    let graph = SledStoryGraph::open(db).unwrap();
    rt.block_on(async {
        graph.create_story("bench").await.unwrap();
        let mut prev = graph.create_node("bench", "Once upon a time.", true).await.unwrap();
        for i in 0..500 {
            let next = graph.create_node("bench", &format!("Paragraph {} of a long winding tale.", i), i % 2 == 0).await.unwrap();
            graph.create_edge(prev, next, EdgeKind::Choice, "onward").await.unwrap();
            prev = next;
        }
    });
    c.bench_function("story_context_500_nodes", |bch| {
        bch.iter(|| black_box(rt.block_on(graph.get_story_context("bench")).unwrap()));
    });
}

fn bench_choice_parsing(c: &mut Criterion) {
    let json = r#"```json
{"choice_type": "setting", "choices": ["A drowned city", "A desert monastery", "A moon colony", "A haunted forest"]}
```"#;
    let list = "Choice type: setting\n1. A drowned city\n2. A desert monastery\n3. A moon colony\n4. A haunted forest";
    c.bench_function("parse_choice_set_json", |bch| bch.iter(|| black_box(parse_choice_set(black_box(json)))));
    c.bench_function("parse_choice_set_list", |bch| bch.iter(|| black_box(parse_choice_set(black_box(list)))));
}

criterion_group!(benches, bench_story_context, bench_choice_parsing);
criterion_main!(benches);
