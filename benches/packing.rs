use criterion::{Criterion, criterion_group, criterion_main};
use codeweave::prompt::{ContextAssembler, PromptConfig};
use codeweave::retrieval::{ContextItem, ItemSource};
use codeweave::tokenizer::{TokenizerKind, token_counter};
use std::hint::black_box;

fn items(count: usize) -> Vec<ContextItem> {
    (0..count)
        .map(|index| ContextItem {
            repo_path: "/repos/service".to_string(),
            file_path: format!("src/module_{index:03}.rs"),
            start_line: 1,
            end_line: 60,
            text: (1..=60)
                .map(|line| format!("    let field_{line} = record.get({line})?;"))
                .collect::<Vec<_>>()
                .join("\n"),
            score: 1.0 - index as f32 / count as f32,
            source: ItemSource::Search,
        })
        .collect()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let items = items(50);

    for tokenizer in [TokenizerKind::Cl100k, TokenizerKind::Heuristic] {
        let config = PromptConfig {
            token_budget: 8000,
            tokenizer,
            ..PromptConfig::default()
        };
        let counter = token_counter(tokenizer).expect("tokenizer loads");
        let assembler = ContextAssembler::new(config, counter);
        c.bench_function(&format!("packing_{}", tokenizer.as_str()), |b| {
            b.iter(|| assembler.assemble(black_box("how are records read?"), black_box(&items)));
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
