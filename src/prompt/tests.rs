use super::*;
use crate::retrieval::ItemSource;
use crate::tokenizer::HeuristicCounter;

fn config(token_budget: usize, policy: OversizedPolicy) -> PromptConfig {
    PromptConfig {
        token_budget,
        reserve_reply_tokens: 200,
        tokenizer: TokenizerKind::Heuristic,
        oversized_policy: policy,
        ..PromptConfig::default()
    }
}

fn assembler(token_budget: usize, policy: OversizedPolicy) -> ContextAssembler {
    ContextAssembler::new(config(token_budget, policy), Arc::new(HeuristicCounter))
}

fn item(index: usize, lines: usize) -> ContextItem {
    ContextItem {
        repo_path: "/repos/app".to_string(),
        file_path: format!("src/file_{index:02}.rs"),
        start_line: 1,
        end_line: lines,
        text: (1..=lines)
            .map(|i| format!("let value_{i} = compute({i});"))
            .collect::<Vec<_>>()
            .join("\n"),
        score: 0.5,
        source: ItemSource::Search,
    }
}

fn heading(item: &ContextItem) -> String {
    format!("### {}/{}:", item.repo_path, item.file_path)
}

#[test]
fn small_context_is_one_part() {
    let assembler = assembler(4000, OversizedPolicy::Isolate);
    let items = vec![item(1, 3), item(2, 3)];

    let context = assembler
        .assemble("where is compute defined?", &items)
        .expect("assembles");

    assert_eq!(context.parts.len(), 1);
    let part = &context.parts[0];
    assert!(part.starts_with(ROLE));
    assert!(part.contains("## Question\nwhere is compute defined?"));
    assert!(part.contains("# Context Data\n"));
    assert!(part.contains("\n### /repos/app/src/file_01.rs:1-3 (score=0.5000)\n```\nlet value_1"));
    assert!(part.ends_with(FOOTER));
    assert!(!part.contains("[PART"));
    assert_eq!(context.tokens_per_part, vec![HeuristicCounter.count_tokens(part)]);
    assert_eq!(context.total_tokens, context.tokens_per_part[0]);
}

#[test]
fn parts_respect_the_budget_and_keep_blocks_whole() {
    let assembler = assembler(2000, OversizedPolicy::Isolate);
    let items: Vec<ContextItem> = (0..30).map(|i| item(i, 20)).collect();

    let context = assembler.assemble("compute", &items).expect("assembles");
    let total = context.parts.len();

    assert!(total >= 2);
    for (index, part) in context.parts.iter().enumerate() {
        assert!(HeuristicCounter.count_tokens(part) <= assembler.part_budget());
        assert!(part.contains(&format!("# [PART {}/{}] Context Data", index + 1, total)));
        assert_eq!(part.starts_with(ROLE), index == 0);
        if index + 1 < total {
            assert!(part.ends_with(CONTINUATION));
            assert!(part.contains("Do not answer yet"));
        } else {
            assert!(part.ends_with(FOOTER));
        }
    }

    // Every block lands in exactly one part, in ranking order
    let mut order = Vec::new();
    for part in &context.parts {
        for (index, item) in items.iter().enumerate() {
            if part.contains(&heading(item)) {
                order.push(index);
            }
        }
    }
    assert_eq!(order, (0..30).collect::<Vec<_>>());
    assert_eq!(
        context.total_tokens,
        context.tokens_per_part.iter().sum::<usize>()
    );
}

#[test]
fn oversized_block_gets_its_own_part() {
    let assembler = assembler(2000, OversizedPolicy::Isolate);
    let items = vec![item(1, 5), item(2, 400), item(3, 5)];

    let context = assembler.assemble("compute", &items).expect("assembles");

    assert_eq!(context.parts.len(), 3);
    let big = &context.parts[1];
    assert!(big.contains(&heading(&items[1])));
    assert!(!big.contains(&heading(&items[0])));
    assert!(!big.contains(&heading(&items[2])));
    assert!(context.tokens_per_part[1] > assembler.part_budget());
    assert!(context.tokens_per_part[0] <= assembler.part_budget());
    assert!(context.tokens_per_part[2] <= assembler.part_budget());
}

#[test]
fn truncate_policy_cuts_the_block() {
    let assembler = assembler(2000, OversizedPolicy::Truncate);
    let items = vec![item(1, 400)];

    let context = assembler.assemble("compute", &items).expect("assembles");

    assert_eq!(context.parts.len(), 1);
    assert!(context.parts[0].contains(TRUNCATION_MARKER));
    assert!(context.parts[0].contains("let value_1 = compute(1);"));
    assert!(!context.parts[0].contains("let value_400 = compute(400);"));
    assert!(context.tokens_per_part[0] <= assembler.part_budget());
}

/// Whitespace-separated words, plus a surcharge when a block shares a part with the header
struct FramedCounter;

impl TokenCounter for FramedCounter {
    fn count_tokens(&self, text: &str) -> usize {
        let words = text.split_whitespace().count();
        if text.contains("## Task") && text.contains("\n### ") {
            words + 100
        } else {
            words
        }
    }

    fn name(&self) -> &'static str {
        "framed"
    }
}

/// Budget where the lone block fits on its own but not once rendered with the header
fn framed_assembler(policy: OversizedPolicy) -> ContextAssembler {
    let sizing = ContextAssembler::new(config(100_000, policy), Arc::new(FramedCounter));
    let frame = FramedCounter.count_tokens(&sizing.skeleton("compute", 1));
    let block = FramedCounter.count_tokens(&ContextAssembler::render_block(&item(1, 30)));
    ContextAssembler::new(
        config(frame + block + 10 + 200, policy),
        Arc::new(FramedCounter),
    )
}

#[test]
fn lone_block_is_measured_in_its_rendered_part() {
    let assembler = framed_assembler(OversizedPolicy::Truncate);

    let context = assembler
        .assemble("compute", &[item(1, 30)])
        .expect("assembles");

    assert_eq!(context.parts.len(), 1);
    assert!(context.parts[0].contains(TRUNCATION_MARKER));
    assert!(context.tokens_per_part[0] <= assembler.part_budget());
}

#[test]
fn lone_block_under_isolate_is_left_whole() {
    let assembler = framed_assembler(OversizedPolicy::Isolate);
    let items = vec![item(1, 30)];

    let context = assembler.assemble("compute", &items).expect("assembles");

    assert_eq!(context.parts.len(), 1);
    assert!(context.parts[0].contains("let value_30 = compute(30);"));
    assert!(!context.parts[0].contains(TRUNCATION_MARKER));
    assert!(context.tokens_per_part[0] > assembler.part_budget());
}

#[test]
fn budget_below_the_frame_is_rejected() {
    let assembler = assembler(300, OversizedPolicy::Isolate);

    assert!(matches!(
        assembler.assemble("compute", &[item(1, 3)]),
        Err(WeaveError::InvalidInput(_))
    ));
}

#[test]
fn empty_context_still_renders() {
    let context = assembler(4000, OversizedPolicy::Isolate)
        .assemble("anything?", &[])
        .expect("assembles");

    assert_eq!(context.parts.len(), 1);
    assert!(context.parts[0].contains(EMPTY_CONTEXT));
}

#[test]
fn packing_is_deterministic() {
    let items: Vec<ContextItem> = (0..12).map(|i| item(i, 15)).collect();

    let first = assembler(1500, OversizedPolicy::Isolate)
        .assemble("compute", &items)
        .expect("assembles");
    let second = assembler(1500, OversizedPolicy::Isolate)
        .assemble("compute", &items)
        .expect("assembles");

    assert_eq!(first, second);
}

#[test]
fn greedy_grouping() {
    assert_eq!(pack(&[4, 4, 4, 4], 8), vec![vec![0, 1], vec![2, 3]]);
    assert_eq!(pack(&[2, 20, 2], 8), vec![vec![0], vec![1], vec![2]]);
    assert!(pack(&[], 8).is_empty());
}
