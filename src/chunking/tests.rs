use super::*;

fn numbered_lines(count: usize) -> String {
    (1..=count)
        .map(|i| format!("line {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn spans_of(outcome: &ChunkOutcome) -> Vec<(usize, usize)> {
    outcome
        .chunks
        .iter()
        .map(|c| (c.start_line, c.end_line))
        .collect()
}

struct FixedSpans(Vec<LineSpan>);

impl StructuralParser for FixedSpans {
    fn supports(&self, language: Language) -> bool {
        language == Language::Rust
    }

    fn top_level_spans(&self, _text: &str, _language: Language) -> crate::Result<Vec<LineSpan>> {
        Ok(self.0.clone())
    }
}

struct AlwaysFails;

impl StructuralParser for AlwaysFails {
    fn supports(&self, _language: Language) -> bool {
        true
    }

    fn top_level_spans(&self, _text: &str, _language: Language) -> crate::Result<Vec<LineSpan>> {
        Err(crate::WeaveError::Chunking("boom".to_string()))
    }
}

#[test]
fn example_files_chunk_as_expected() {
    let chunker = Chunker::new(ChunkingConfig::default());

    let large = chunker.chunk(&numbered_lines(200), Language::Unknown);
    assert_eq!(spans_of(&large), vec![(1, 120), (101, 200)]);

    let medium = chunker.chunk(&numbered_lines(50), Language::Unknown);
    assert_eq!(spans_of(&medium), vec![(1, 50)]);

    let small = chunker.chunk(&numbered_lines(10), Language::Unknown);
    assert_eq!(spans_of(&small), vec![(1, 10)]);

    let mut hashes: Vec<String> = large
        .chunks
        .iter()
        .chain(&medium.chunks)
        .chain(&small.chunks)
        .map(Chunk::chunk_hash)
        .collect();
    hashes.sort();
    hashes.dedup();
    assert_eq!(hashes.len(), 4);
}

#[test]
fn windows_respect_size_and_overlap() {
    let config = ChunkingConfig {
        max_chunk_lines: 37,
        overlap_lines: 9,
    };
    let chunker = Chunker::line_based(config);
    let outcome = chunker.chunk(&numbered_lines(541), Language::Unknown);

    assert!(outcome.chunks.len() > 1);
    for chunk in &outcome.chunks {
        assert!(chunk.line_count() <= 37);
    }
    for pair in outcome.chunks.windows(2) {
        assert_eq!(pair[0].end_line + 1 - pair[1].start_line, 9);
    }
    assert_eq!(outcome.chunks[0].start_line, 1);
    assert_eq!(outcome.chunks.last().map(|c| c.end_line), Some(541));
}

#[test]
fn chunk_text_matches_line_range() {
    let chunker = Chunker::line_based(ChunkingConfig {
        max_chunk_lines: 3,
        overlap_lines: 1,
    });
    let outcome = chunker.chunk("a\nb\nc\nd\ne", Language::Unknown);

    assert_eq!(spans_of(&outcome), vec![(1, 3), (3, 5)]);
    assert_eq!(outcome.chunks[0].text, "a\nb\nc");
    assert_eq!(outcome.chunks[1].text, "c\nd\ne");
}

#[test]
fn whitespace_only_chunks_are_dropped() {
    let chunker = Chunker::line_based(ChunkingConfig {
        max_chunk_lines: 4,
        overlap_lines: 0,
    });

    assert!(chunker.chunk("", Language::Unknown).chunks.is_empty());
    assert!(chunker.chunk("  \n\t\n\n", Language::Unknown).chunks.is_empty());

    let outcome = chunker.chunk("x\n\n\n\n\n\n\n\n\ny", Language::Unknown);
    assert_eq!(spans_of(&outcome), vec![(1, 4), (9, 10)]);
}

#[test]
fn structural_boundaries_are_packed_and_split() {
    let config = ChunkingConfig {
        max_chunk_lines: 10,
        overlap_lines: 2,
    };
    let parser = FixedSpans(vec![
        LineSpan::new(3, 6),
        LineSpan::new(7, 9),
        LineSpan::new(12, 26),
    ]);
    let chunker = Chunker::with_parser(config, Arc::new(parser));
    let outcome = chunker.chunk(&numbered_lines(30), Language::Rust);

    assert_eq!(outcome.fallback_warning, None);
    // 1-2 gap + 3-6 + 7-9 pack into one chunk; the 10-11 gap starts the next one, the 15 line unit
    // is split with overlap and the trailing gap stands alone
    assert_eq!(
        spans_of(&outcome),
        vec![(1, 9), (10, 11), (12, 21), (20, 26), (27, 30)]
    );
    for chunk in &outcome.chunks {
        assert!(chunk.line_count() <= 10);
    }
}

#[test]
fn parser_failure_falls_back_with_warning() {
    let config = ChunkingConfig {
        max_chunk_lines: 10,
        overlap_lines: 2,
    };
    let chunker = Chunker::with_parser(config, Arc::new(AlwaysFails));
    let outcome = chunker.chunk(&numbered_lines(20), Language::Python);

    assert!(outcome.fallback_warning.is_some());
    assert_eq!(spans_of(&outcome), vec![(1, 10), (9, 18), (17, 20)]);
}

#[test]
fn unsupported_language_skips_parser() {
    let config = ChunkingConfig {
        max_chunk_lines: 10,
        overlap_lines: 0,
    };
    let chunker = Chunker::with_parser(config, Arc::new(AlwaysFails));
    let parser = FixedSpans(vec![LineSpan::new(1, 2)]);
    let rust_only = Chunker::with_parser(config, Arc::new(parser));

    let outcome = rust_only.chunk(&numbered_lines(15), Language::Go);
    assert_eq!(spans_of(&outcome), vec![(1, 10), (11, 15)]);

    // Small files never reach the parser
    let outcome = chunker.chunk(&numbered_lines(8), Language::Rust);
    assert_eq!(outcome.fallback_warning, None);
    assert_eq!(spans_of(&outcome), vec![(1, 8)]);
}

#[test]
fn real_rust_source_aligns_to_functions() {
    let mut source = String::new();
    for i in 0..6 {
        source.push_str(&format!("fn f{i}() {{\n"));
        for _ in 0..28 {
            source.push_str("    let x = 1;\n");
        }
        source.push_str("}\n");
    }

    let outcome = Chunker::new(ChunkingConfig::default()).chunk(&source, Language::Rust);
    assert_eq!(outcome.fallback_warning, None);
    assert_eq!(spans_of(&outcome), vec![(1, 120), (121, 180)]);
    assert!(outcome.chunks[1].text.starts_with("fn f4()"));
}

#[test]
fn broken_rust_source_falls_back() {
    let mut source = String::from("fn broken( {\n");
    for _ in 0..129 {
        source.push_str("    let x = 1;\n");
    }

    let outcome = Chunker::new(ChunkingConfig::default()).chunk(&source, Language::Rust);
    assert!(outcome.fallback_warning.is_some());
    assert_eq!(spans_of(&outcome), vec![(1, 120), (101, 130)]);
}

#[test]
fn chunking_is_deterministic() {
    let chunker = Chunker::new(ChunkingConfig::default());
    let source = numbered_lines(333);

    let first = chunker.chunk(&source, Language::Unknown);
    let second = chunker.chunk(&source, Language::Unknown);
    assert_eq!(first, second);
}

#[test]
fn language_detection() {
    assert_eq!(Language::from_path(Path::new("src/lib.rs")), Language::Rust);
    assert_eq!(Language::from_path(Path::new("app/main.PY")), Language::Python);
    assert_eq!(Language::from_path(Path::new("ui/App.tsx")), Language::Tsx);
    assert_eq!(Language::from_path(Path::new("index.mjs")), Language::JavaScript);
    assert_eq!(Language::from_path(Path::new("config.yaml")), Language::Unknown);
    assert_eq!(Language::from_path(Path::new("Makefile")), Language::Unknown);
}
