//! Heading detection and section segmentation.
//!
//! Headings are found by position over the whole text rather than line by line, so a heading
//! is only ever a line of its own (`== History ==`), never a `==` run in the middle of a sentence.

use std::{ops::Range, sync::LazyLock};

use compact_str::CompactString;
use regex::Regex;

/// Name given to the text before the first heading.
pub const INTRODUCTION: &str = "Introduction";
/// Level assigned to the introduction (the article title level).
pub const INTRODUCTION_LEVEL: u32 = 1;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(={2,})([^=\n]+)(={2,})[ \t]*\r?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading<'a> {
    pub name: &'a str,
    pub level: u32,
    /// Byte range of the heading line, without its line break.
    pub span: Range<usize>,
}

/// Level of a heading from its `=` markers: the total count divided by two.
///
/// Unbalanced markers (`== a ===`) are rounded down, never below level 2.
pub fn heading_level(opening: usize, closing: usize) -> u32 {
    let level = (opening + closing) / 2;
    u32::try_from(level).unwrap_or(u32::MAX).max(2)
}

/// Find all heading lines in `text`, in document order.
pub fn scan_headings(text: &str) -> impl Iterator<Item = Heading<'_>> {
    HEADING.captures_iter(text).filter_map(|cap| {
        let line = cap.get(0)?;
        let name = cap.get(2)?.as_str().trim();
        if name.is_empty() {
            return None;
        }
        let opening = cap.get(1)?.len();
        let closing = cap.get(3)?.len();

        Some(Heading {
            name,
            level: heading_level(opening, closing),
            span: line.start()..line.end(),
        })
    })
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Section {
    pub name: CompactString,
    pub body: String,
    pub level: u32,
}

impl Section {
    fn new(name: &str, body: &str, level: u32) -> Self {
        Self {
            name: CompactString::from(name),
            body: body.trim().to_string(),
            level,
        }
    }
}

/// Split normalized text into its sections.
///
/// The text before the first heading always becomes an [`INTRODUCTION`] section, even when it
/// is empty. Sections with an empty body are kept, as are repeated heading names; callers decide
/// what to drop or merge.
pub fn segment(clean_text: &str) -> Vec<Section> {
    let mut sections = Vec::new();

    let mut name = INTRODUCTION;
    let mut level = INTRODUCTION_LEVEL;
    let mut body_start = 0;

    for heading in scan_headings(clean_text) {
        sections.push(Section::new(
            name,
            &clean_text[body_start..heading.span.start],
            level,
        ));

        name = heading.name;
        level = heading.level;
        body_start = heading.span.end;
    }

    sections.push(Section::new(name, &clean_text[body_start..], level));

    if sections.len() == 1 {
        tracing::trace!("no headings found, text is a single introduction section");
    }

    sections
}

/// Render sections in the cleaned text layout: a `=== name ===` banner per non-empty section.
pub fn render_sections(sections: &[Section]) -> String {
    let mut output = String::new();
    for section in sections.iter().filter(|s| !s.body.is_empty()) {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str("\n=== ");
        output.push_str(&section.name);
        output.push_str(" ===\n\n");
        output.push_str(&section.body);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::prelude::*;

    fn names_and_bodies(sections: &[Section]) -> Vec<(&str, &str)> {
        sections
            .iter()
            .map(|s| (s.name.as_str(), s.body.as_str()))
            .collect()
    }

    #[test]
    fn segments_nested_headings() {
        let text = "Intro text\n== History ==\nSome history\n=== Early ===\nDetails\n== Legacy ==\nFinal\n";
        let sections = segment(text);

        assert_eq!(
            names_and_bodies(&sections),
            vec![
                ("Introduction", "Intro text"),
                ("History", "Some history"),
                ("Early", "Details"),
                ("Legacy", "Final"),
            ]
        );
        let levels: Vec<u32> = sections.iter().map(|s| s.level).collect();
        assert_eq!(levels, vec![INTRODUCTION_LEVEL, 2, 3, 2]);
    }

    #[test]
    fn no_headings_is_one_introduction() {
        let sections = segment("  just some text\n\nover two paragraphs  ");
        assert_eq!(
            names_and_bodies(&sections),
            vec![("Introduction", "just some text\n\nover two paragraphs")]
        );
    }

    #[test]
    fn empty_sections_and_duplicates_are_kept() {
        let sections = segment("== A ==\n== B ==\nb\n== A ==\nagain");
        assert_eq!(
            names_and_bodies(&sections),
            vec![("Introduction", ""), ("A", ""), ("B", "b"), ("A", "again")]
        );
    }

    #[test]
    fn heading_markers_inside_a_line_are_text() {
        let sections = segment("a == b == c\nx ==y==");
        assert_eq!(sections.len(), 1);
    }

    #[test]
    fn heading_levels() {
        let text = "== a ==\n=== b ===\n  ==== c ====  \r\n== d ===\n=====\n== ==";
        let headings: Vec<(&str, u32)> = scan_headings(text).map(|h| (h.name, h.level)).collect();
        assert_eq!(headings, vec![("a", 2), ("b", 3), ("c", 4), ("d", 2)]);
    }

    #[test]
    fn renders_non_empty_sections() {
        let rendered = render_sections(&segment("Lead\n== Empty ==\n== Career ==\nWork"));
        assert_eq!(rendered, "\n=== Introduction ===\n\nLead\n\n=== Career ===\n\nWork");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 2000,
            ..ProptestConfig::default()
        })]
        #[test]
        fn segmentation_loses_no_text(input in proptest_support::sectioned_text()) {
            let sections = segment(&input);
            let heading_lines: Vec<&str> = scan_headings(&input).map(|h| &input[h.span]).collect();
            prop_assert_eq!(heading_lines.len() + 1, sections.len());

            let mut rebuilt = String::new();
            rebuilt.push_str(&sections[0].body);
            for (line, section) in heading_lines.iter().zip(&sections[1..]) {
                rebuilt.push('\n');
                rebuilt.push_str(line);
                rebuilt.push('\n');
                rebuilt.push_str(&section.body);
            }

            let words = |s: &str| s.split_whitespace().map(str::to_string).collect::<Vec<_>>();
            prop_assert_eq!(words(&rebuilt), words(&input));
        }

        #[test]
        fn text_without_headings_is_introduction(input in "[a-z .,\n]*") {
            let sections = segment(&input);
            prop_assert_eq!(sections.len(), 1);
            prop_assert_eq!(sections[0].name.as_str(), INTRODUCTION);
            prop_assert_eq!(sections[0].body.as_str(), input.trim());
        }
    }
}
