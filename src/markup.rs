//! Wikitext to plain text.
//!
//! The normalizer is an ordered cascade of [`Rule`]s. Each rule is plain data (a literal or a
//! regex plus its replacement), so the order and composition of the cascade can be inspected,
//! tested rule by rule and extended with [`Normalizer::with_rules`].
//!
//! The contract is best effort: the categories of markup named in [`DEFAULT_RULES`] are removed,
//! stray punctuation from malformed input may survive. The whole cascade is re-run until the text
//! stops changing, which keeps [`normalize`] idempotent even when a removal exposes new markup
//! (`{<br>{x}}` only becomes a template once the tag is gone).

use std::{borrow::Cow, sync::LazyLock};

use memchr::memmem;
use regex::Regex;

use crate::utils::{regex_replace_opt, str_replace_opt, trim_in_place};

// the cascade only ever shortens the text, so this is never reached on real input
const MAX_PASSES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// `pattern` is matched verbatim.
    Literal,
    /// `pattern` is a `regex` crate expression; `replacement` may refer to capture groups.
    Regex,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Rule {
    pub name: Cow<'static, str>,
    pub kind: RuleKind,
    pub pattern: Cow<'static, str>,
    #[serde(default)]
    pub replacement: Cow<'static, str>,
    /// Apply the rule until it no longer matches (nested constructs are removed inside out).
    #[serde(default)]
    pub repeat: bool,
}

impl Rule {
    pub const fn literal(
        name: &'static str,
        pattern: &'static str,
        replacement: &'static str,
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind: RuleKind::Literal,
            pattern: Cow::Borrowed(pattern),
            replacement: Cow::Borrowed(replacement),
            repeat: false,
        }
    }

    pub const fn regex(
        name: &'static str,
        pattern: &'static str,
        replacement: &'static str,
    ) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind: RuleKind::Regex,
            pattern: Cow::Borrowed(pattern),
            replacement: Cow::Borrowed(replacement),
            repeat: false,
        }
    }

    pub const fn strip(name: &'static str, pattern: &'static str) -> Self {
        Self::regex(name, pattern, "")
    }

    /// A removal applied until it no longer matches, for constructs that nest.
    pub const fn strip_nested(name: &'static str, pattern: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            kind: RuleKind::Regex,
            pattern: Cow::Borrowed(pattern),
            replacement: Cow::Borrowed(""),
            repeat: true,
        }
    }
}

/// The standard cascade. Order matters:
/// entities are decoded first so escaped tags are seen as tags, references go before generic
/// tags so their content is dropped with them, templates and tables go before links and
/// whitespace so nested braces cannot leak fragments into the text. Templates, template
/// parameters (`{{{1|default}}}`) and tables are removed innermost first.
pub const DEFAULT_RULES: &[Rule] = &[
    // 1. entities
    Rule::literal("entity-lt", "&lt;", "<"),
    Rule::literal("entity-gt", "&gt;", ">"),
    Rule::literal("entity-amp", "&amp;", "&"),
    // 2. removals
    Rule::strip("html-comment", r"(?s)<!--.*?-->"),
    // a parameter is tried first at each position so `{{{1}}}` is never read as `{{1}}`
    Rule::strip_nested("template", r"\{\{\{[^{}]*\}\}\}|\{\{[^{}]*\}\}"),
    // the body of the innermost table holds no `{|`
    Rule::strip_nested("table", r"(?s)\{\|(?:[^{]|\{[^|])*?\|\}"),
    // captions may contain one level of links: [[File:a.jpg|thumb|A [[b|c]] [//d e]]]
    Rule::strip(
        "file-embed",
        r"(?i)\[\[\s*(?:file|image)\s*:[^\[\]]*(?:(?:\[\[[^\[\]]*\]\]|\[[^\[\]]*\])[^\[\]]*)*\]\]",
    ),
    Rule::strip("reference", r"(?s)<ref(?:\s[^>]*[^/>])?>.*?</ref\s*>"),
    Rule::strip("reference-self-closing", r"<ref[^>]*/>"),
    Rule::strip("html-tag", r"</?[a-zA-Z][^<>]*>"),
    Rule::strip("category", r"(?i)\[\[\s*category\s*:[^\]]*\]\]"),
    Rule::strip("interlanguage-link", r"\[\[[a-z\-]+:[^\]]+\]\]"),
    Rule::strip("external-link", r"\[(?:https?:)?//[^\]]*\]"),
    // 3. internal links keep their display text
    Rule::regex("internal-link", r"\[\[(?:[^\[\]|]*\|)*([^\[\]|]*)\]\]", "${1}"),
    // 4. whitespace
    Rule::regex("line-endings", r"\r\n?", "\n"),
    Rule::regex("horizontal-space", r"[^\S\n]+", " "),
    Rule::regex("newline-run", r" ?\n\s*", "\n"),
];

#[derive(Debug)]
enum Matcher {
    Literal(memmem::Finder<'static>),
    Regex(Regex),
}

#[derive(Debug)]
struct CompiledRule {
    rule: Rule,
    matcher: Matcher,
}

impl CompiledRule {
    fn apply_once(
        &self,
        text: String,
        scratch_buffer: String,
        did_replace: &mut bool,
    ) -> (String, String) {
        let replacement = self.rule.replacement.as_ref();
        match &self.matcher {
            Matcher::Literal(finder) => {
                str_replace_opt(text, finder, replacement, scratch_buffer, did_replace)
            }
            Matcher::Regex(regex) => {
                regex_replace_opt(text, regex, replacement, scratch_buffer, did_replace)
            }
        }
    }

    fn apply(
        &self,
        mut text: String,
        mut scratch_buffer: String,
        changed: &mut bool,
    ) -> (String, String) {
        let mut did_replace = true;
        while did_replace {
            (text, scratch_buffer) = self.apply_once(text, scratch_buffer, &mut did_replace);
            *changed |= did_replace;
            if !self.rule.repeat {
                break;
            }
        }
        (text, scratch_buffer)
    }
}

#[derive(Debug)]
pub struct Normalizer {
    rules: Vec<CompiledRule>,
}

impl Normalizer {
    pub fn with_rules<I: IntoIterator<Item = Rule>>(rules: I) -> Result<Self, regex::Error> {
        let rules = rules
            .into_iter()
            .map(|rule| -> Result<CompiledRule, regex::Error> {
                let matcher = match rule.kind {
                    RuleKind::Literal => {
                        Matcher::Literal(memmem::Finder::new(rule.pattern.as_bytes()).into_owned())
                    }
                    RuleKind::Regex => Matcher::Regex(Regex::new(&rule.pattern)?),
                };
                Ok(CompiledRule { rule, matcher })
            })
            .collect::<Result<_, regex::Error>>()?;

        Ok(Self { rules })
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().map(|compiled| &compiled.rule)
    }

    /// Run a single rule by name, mostly useful to test the cascade step by step.
    pub fn apply_rule(&self, name: &str, text: &str) -> Option<String> {
        let compiled = self.rules.iter().find(|c| c.rule.name == name)?;
        let mut changed = false;
        let (text, _) = compiled.apply(text.to_string(), String::new(), &mut changed);
        Some(text)
    }

    pub fn normalize(&self, raw_text: &str) -> String {
        let mut text = raw_text.to_string();
        let mut scratch_buffer = String::new();

        for pass in 0..MAX_PASSES {
            let mut changed = false;

            for compiled in &self.rules {
                (text, scratch_buffer) = compiled.apply(text, scratch_buffer, &mut changed);
            }

            let len = text.len();
            text = trim_in_place(text);
            changed |= text.len() != len;

            if !changed {
                return text;
            }
            tracing::trace!(
                pass,
                len = text.len(),
                "markup cascade changed the text, running again"
            );
        }

        tracing::debug!(
            message = "markup cascade did not settle, returning the last pass",
            passes = MAX_PASSES
        );
        text
    }
}

static DEFAULT_NORMALIZER: LazyLock<Normalizer> = LazyLock::new(|| {
    Normalizer::with_rules(DEFAULT_RULES.iter().cloned()).expect("default markup rules are valid")
});

pub fn default_normalizer() -> &'static Normalizer {
    &DEFAULT_NORMALIZER
}

/// Strip wiki markup from a revision body using [`DEFAULT_RULES`].
pub fn normalize(raw_text: &str) -> String {
    DEFAULT_NORMALIZER.normalize(raw_text)
}
