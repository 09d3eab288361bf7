//! Heuristic split of free-form patch-note text into categorized change entries.
//!
//! Lines are checked against an ordered table of predicates: change line first,
//! then heading, then the keyword fallback. A line matching none is dropped.
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Buff,
    Nerf,
    Fix,
    Rework,
    New,
    Removal,
    Adjustment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    pub category: Option<String>,
    pub description: String,
    pub change_type: ChangeType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedPatchNote {
    pub title: Option<String>,
    pub changes: Vec<ChangeEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineClass {
    Change,
    Heading,
    KeywordFallback,
}

/// Evaluated top to bottom; the first match wins.
const LINE_RULES: &[(LineClass, fn(&str) -> bool)] = &[
    (LineClass::Change, is_change_line),
    (LineClass::Heading, is_heading),
    (LineClass::KeywordFallback, is_keyword_line),
];

const CHANGE_KEYWORDS: &[&str] = &[
    "buff",
    "nerf",
    "rework",
    "fix",
    "increase",
    "decrease",
    "damage",
    "reduce",
    "cooldown",
    "health",
    "armor",
    "speed",
    "added",
    "removed",
    "adjust",
];

macro_rules! cached_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("static regex"))
        }
    };
}

cached_regex!(bullet_re, r"^\s*(?:[-*•·+]|\d+[.)])\s+");
cached_regex!(leading_number_re, r"^\s*[+\-−]?\d+(?:[.,]\d+)?%?");
cached_regex!(arrow_re, r"(\d+(?:[.,]\d+)?)\s*%?\s*(?:->|→|=>)\s*(\d+(?:[.,]\d+)?)");
cached_regex!(percent_re, r"\d+(?:[.,]\d+)?\s*%");
cached_regex!(heading_marker_re, r"^\s*#{1,6}\s*");
cached_regex!(fix_re, r"(?i)\b(?:fix(?:ed|es)?|bugs?|crash(?:es)?|issues?|resolved)\b");
cached_regex!(removal_re, r"(?i)\b(?:remov(?:ed|es|e)|no longer|deleted)\b");
cached_regex!(rework_re, r"(?i)\b(?:rework(?:ed)?|redesign(?:ed)?|overhaul(?:ed)?|revamp(?:ed)?)\b");
cached_regex!(new_re, r"(?i)\b(?:new|added|adds|introduc(?:ed|es|ing))\b");
cached_regex!(buff_re, r"(?i)\b(?:buff(?:ed)?|increase[sd]?|improved?|higher|faster|stronger|more)\b");
cached_regex!(nerf_re, r"(?i)\b(?:nerf(?:ed)?|decrease[sd]?|reduced?|lower|slower|weaker|less)\b");

pub fn is_change_line(line: &str) -> bool {
    bullet_re().is_match(line)
        || leading_number_re().is_match(line)
        || arrow_re().is_match(line)
        || percent_re().is_match(line)
}

pub fn is_heading(line: &str) -> bool {
    let trimmed = line.trim();
    if heading_marker_re().is_match(trimmed) {
        return true;
    }
    let has_letters = trimmed.chars().any(char::is_alphabetic);
    if has_letters && trimmed.chars().count() <= 60 && !trimmed.chars().any(char::is_lowercase) {
        return true;
    }
    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if !words.is_empty() && words.len() <= 8 {
        let capitalized = words
            .iter()
            .filter(|w| w.chars().next().is_some_and(char::is_uppercase))
            .count();
        if capitalized * 10 >= words.len() * 6 {
            return true;
        }
    }
    trimmed.chars().count() <= 20 && !trimmed.ends_with('.')
}

pub fn is_keyword_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    CHANGE_KEYWORDS.iter().any(|k| lower.contains(k))
        || line
            .chars()
            .any(|c| c.is_ascii_digit() || matches!(c, '%' | '→'))
        || line.contains("->")
}

pub fn classify_line(line: &str) -> Option<LineClass> {
    LINE_RULES
        .iter()
        .find(|(_, matches)| matches(line))
        .map(|(class, _)| *class)
}

fn strip_heading(line: &str) -> String {
    let text = heading_marker_re().replace(line.trim(), "");
    text.trim().trim_end_matches(':').trim().to_string()
}

fn strip_bullet(line: &str) -> String {
    bullet_re().replace(line, "").trim().to_string()
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', ".").parse().ok()
}

pub fn guess_change_type(description: &str, category: Option<&str>) -> ChangeType {
    if fix_re().is_match(description) {
        return ChangeType::Fix;
    }
    if removal_re().is_match(description) {
        return ChangeType::Removal;
    }
    if rework_re().is_match(description) {
        return ChangeType::Rework;
    }
    if new_re().is_match(description) {
        return ChangeType::New;
    }
    if let Some(caps) = arrow_re().captures(description) {
        let from = caps.get(1).and_then(|m| parse_number(m.as_str()));
        let to = caps.get(2).and_then(|m| parse_number(m.as_str()));
        if let (Some(from), Some(to)) = (from, to) {
            if to > from {
                return ChangeType::Buff;
            }
            if to < from {
                return ChangeType::Nerf;
            }
        }
    }
    if buff_re().is_match(description) {
        return ChangeType::Buff;
    }
    if nerf_re().is_match(description) {
        return ChangeType::Nerf;
    }
    match description.trim_start().chars().next() {
        Some('+') => return ChangeType::Buff,
        Some('-' | '−') => return ChangeType::Nerf,
        _ => {}
    }
    if let Some(category) = category {
        if fix_re().is_match(category) {
            return ChangeType::Fix;
        }
        if new_re().is_match(category) {
            return ChangeType::New;
        }
    }
    ChangeType::Adjustment
}

/// Title, then change entries in input order. Pure: equal input gives equal output.
pub fn parse(raw: &str) -> ParsedPatchNote {
    let mut lines = raw.lines().map(str::trim_end).filter(|l| !l.trim().is_empty()).peekable();
    let mut parsed = ParsedPatchNote::default();

    if let Some(first) = lines.peek() {
        if !is_change_line(first) {
            let title = strip_heading(first);
            parsed.title = (!title.is_empty()).then_some(title);
            lines.next();
        }
    }

    let mut category: Option<String> = None;
    for line in lines {
        match classify_line(line) {
            Some(LineClass::Heading) => {
                let heading = strip_heading(line);
                category = (!heading.is_empty()).then_some(heading);
            }
            Some(LineClass::Change) | Some(LineClass::KeywordFallback) => {
                let description = strip_bullet(line);
                if description.is_empty() {
                    continue;
                }
                let change_type = guess_change_type(&description, category.as_deref());
                parsed.changes.push(ChangeEntry {
                    category: category.clone(),
                    description,
                    change_type,
                });
            }
            None => {}
        }
    }
    parsed
}
