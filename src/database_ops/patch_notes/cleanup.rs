//! Display-only cleanup of a stored change record. Never persisted.
use super::diff::{ChangeRecord, Diff, DiffOp};

/// Share of the longer neighbouring change an equality must exceed to stay separate.
const SIGNIFICANT_EQUALITY_RATIO: f64 = 0.30;
const MIN_SIGNIFICANT_WORD: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Same(String),
    Change { deleted: String, inserted: String },
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '\''
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Merges adjacent same-op tuples, drops empty ones and groups each run of
/// edits between equalities into one change.
fn segments(diffs: &[Diff]) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::new();
    for d in diffs.iter().filter(|d| !d.text.is_empty()) {
        match (d.op, out.last_mut()) {
            (DiffOp::Equal, Some(Segment::Same(s))) => s.push_str(&d.text),
            (DiffOp::Equal, _) => out.push(Segment::Same(d.text.clone())),
            (DiffOp::Delete, Some(Segment::Change { deleted, .. })) => deleted.push_str(&d.text),
            (DiffOp::Insert, Some(Segment::Change { inserted, .. })) => inserted.push_str(&d.text),
            (DiffOp::Delete, _) => out.push(Segment::Change {
                deleted: d.text.clone(),
                inserted: String::new(),
            }),
            (DiffOp::Insert, _) => out.push(Segment::Change {
                deleted: String::new(),
                inserted: d.text.clone(),
            }),
        }
    }
    out
}

/// Re-joins neighbouring segments of the same variant and drops empty ones.
fn normalize(segs: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segs.len());
    for seg in segs {
        match seg {
            Segment::Same(s) if s.is_empty() => {}
            Segment::Change { deleted, inserted } if deleted.is_empty() && inserted.is_empty() => {}
            Segment::Same(s) => match out.last_mut() {
                Some(Segment::Same(prev)) => prev.push_str(&s),
                _ => out.push(Segment::Same(s)),
            },
            Segment::Change { deleted, inserted } => match out.last_mut() {
                Some(Segment::Change {
                    deleted: d,
                    inserted: i,
                }) => {
                    d.push_str(&deleted);
                    i.push_str(&inserted);
                }
                _ => out.push(Segment::Change { deleted, inserted }),
            },
        }
    }
    out
}

fn is_noise(deleted: &str, inserted: &str) -> bool {
    let (d, i) = (char_len(deleted), char_len(inserted));
    if d > 1 || i > 1 {
        return false;
    }
    let punctuation_only = deleted
        .chars()
        .chain(inserted.chars())
        .all(|c| c.is_whitespace() || c.is_ascii_punctuation());
    let case_only = d == 1
        && i == 1
        && deleted != inserted
        && deleted.to_lowercase() == inserted.to_lowercase();
    punctuation_only || case_only
}

/// Single-character punctuation, whitespace or case changes become unchanged
/// text from the new revision. A record made of nothing but such a change keeps it.
fn suppress_noise(segs: Vec<Segment>) -> Vec<Segment> {
    if !segs.iter().any(|s| matches!(s, Segment::Same(_))) {
        return segs;
    }
    let out = segs
        .into_iter()
        .map(|seg| match seg {
            Segment::Change { deleted, inserted } if is_noise(&deleted, &inserted) => {
                Segment::Same(inserted)
            }
            other => other,
        })
        .collect();
    normalize(out)
}

fn change_weight(seg: &Segment) -> usize {
    match seg {
        Segment::Change { deleted, inserted } => char_len(deleted).max(char_len(inserted)),
        Segment::Same(_) => 0,
    }
}

fn ends_at_boundary(seg: &Segment) -> bool {
    match seg {
        Segment::Change { deleted, inserted } => [deleted, inserted]
            .iter()
            .all(|s| s.chars().last().map_or(true, |c| !is_word_char(c))),
        Segment::Same(_) => true,
    }
}

fn starts_at_boundary(seg: &Segment) -> bool {
    match seg {
        Segment::Change { deleted, inserted } => [deleted, inserted]
            .iter()
            .all(|s| s.chars().next().map_or(true, |c| !is_word_char(c))),
        Segment::Same(_) => true,
    }
}

/// Whether `eq` holds a complete word of at least four characters. A word
/// touching an edge of `eq` only counts when the neighbouring change ends
/// (or starts) on a non-word character.
fn has_whole_word(eq: &str, left_open: bool, right_open: bool) -> bool {
    let chars: Vec<char> = eq.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if !is_word_char(chars[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < chars.len() && is_word_char(chars[i]) {
            i += 1;
        }
        let bounded_left = start > 0 || left_open;
        let bounded_right = i < chars.len() || right_open;
        if i - start >= MIN_SIGNIFICANT_WORD && bounded_left && bounded_right {
            return true;
        }
    }
    false
}

fn ends_sentence(eq: &str) -> bool {
    matches!(eq.trim_end().chars().last(), Some('.' | '!' | '?'))
}

fn is_significant(eq: &str, left: &Segment, right: &Segment) -> bool {
    let longer = change_weight(left).max(change_weight(right));
    let share = char_len(eq) as f64 / longer.max(1) as f64;
    share > SIGNIFICANT_EQUALITY_RATIO
        || has_whole_word(eq, ends_at_boundary(left), starts_at_boundary(right))
        || ends_sentence(eq)
}

/// Folds short equalities between two changes into one surrounding change.
fn fold_short_equalities(segs: Vec<Segment>) -> Vec<Segment> {
    let mut out: Vec<Segment> = Vec::with_capacity(segs.len());
    let mut iter = segs.into_iter().peekable();
    while let Some(seg) = iter.next() {
        let Segment::Same(eq) = seg else {
            out.push(seg);
            continue;
        };
        let foldable = match (out.last(), iter.peek()) {
            (Some(left @ Segment::Change { .. }), Some(right @ Segment::Change { .. })) => {
                !is_significant(&eq, left, right)
            }
            _ => false,
        };
        if !foldable {
            out.push(Segment::Same(eq));
            continue;
        }
        if let (
            Some(Segment::Change { deleted, inserted }),
            Some(Segment::Change {
                deleted: next_deleted,
                inserted: next_inserted,
            }),
        ) = (out.last_mut(), iter.next())
        {
            deleted.push_str(&eq);
            deleted.push_str(&next_deleted);
            inserted.push_str(&eq);
            inserted.push_str(&next_inserted);
        }
    }
    out
}

fn trailing_word_start(s: &str) -> usize {
    s.char_indices()
        .rev()
        .take_while(|(_, c)| is_word_char(*c))
        .last()
        .map_or(s.len(), |(i, _)| i)
}

fn leading_word_end(s: &str) -> usize {
    s.char_indices()
        .find(|(_, c)| !is_word_char(*c))
        .map_or(s.len(), |(i, _)| i)
}

/// Moves partial words out of the neighbouring equalities into each change.
fn extend_to_word_boundaries(mut segs: Vec<Segment>) -> Vec<Segment> {
    for idx in 0..segs.len() {
        if !matches!(segs[idx], Segment::Change { .. }) {
            continue;
        }
        if idx > 0 && !starts_at_boundary(&segs[idx]) {
            let moved = match &mut segs[idx - 1] {
                Segment::Same(prev) => {
                    let cut = trailing_word_start(prev);
                    prev.split_off(cut)
                }
                Segment::Change { .. } => String::new(),
            };
            if let Segment::Change { deleted, inserted } = &mut segs[idx] {
                deleted.insert_str(0, &moved);
                inserted.insert_str(0, &moved);
            }
        }
        if idx + 1 < segs.len() && !ends_at_boundary(&segs[idx]) {
            let moved = match &mut segs[idx + 1] {
                Segment::Same(next) => {
                    let cut = leading_word_end(next);
                    let rest = next.split_off(cut);
                    std::mem::replace(next, rest)
                }
                Segment::Change { .. } => String::new(),
            };
            if let Segment::Change { deleted, inserted } = &mut segs[idx] {
                deleted.push_str(&moved);
                inserted.push_str(&moved);
            }
        }
    }
    normalize(segs)
}

fn render(segs: Vec<Segment>) -> Vec<Diff> {
    let mut diffs = Vec::with_capacity(segs.len());
    for seg in segs {
        match seg {
            Segment::Same(s) => diffs.push(Diff::equal(s)),
            Segment::Change { deleted, inserted } => {
                if !deleted.is_empty() {
                    diffs.push(Diff::delete(deleted));
                }
                if !inserted.is_empty() {
                    diffs.push(Diff::insert(inserted));
                }
            }
        }
    }
    diffs
}

/// Rewrites a change record for display: merges runs, hides single-character
/// noise, folds insignificant equalities and widens edits to whole words.
/// The new-text reconstruction is always preserved.
pub fn presentation_cleanup(record: &ChangeRecord) -> ChangeRecord {
    let segs = normalize(segments(&record.diffs));
    let segs = suppress_noise(segs);
    let segs = fold_short_equalities(segs);
    let segs = extend_to_word_boundaries(segs);
    ChangeRecord::new(render(segs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::patch_notes::diff::compute_diff;

    fn cleaned(old: &str, new: &str) -> ChangeRecord {
        let raw = compute_diff(old, new);
        let out = presentation_cleanup(&raw);
        assert_eq!(out.new_text(), new, "new text must survive cleanup");
        out
    }

    #[test]
    fn merges_adjacent_tuples_and_drops_empty_ones() {
        let raw = ChangeRecord::new(vec![
            Diff::equal("Armor "),
            Diff::equal(""),
            Diff::delete("1"),
            Diff::delete("0"),
            Diff::insert("2"),
            Diff::insert("5"),
            Diff::equal(" total"),
        ]);
        assert_eq!(
            presentation_cleanup(&raw).diffs,
            vec![
                Diff::equal("Armor "),
                Diff::delete("10"),
                Diff::insert("25"),
                Diff::equal(" total"),
            ]
        );
    }

    #[test]
    fn punctuation_and_case_noise_is_hidden() {
        let out = cleaned("Hello world.", "Hello world!");
        assert!(!out.has_changes());

        let out = cleaned("mana Cost reduced", "mana cost reduced");
        assert!(!out.has_changes());
    }

    #[test]
    fn a_lone_change_is_not_noise() {
        let out = cleaned(".", "!");
        assert_eq!(out.diffs, vec![Diff::delete("."), Diff::insert("!")]);
    }

    #[test]
    fn short_equalities_between_changes_are_folded() {
        let raw = ChangeRecord::new(vec![
            Diff::delete("abcdefghij"),
            Diff::equal(" "),
            Diff::insert("klmnopqrst"),
        ]);
        let out = presentation_cleanup(&raw);
        assert_eq!(
            out.diffs,
            vec![Diff::delete("abcdefghij "), Diff::insert(" klmnopqrst")]
        );
        assert_eq!(out.old_text(), raw.old_text());
    }

    #[test]
    fn whole_words_and_sentence_ends_stay_separate() {
        let raw = ChangeRecord::new(vec![
            Diff::delete("x".repeat(40)),
            Diff::equal(" damage "),
            Diff::insert("y".repeat(40)),
        ]);
        assert_eq!(presentation_cleanup(&raw).diffs.len(), 3);

        let raw = ChangeRecord::new(vec![
            Diff::delete("xxxxxxxxxxxxxxxxxxxx"),
            Diff::equal(". "),
            Diff::insert("yyyyyyyyyyyyyyyyyyyy"),
        ]);
        assert_eq!(presentation_cleanup(&raw).diffs.len(), 3);
    }

    #[test]
    fn partial_word_edits_widen_to_the_word() {
        let out = cleaned("Sword damage increased", "Sword damage decreased");
        assert_eq!(
            out.diffs,
            vec![
                Diff::equal("Sword damage "),
                Diff::delete("increased"),
                Diff::insert("decreased"),
            ]
        );
        assert_eq!(out.old_text(), "Sword damage increased");
    }

    #[test]
    fn cleanup_leaves_the_stored_record_alone() {
        let raw = compute_diff("The quick brown fox", "The quick red fox");
        let before = raw.clone();
        let out = presentation_cleanup(&raw);
        assert_eq!(raw, before);
        assert_eq!(
            out.diffs,
            vec![
                Diff::equal("The quick "),
                Diff::delete("brown"),
                Diff::insert("red"),
                Diff::equal(" fox"),
            ]
        );
    }

    #[test]
    fn reconstructions_survive_without_noise() {
        let pairs = [
            ("Patch 1.2: Sword 40 -> 50", "Patch 1.3: Sword 45 -> 60, Shield added"),
            ("cooldown 12s", "base cooldown 10s"),
            ("Fixed a crash when loading", "Fixed crashes while saving"),
        ];
        for (old, new) in pairs {
            let out = cleaned(old, new);
            let noisy = compute_diff(old, new)
                .diffs
                .iter()
                .any(|d| d.op != DiffOp::Equal && char_len(&d.text) == 1);
            if !noisy {
                assert_eq!(out.old_text(), old);
            }
        }
    }
}
