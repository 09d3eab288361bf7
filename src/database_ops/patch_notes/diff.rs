//! Character-level text diff stored as an append-only change record.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Default time budget of [`compute_diff`]; past it the remaining span is
/// reported as one delete plus one insert.
pub const DIFF_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum DiffOp {
    Delete,
    Equal,
    Insert,
}

impl From<DiffOp> for i8 {
    fn from(op: DiffOp) -> i8 {
        match op {
            DiffOp::Delete => -1,
            DiffOp::Equal => 0,
            DiffOp::Insert => 1,
        }
    }
}

impl TryFrom<i8> for DiffOp {
    type Error = String;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            -1 => Ok(DiffOp::Delete),
            0 => Ok(DiffOp::Equal),
            1 => Ok(DiffOp::Insert),
            other => Err(format!("unknown diff operation {other}")),
        }
    }
}

/// One `(op, text)` tuple, serialized as a two-element array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(DiffOp, String)", into = "(DiffOp, String)")]
pub struct Diff {
    pub op: DiffOp,
    pub text: String,
}

impl Diff {
    pub fn new(op: DiffOp, text: impl Into<String>) -> Self {
        Self {
            op,
            text: text.into(),
        }
    }

    pub fn delete(text: impl Into<String>) -> Self {
        Self::new(DiffOp::Delete, text)
    }

    pub fn equal(text: impl Into<String>) -> Self {
        Self::new(DiffOp::Equal, text)
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self::new(DiffOp::Insert, text)
    }
}

impl From<(DiffOp, String)> for Diff {
    fn from((op, text): (DiffOp, String)) -> Self {
        Self { op, text }
    }
}

impl From<Diff> for (DiffOp, String) {
    fn from(d: Diff) -> Self {
        (d.op, d.text)
    }
}

/// Ordered diff tuples between two revisions. Immutable once stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeRecord {
    pub diffs: Vec<Diff>,
}

impl ChangeRecord {
    pub fn new(diffs: Vec<Diff>) -> Self {
        Self { diffs }
    }

    pub fn old_text(&self) -> String {
        self.diffs
            .iter()
            .filter(|d| d.op != DiffOp::Insert)
            .map(|d| d.text.as_str())
            .collect()
    }

    pub fn new_text(&self) -> String {
        self.diffs
            .iter()
            .filter(|d| d.op != DiffOp::Delete)
            .map(|d| d.text.as_str())
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        self.diffs.iter().any(|d| d.op != DiffOp::Equal)
    }
}

impl fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for d in &self.diffs {
            match d.op {
                DiffOp::Equal => f.write_str(&d.text)?,
                DiffOp::Delete => write!(f, "[-{}-]", d.text)?,
                DiffOp::Insert => write!(f, "{{+{}+}}", d.text)?,
            }
        }
        Ok(())
    }
}

pub fn compute_diff(old: &str, new: &str) -> ChangeRecord {
    compute_diff_with_deadline(old, new, Some(Instant::now() + DIFF_TIMEOUT))
}

/// Myers diff over chars; `None` disables the deadline.
pub fn compute_diff_with_deadline(old: &str, new: &str, deadline: Option<Instant>) -> ChangeRecord {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    ChangeRecord::new(merge_runs(diff_main(&a, &b, deadline)))
}

fn text(chars: &[char]) -> String {
    chars.iter().collect()
}

pub(crate) fn common_prefix(a: &[char], b: &[char]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

pub(crate) fn common_suffix(a: &[char], b: &[char]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

fn diff_main(a: &[char], b: &[char], deadline: Option<Instant>) -> Vec<Diff> {
    if a == b {
        return if a.is_empty() {
            Vec::new()
        } else {
            vec![Diff::equal(text(a))]
        };
    }
    let prefix = common_prefix(a, b);
    let (a_rest, b_rest) = (&a[prefix..], &b[prefix..]);
    let suffix = common_suffix(a_rest, b_rest);
    let a_mid = &a_rest[..a_rest.len() - suffix];
    let b_mid = &b_rest[..b_rest.len() - suffix];

    let mut diffs = Vec::new();
    if prefix > 0 {
        diffs.push(Diff::equal(text(&a[..prefix])));
    }
    diffs.extend(diff_compute(a_mid, b_mid, deadline));
    if suffix > 0 {
        diffs.push(Diff::equal(text(&a_rest[a_rest.len() - suffix..])));
    }
    diffs
}

fn find_sub(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn diff_compute(a: &[char], b: &[char], deadline: Option<Instant>) -> Vec<Diff> {
    if a.is_empty() {
        return vec![Diff::insert(text(b))];
    }
    if b.is_empty() {
        return vec![Diff::delete(text(a))];
    }
    let (long, short, outer) = if a.len() > b.len() {
        (a, b, DiffOp::Delete)
    } else {
        (b, a, DiffOp::Insert)
    };
    if let Some(i) = find_sub(long, short) {
        return vec![
            Diff::new(outer, text(&long[..i])),
            Diff::equal(text(short)),
            Diff::new(outer, text(&long[i + short.len()..])),
        ];
    }
    if short.len() == 1 {
        return vec![Diff::delete(text(a)), Diff::insert(text(b))];
    }
    bisect(a, b, deadline)
}

/// Finds the middle snake of the edit graph and recurses on both halves.
fn bisect(a: &[char], b: &[char], deadline: Option<Instant>) -> Vec<Diff> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = (n + m + 1) / 2;
    let v_offset = max_d;
    let v_len = (2 * max_d) as usize;
    let mut v1 = vec![-1isize; v_len];
    let mut v2 = vec![-1isize; v_len];
    v1[(v_offset + 1) as usize] = 0;
    v2[(v_offset + 1) as usize] = 0;
    let delta = n - m;
    // Odd delta: the forward path collides with the reverse path.
    let front = delta % 2 != 0;
    let (mut k1_start, mut k1_end, mut k2_start, mut k2_end) = (0isize, 0isize, 0isize, 0isize);

    for d in 0..max_d {
        if deadline.is_some_and(|t| Instant::now() > t) {
            break;
        }

        let mut k1 = -d + k1_start;
        while k1 <= d - k1_end {
            let k1_off = (v_offset + k1) as usize;
            let mut x1 = if k1 == -d || (k1 != d && v1[k1_off - 1] < v1[k1_off + 1]) {
                v1[k1_off + 1]
            } else {
                v1[k1_off - 1] + 1
            };
            let mut y1 = x1 - k1;
            while x1 < n && y1 >= 0 && y1 < m && a[x1 as usize] == b[y1 as usize] {
                x1 += 1;
                y1 += 1;
            }
            v1[k1_off] = x1;
            if x1 > n {
                k1_end += 2;
            } else if y1 > m {
                k1_start += 2;
            } else if front {
                let k2_off = v_offset + delta - k1;
                if k2_off >= 0 && (k2_off as usize) < v_len && v2[k2_off as usize] != -1 {
                    let x2 = n - v2[k2_off as usize];
                    if x1 >= x2 {
                        return bisect_split(a, b, x1 as usize, y1 as usize, deadline);
                    }
                }
            }
            k1 += 2;
        }

        let mut k2 = -d + k2_start;
        while k2 <= d - k2_end {
            let k2_off = (v_offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && v2[k2_off - 1] < v2[k2_off + 1]) {
                v2[k2_off + 1]
            } else {
                v2[k2_off - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < n
                && y2 >= 0
                && y2 < m
                && a[(n - x2 - 1) as usize] == b[(m - y2 - 1) as usize]
            {
                x2 += 1;
                y2 += 1;
            }
            v2[k2_off] = x2;
            if x2 > n {
                k2_end += 2;
            } else if y2 > m {
                k2_start += 2;
            } else if !front {
                let k1_off = v_offset + delta - k2;
                if k1_off >= 0 && (k1_off as usize) < v_len && v1[k1_off as usize] != -1 {
                    let x1 = v1[k1_off as usize];
                    let y1 = v_offset + x1 - k1_off;
                    if x1 >= n - x2 {
                        return bisect_split(a, b, x1 as usize, y1 as usize, deadline);
                    }
                }
            }
            k2 += 2;
        }
    }
    vec![Diff::delete(text(a)), Diff::insert(text(b))]
}

fn bisect_split(a: &[char], b: &[char], x: usize, y: usize, deadline: Option<Instant>) -> Vec<Diff> {
    let mut diffs = diff_main(&a[..x], &b[..y], deadline);
    diffs.extend(diff_main(&a[x..], &b[y..], deadline));
    diffs
}

fn push_equal(out: &mut Vec<Diff>, s: &str) {
    if s.is_empty() {
        return;
    }
    match out.last_mut() {
        Some(last) if last.op == DiffOp::Equal => last.text.push_str(s),
        _ => out.push(Diff::equal(s)),
    }
}

fn flush_edit(out: &mut Vec<Diff>, deleted: &mut String, inserted: &mut String) {
    if !deleted.is_empty() && !inserted.is_empty() {
        let del: Vec<char> = deleted.chars().collect();
        let ins: Vec<char> = inserted.chars().collect();
        let prefix = common_prefix(&del, &ins);
        let suffix = common_suffix(&del[prefix..], &ins[prefix..]);
        push_equal(out, &text(&del[..prefix]));
        let del_mid = text(&del[prefix..del.len() - suffix]);
        let ins_mid = text(&ins[prefix..ins.len() - suffix]);
        if !del_mid.is_empty() {
            out.push(Diff::delete(del_mid));
        }
        if !ins_mid.is_empty() {
            out.push(Diff::insert(ins_mid));
        }
        push_equal(out, &text(&del[del.len() - suffix..]));
    } else if !deleted.is_empty() {
        out.push(Diff::delete(deleted.as_str()));
    } else if !inserted.is_empty() {
        out.push(Diff::insert(inserted.as_str()));
    }
    deleted.clear();
    inserted.clear();
}

/// Joins each run of edits between equalities into one delete followed by one
/// insert, factors their shared affixes into the equalities and drops empties.
pub fn merge_runs(diffs: Vec<Diff>) -> Vec<Diff> {
    let mut out = Vec::with_capacity(diffs.len());
    let mut deleted = String::new();
    let mut inserted = String::new();
    for d in diffs {
        match d.op {
            DiffOp::Delete => deleted.push_str(&d.text),
            DiffOp::Insert => inserted.push_str(&d.text),
            DiffOp::Equal => {
                flush_edit(&mut out, &mut deleted, &mut inserted);
                push_equal(&mut out, &d.text);
            }
        }
    }
    flush_edit(&mut out, &mut deleted, &mut inserted);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_round_trip(old: &str, new: &str) -> ChangeRecord {
        let record = compute_diff(old, new);
        assert_eq!(record.old_text(), old);
        assert_eq!(record.new_text(), new);
        record
    }

    #[test]
    fn identical_and_empty_inputs() {
        assert!(compute_diff("", "").diffs.is_empty());
        assert_eq!(compute_diff("same", "same").diffs, vec![Diff::equal("same")]);
        assert_eq!(compute_diff("", "abc").diffs, vec![Diff::insert("abc")]);
        assert_eq!(compute_diff("abc", "").diffs, vec![Diff::delete("abc")]);
    }

    #[test]
    fn trims_common_prefix_and_suffix() {
        let record = check_round_trip("Damage 40 to all", "Damage 65 to all");
        assert_eq!(
            record.diffs,
            vec![
                Diff::equal("Damage "),
                Diff::delete("40"),
                Diff::insert("65"),
                Diff::equal(" to all"),
            ]
        );
    }

    #[test]
    fn containment_is_reported_around_the_shorter_text() {
        let record = check_round_trip("cooldown", "base cooldown reduced");
        assert_eq!(
            record.diffs,
            vec![
                Diff::insert("base "),
                Diff::equal("cooldown"),
                Diff::insert(" reduced"),
            ]
        );
    }

    #[test]
    fn bisect_finds_shared_characters() {
        let record = check_round_trip("cat", "map");
        assert_eq!(
            record.diffs,
            vec![
                Diff::delete("c"),
                Diff::insert("m"),
                Diff::equal("a"),
                Diff::delete("t"),
                Diff::insert("p"),
            ]
        );
    }

    #[test]
    fn round_trips_multiline_and_unicode_text() {
        check_round_trip(
            "Patch 1.2\n- Sword damage 50 → 60\n- Fixed crash",
            "Patch 1.3\n- Sword damage 55 → 60\n- Shield removed\n- Fixed crash on load",
        );
        check_round_trip("naïve café", "naive cafe ☕");
        check_round_trip("abcdefghijklmnop", "ponmlkjihgfedcba");
    }

    #[test]
    fn expired_deadline_falls_back_to_delete_insert() {
        let past = Instant::now() - Duration::from_secs(1);
        let record = compute_diff_with_deadline("abcXdef", "abYcdZf", Some(past));
        assert_eq!(record.old_text(), "abcXdef");
        assert_eq!(record.new_text(), "abYcdZf");
        let edits = record.diffs.iter().filter(|d| d.op != DiffOp::Equal).count();
        assert_eq!(edits, 2);
    }

    #[test]
    fn serializes_as_op_text_pairs() {
        let record = ChangeRecord::new(vec![
            Diff::delete("old"),
            Diff::equal(" "),
            Diff::insert("new"),
        ]);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"[[-1,"old"],[0," "],[1,"new"]]"#);
        let back: ChangeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(serde_json::from_str::<ChangeRecord>(r#"[[2,"x"]]"#).is_err());
    }

    #[test]
    fn merge_runs_groups_edits_and_factors_affixes() {
        let merged = merge_runs(vec![
            Diff::equal("a"),
            Diff::insert("bc"),
            Diff::delete("bd"),
            Diff::equal(""),
            Diff::equal("e"),
        ]);
        assert_eq!(
            merged,
            vec![
                Diff::equal("ab"),
                Diff::delete("d"),
                Diff::insert("c"),
                Diff::equal("e"),
            ]
        );
    }
}
