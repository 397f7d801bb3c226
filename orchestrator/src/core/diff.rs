//! Unified diff text generation.
//!
//! Lines are compared as `\n`-terminated tokens, so a missing trailing newline
//! is a real difference and is rendered with git's
//! `\ No newline at end of file` marker.

use std::fmt::Write as _;

/// Lines of context around each hunk.
pub const CONTEXT_LINES: usize = 3;

/// Above this many LCS cells the diff degrades to a single replace-all hunk.
const MAX_LCS_CELLS: usize = 16_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal { old: usize, new: usize },
    Delete { old: usize },
    Insert { new: usize },
}

/// Render a unified diff of `old` → `new` for `path`.
///
/// `old = None` renders a new-file diff against `/dev/null`. Returns an empty
/// string when the inputs are identical.
pub fn unified_diff(path: &str, old: Option<&str>, new: &str) -> String {
    if old == Some(new) {
        return String::new();
    }
    render(path, old, Some(new))
}

/// Render the removal of `path`, whose last content was `old`.
pub fn deletion_diff(path: &str, old: &str) -> String {
    render(path, Some(old), None)
}

fn render(path: &str, old: Option<&str>, new: Option<&str>) -> String {
    let old_lines: Vec<&str> = old.unwrap_or("").split_inclusive('\n').collect();
    let new_lines: Vec<&str> = new.unwrap_or("").split_inclusive('\n').collect();
    let ops = edit_script(&old_lines, &new_lines);

    let mut out = String::new();
    match old {
        Some(_) => {
            let _ = writeln!(out, "--- a/{path}");
        }
        None => out.push_str("--- /dev/null\n"),
    }
    match new {
        Some(_) => {
            let _ = writeln!(out, "+++ b/{path}");
        }
        None => out.push_str("+++ /dev/null\n"),
    }

    for hunk in hunks(&ops) {
        render_hunk(&mut out, &ops[hunk.0..hunk.1], &old_lines, &new_lines);
    }
    out
}

/// Placeholder diff for content that is not text.
pub fn binary_diff(path: &str, old_exists: bool, new_exists: bool) -> String {
    let side = |exists: bool, prefix: &str| {
        if exists {
            format!("{prefix}/{path}")
        } else {
            "/dev/null".to_string()
        }
    };
    format!(
        "Binary files {} and {} differ\n",
        side(old_exists, "a"),
        side(new_exists, "b")
    )
}

/// Heuristic used by git: a NUL byte in the first 8000 bytes marks binary content.
pub fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8000).any(|&b| b == 0)
}

fn edit_script(old: &[&str], new: &[&str]) -> Vec<Op> {
    // Trim the common prefix and suffix so the LCS table only covers the changed middle.
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut ops: Vec<Op> = (0..prefix).map(|i| Op::Equal { old: i, new: i }).collect();
    ops.extend(
        middle_script(old_mid, new_mid)
            .into_iter()
            .map(|op| offset(op, prefix)),
    );
    let old_tail = old.len() - suffix;
    let new_tail = new.len() - suffix;
    ops.extend((0..suffix).map(|i| Op::Equal {
        old: old_tail + i,
        new: new_tail + i,
    }));
    ops
}

fn offset(op: Op, by: usize) -> Op {
    match op {
        Op::Equal { old, new } => Op::Equal {
            old: old + by,
            new: new + by,
        },
        Op::Delete { old } => Op::Delete { old: old + by },
        Op::Insert { new } => Op::Insert { new: new + by },
    }
}

fn middle_script(old: &[&str], new: &[&str]) -> Vec<Op> {
    let (n, m) = (old.len(), new.len());
    if n == 0 || m == 0 || n.saturating_mul(m) > MAX_LCS_CELLS {
        let mut ops: Vec<Op> = (0..n).map(|old| Op::Delete { old }).collect();
        ops.extend((0..m).map(|new| Op::Insert { new }));
        return ops;
    }

    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if old[i] == new[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Equal { old: i, new: j });
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            ops.push(Op::Delete { old: i });
            i += 1;
        } else {
            ops.push(Op::Insert { new: j });
            j += 1;
        }
    }
    ops.extend((i..n).map(|old| Op::Delete { old }));
    ops.extend((j..m).map(|new| Op::Insert { new }));
    ops
}

/// Group ops into `[start, end)` hunk ranges with surrounding context.
fn hunks(ops: &[Op]) -> Vec<(usize, usize)> {
    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal { .. }))
        .map(|(idx, _)| idx)
        .collect();

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for idx in changes {
        let start = idx.saturating_sub(CONTEXT_LINES);
        let end = (idx + CONTEXT_LINES + 1).min(ops.len());
        match ranges.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => ranges.push((start, end)),
        }
    }
    ranges
}

fn render_hunk(out: &mut String, ops: &[Op], old_lines: &[&str], new_lines: &[&str]) {
    let old_count = ops
        .iter()
        .filter(|op| !matches!(op, Op::Insert { .. }))
        .count();
    let new_count = ops
        .iter()
        .filter(|op| !matches!(op, Op::Delete { .. }))
        .count();
    let old_start = ops
        .iter()
        .find_map(|op| match op {
            Op::Equal { old, .. } | Op::Delete { old } => Some(*old),
            Op::Insert { .. } => None,
        })
        .map_or(0, |idx| idx + 1);
    let new_start = ops
        .iter()
        .find_map(|op| match op {
            Op::Equal { new, .. } | Op::Insert { new } => Some(*new),
            Op::Delete { .. } => None,
        })
        .map_or(0, |idx| idx + 1);

    // A side with no lines in the hunk is an empty file on that side: start 0.
    let _ = writeln!(
        out,
        "@@ -{} +{} @@",
        range(old_start, old_count),
        range(new_start, new_count)
    );
    for op in ops {
        match *op {
            Op::Equal { old, .. } => push_line(out, ' ', old_lines[old]),
            Op::Delete { old } => push_line(out, '-', old_lines[old]),
            Op::Insert { new } => push_line(out, '+', new_lines[new]),
        }
    }
}

fn range(start: usize, count: usize) -> String {
    if count == 1 {
        start.to_string()
    } else {
        format!("{start},{count}")
    }
}

fn push_line(out: &mut String, marker: char, line: &str) {
    out.push(marker);
    match line.strip_suffix('\n') {
        Some(body) => {
            out.push_str(body);
            out.push('\n');
        }
        None => {
            out.push_str(line);
            out.push_str("\n\\ No newline at end of file\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_inputs_produce_no_diff() {
        assert_eq!(unified_diff("a.txt", Some("same\n"), "same\n"), "");
    }

    #[test]
    fn new_file_is_a_full_addition() {
        let diff = unified_diff("new.txt", None, "one\ntwo\n");
        assert_eq!(
            diff,
            "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+one\n+two\n"
        );
    }

    #[test]
    fn single_line_change_has_context() {
        let old = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let new = "a\nb\nc\nd\nE\nf\ng\nh\n";
        let diff = unified_diff("x.txt", Some(old), new);
        assert_eq!(
            diff,
            "--- a/x.txt\n+++ b/x.txt\n@@ -2,7 +2,7 @@\n b\n c\n d\n-e\n+E\n f\n g\n h\n"
        );
    }

    #[test]
    fn distant_changes_produce_separate_hunks() {
        let old: String = (1..=20).map(|i| format!("line {i}\n")).collect();
        let new = old
            .replace("line 2\n", "line two\n")
            .replace("line 19\n", "line nineteen\n");
        let diff = unified_diff("n.txt", Some(&old), &new);
        assert_eq!(diff.matches("@@ -").count(), 2);
        assert!(diff.contains("-line 2\n+line two\n"));
        assert!(diff.contains("-line 19\n+line nineteen\n"));
    }

    #[test]
    fn missing_trailing_newline_is_marked() {
        let diff = unified_diff("x.txt", Some("a\n"), "a");
        assert!(diff.contains("-a\n+a\n\\ No newline at end of file\n"));
    }

    #[test]
    fn emptied_file_deletes_every_line() {
        let diff = unified_diff("x.txt", Some("a\nb\n"), "");
        assert!(diff.ends_with("@@ -1,2 +0,0 @@\n-a\n-b\n"));
    }

    #[test]
    fn deleted_file_targets_dev_null() {
        assert_eq!(
            deletion_diff("gone.txt", "a\n"),
            "--- a/gone.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-a\n"
        );
    }

    #[test]
    fn binary_detection_uses_nul_bytes() {
        assert!(looks_binary(b"abc\0def"));
        assert!(!looks_binary(b"plain text"));
        assert_eq!(
            binary_diff("img.png", false, true),
            "Binary files /dev/null and b/img.png differ\n"
        );
    }
}
