//! Line-oriented unified diff for configuration text.

/// Lines of context around each change.
const CONTEXT: usize = 3;

/// Above this many LCS table cells the changed region is emitted as one
/// replace block instead of a minimal edit script.
const MAX_TABLE_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

#[derive(Debug, Clone, Copy)]
struct Edit {
    op: Op,
    /// Index into the old lines (Equal/Delete) or new lines (Insert).
    old: usize,
    new: usize,
}

fn edit_script(old: &[&str], new: &[&str]) -> Vec<Edit> {
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

    let a = &old[prefix..old.len() - suffix];
    let b = &new[prefix..new.len() - suffix];

    let mut edits = Vec::with_capacity(old.len() + b.len());
    for i in 0..prefix {
        edits.push(Edit { op: Op::Equal, old: i, new: i });
    }

    if a.len().saturating_mul(b.len()) <= MAX_TABLE_CELLS {
        middle_lcs(a, b, prefix, &mut edits);
    } else {
        for i in 0..a.len() {
            edits.push(Edit { op: Op::Delete, old: prefix + i, new: prefix });
        }
        for j in 0..b.len() {
            edits.push(Edit { op: Op::Insert, old: prefix + a.len(), new: prefix + j });
        }
    }

    for k in 0..suffix {
        edits.push(Edit {
            op: Op::Equal,
            old: old.len() - suffix + k,
            new: new.len() - suffix + k,
        });
    }
    edits
}

fn middle_lcs(a: &[&str], b: &[&str], offset: usize, edits: &mut Vec<Edit>) {
    let width = b.len() + 1;
    // table[i * width + j] = LCS length of a[i..] and b[j..]
    let mut table = vec![0u32; (a.len() + 1) * width];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            table[i * width + j] = if a[i] == b[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        if i < a.len() && j < b.len() && a[i] == b[j] {
            edits.push(Edit { op: Op::Equal, old: offset + i, new: offset + j });
            i += 1;
            j += 1;
        } else if j == b.len() || (i < a.len() && table[(i + 1) * width + j] >= table[i * width + j + 1]) {
            edits.push(Edit { op: Op::Delete, old: offset + i, new: offset + j });
            i += 1;
        } else {
            edits.push(Edit { op: Op::Insert, old: offset + i, new: offset + j });
            j += 1;
        }
    }
}

/// Render a unified diff from `old` to `new`. Identical inputs give `""`.
pub fn unified_diff(old: &str, new: &str, from_label: &str, to_label: &str) -> String {
    // Lines keep their terminator so a missing final newline or CRLF line
    // ending still counts as a change.
    let old_lines: Vec<&str> = old.split_inclusive('\n').collect();
    let new_lines: Vec<&str> = new.split_inclusive('\n').collect();
    let edits = edit_script(&old_lines, &new_lines);

    let changes: Vec<usize> = edits
        .iter()
        .enumerate()
        .filter(|(_, e)| e.op != Op::Equal)
        .map(|(idx, _)| idx)
        .collect();
    if changes.is_empty() {
        return String::new();
    }

    // Group changes whose context windows touch into one hunk.
    let mut hunks: Vec<(usize, usize)> = Vec::new();
    for &idx in &changes {
        let start = idx.saturating_sub(CONTEXT);
        let end = (idx + CONTEXT + 1).min(edits.len());
        match hunks.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => hunks.push((start, end)),
        }
    }

    let mut out = format!("--- a/{}\n+++ b/{}\n", from_label, to_label);
    for (start, end) in hunks {
        let slice = &edits[start..end];
        let old_count = slice.iter().filter(|e| e.op != Op::Insert).count();
        let new_count = slice.iter().filter(|e| e.op != Op::Delete).count();
        let old_start = slice[0].old + usize::from(old_count > 0);
        let new_start = slice[0].new + usize::from(new_count > 0);

        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_start, old_count, new_start, new_count
        ));
        for edit in slice {
            let (prefix, line) = match edit.op {
                Op::Equal => (' ', old_lines[edit.old]),
                Op::Delete => ('-', old_lines[edit.old]),
                Op::Insert => ('+', new_lines[edit.new]),
            };
            out.push(prefix);
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
    }
    out
}
