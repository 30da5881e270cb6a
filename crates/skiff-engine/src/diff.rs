//! Unified diff generation for file mutation events.
//!
//! Output format:
//! ```text
//! --- a/path
//! +++ b/path
//! @@ -start,count +start,count @@
//!  context line
//! -removed line
//! +added line
//! ```

const CONTEXT_LINES: usize = 3;

/// Generate a unified diff between two file contents, with `a/`-`b/` headers
/// naming the sandbox-relative path. Empty when the contents are identical.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }

    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let ops = compute_edit_ops(&old_lines, &new_lines);
    let hunks = format_hunks(&old_lines, &new_lines, &ops, CONTEXT_LINES);
    if hunks.is_empty() {
        return String::new();
    }

    format!("--- a/{path}\n+++ b/{path}\n{hunks}")
}

/// Header used when the file did not exist before the mutation.
pub fn unified_diff_new_file(path: &str, new: &str) -> String {
    let mut body = String::new();
    let lines: Vec<&str> = new.lines().collect();
    if !lines.is_empty() {
        body.push_str(&format!("@@ -0,0 +1,{} @@\n", lines.len()));
        for line in &lines {
            body.push('+');
            body.push_str(line);
            body.push('\n');
        }
    }
    format!("--- /dev/null\n+++ b/{path}\n{body}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EditOp {
    Equal(usize, usize), // old_idx, new_idx
    Delete(usize),       // old_idx
    Insert(usize),       // new_idx
}

fn compute_edit_ops(old: &[&str], new: &[&str]) -> Vec<EditOp> {
    let old_len = old.len();
    let new_len = new.len();

    // LCS table
    let mut dp = vec![vec![0u32; new_len + 1]; old_len + 1];
    for (i, old_line) in old.iter().enumerate() {
        for (j, new_line) in new.iter().enumerate() {
            dp[i + 1][j + 1] = if old_line == new_line {
                dp[i][j] + 1
            } else {
                dp[i + 1][j].max(dp[i][j + 1])
            };
        }
    }

    // Backtrack to edit ops
    let mut ops = Vec::new();
    let mut i = old_len;
    let mut j = new_len;
    while i > 0 || j > 0 {
        if i > 0 && j > 0 && old[i - 1] == new[j - 1] {
            ops.push(EditOp::Equal(i - 1, j - 1));
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || dp[i][j - 1] >= dp[i - 1][j]) {
            ops.push(EditOp::Insert(j - 1));
            j -= 1;
        } else {
            ops.push(EditOp::Delete(i - 1));
            i -= 1;
        }
    }
    ops.reverse();
    ops
}

fn format_hunks(old: &[&str], new: &[&str], ops: &[EditOp], context_lines: usize) -> String {
    // Group runs of non-Equal ops into change ranges, then merge ranges whose
    // context windows overlap so a hunk never repeats lines.
    let mut changes: Vec<(usize, usize)> = Vec::new();
    let mut i = 0;
    while i < ops.len() {
        if matches!(ops[i], EditOp::Equal(..)) {
            i += 1;
        } else {
            let start = i;
            while i < ops.len() && !matches!(ops[i], EditOp::Equal(..)) {
                i += 1;
            }
            changes.push((start, i));
        }
    }
    if changes.is_empty() {
        return String::new();
    }

    let mut merged: Vec<(usize, usize)> = Vec::new();
    for (start, end) in changes {
        let ctx_start = start.saturating_sub(context_lines);
        let ctx_end = (end + context_lines).min(ops.len());
        match merged.last_mut() {
            Some((_, prev_end)) if ctx_start <= *prev_end => *prev_end = ctx_end,
            _ => merged.push((ctx_start, ctx_end)),
        }
    }

    let mut output = String::new();
    for &(ctx_start, ctx_end) in &merged {
        let mut old_start = 0;
        let mut old_count = 0u32;
        let mut new_start = 0;
        let mut new_count = 0u32;
        let mut first = true;

        let mut hunk_lines = Vec::new();
        for op in &ops[ctx_start..ctx_end] {
            match op {
                EditOp::Equal(oi, ni) => {
                    if first {
                        old_start = oi + 1;
                        new_start = ni + 1;
                        first = false;
                    }
                    old_count += 1;
                    new_count += 1;
                    hunk_lines.push(format!(" {}", old[*oi]));
                }
                EditOp::Delete(oi) => {
                    if first {
                        old_start = oi + 1;
                        new_start = (*oi).min(new.len()) + 1;
                        first = false;
                    }
                    old_count += 1;
                    hunk_lines.push(format!("-{}", old[*oi]));
                }
                EditOp::Insert(ni) => {
                    if first {
                        old_start = (*ni).min(old.len()) + 1;
                        new_start = ni + 1;
                        first = false;
                    }
                    new_count += 1;
                    hunk_lines.push(format!("+{}", new[*ni]));
                }
            }
        }

        output.push_str(&format!(
            "@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"
        ));
        for line in &hunk_lines {
            output.push_str(line);
            output.push('\n');
        }
    }

    output
}
