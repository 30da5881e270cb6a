//! Unified diff parsing and in-process application.
//!
//! Accepts the standard `--- a/…` / `+++ b/…` / `@@` hunk format, including
//! multi-file patches and `/dev/null` file creation. Patches are applied in
//! memory with exact context matching; no external tooling is involved.

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("patch is empty or has no file headers")]
    Empty,
    #[error("malformed patch: {0}")]
    Malformed(String),
    #[error("hunk does not apply at line {line} of {path}")]
    HunkMismatch { path: String, line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<PatchLine>,
}

#[derive(Debug, Clone)]
pub struct FilePatch {
    pub path: String,
    pub is_new: bool,
    pub hunks: Vec<Hunk>,
}

/// Parse a unified diff into per-file patches.
pub fn parse(patch: &str) -> Result<Vec<FilePatch>, PatchError> {
    let mut files: Vec<FilePatch> = Vec::new();
    let mut lines = patch.lines().peekable();

    while let Some(line) = lines.next() {
        if !line.starts_with("--- ") {
            continue;
        }
        let old_path = line[4..].trim();
        let new_line = lines
            .next()
            .ok_or_else(|| PatchError::Malformed("missing +++ header".into()))?;
        if !new_line.starts_with("+++ ") {
            return Err(PatchError::Malformed(format!(
                "expected +++ header after ---, got: {new_line}"
            )));
        }
        let new_path = new_line[4..].trim();

        let is_new = old_path == "/dev/null";
        let path = strip_prefix(if new_path == "/dev/null" {
            old_path
        } else {
            new_path
        });
        if path.is_empty() {
            return Err(PatchError::Malformed("empty file path in header".into()));
        }

        let mut hunks = Vec::new();
        while let Some(&next) = lines.peek() {
            if !next.starts_with("@@") {
                break;
            }
            let header = lines.next().unwrap_or_default();
            let (old_start, old_count, new_start, new_count) = parse_hunk_header(header)?;

            let mut body = Vec::new();
            let mut seen_old = 0usize;
            let mut seen_new = 0usize;
            while seen_old < old_count || seen_new < new_count {
                let Some(&raw) = lines.peek() else { break };
                // "\ No newline at end of file" markers are metadata.
                if raw.starts_with('\\') {
                    lines.next();
                    continue;
                }
                let parsed = match raw.chars().next() {
                    Some(' ') | None => {
                        seen_old += 1;
                        seen_new += 1;
                        PatchLine::Context(raw.get(1..).unwrap_or("").to_string())
                    }
                    Some('-') => {
                        seen_old += 1;
                        PatchLine::Remove(raw[1..].to_string())
                    }
                    Some('+') => {
                        seen_new += 1;
                        PatchLine::Add(raw[1..].to_string())
                    }
                    _ => break,
                };
                lines.next();
                body.push(parsed);
            }

            hunks.push(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: body,
            });
        }

        if hunks.is_empty() {
            return Err(PatchError::Malformed(format!("no hunks for {path}")));
        }
        files.push(FilePatch {
            path,
            is_new,
            hunks,
        });
    }

    if files.is_empty() {
        return Err(PatchError::Empty);
    }
    Ok(files)
}

/// Apply one file's hunks to its current content, returning the new content.
pub fn apply(content: &str, patch: &FilePatch) -> Result<String, PatchError> {
    let old_lines: Vec<&str> = if content.is_empty() {
        Vec::new()
    } else {
        content.lines().collect()
    };

    let mut out: Vec<String> = Vec::new();
    let mut cursor = 0usize; // index into old_lines already consumed

    for hunk in &patch.hunks {
        let old_block: Vec<&str> = hunk
            .lines
            .iter()
            .filter_map(|l| match l {
                PatchLine::Context(s) | PatchLine::Remove(s) => Some(s.as_str()),
                PatchLine::Add(_) => None,
            })
            .collect();

        let anchor = hunk.old_start.saturating_sub(1);
        let at = find_block(&old_lines, &old_block, anchor, cursor).ok_or_else(|| {
            PatchError::HunkMismatch {
                path: patch.path.clone(),
                line: hunk.old_start,
            }
        })?;

        // Copy unchanged lines up to the hunk.
        for line in &old_lines[cursor..at] {
            out.push((*line).to_string());
        }

        for line in &hunk.lines {
            match line {
                PatchLine::Context(s) | PatchLine::Add(s) => out.push(s.clone()),
                PatchLine::Remove(_) => {}
            }
        }
        cursor = at + old_block.len();
    }

    for line in &old_lines[cursor..] {
        out.push((*line).to_string());
    }

    let mut result = out.join("\n");
    // Preserve the customary trailing newline for non-empty files.
    if !result.is_empty() {
        result.push('\n');
    }
    Ok(result)
}

fn strip_prefix(path: &str) -> String {
    let p = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    p.to_string()
}

fn parse_hunk_header(header: &str) -> Result<(usize, usize, usize, usize), PatchError> {
    // "@@ -old_start[,old_count] +new_start[,new_count] @@[ trailing]"
    let inner = header
        .trim_start_matches('@')
        .trim_end_matches(|c| c != '@')
        .trim_matches('@')
        .trim();
    let mut parts = inner.split_whitespace();

    let old = parts
        .next()
        .and_then(|s| s.strip_prefix('-'))
        .ok_or_else(|| PatchError::Malformed(format!("bad hunk header: {header}")))?;
    let new = parts
        .next()
        .and_then(|s| s.strip_prefix('+'))
        .ok_or_else(|| PatchError::Malformed(format!("bad hunk header: {header}")))?;

    let parse_range = |s: &str| -> Result<(usize, usize), PatchError> {
        let mut it = s.splitn(2, ',');
        let start = it
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| PatchError::Malformed(format!("bad hunk range: {s}")))?;
        let count = match it.next() {
            Some(v) => v
                .parse()
                .map_err(|_| PatchError::Malformed(format!("bad hunk range: {s}")))?,
            None => 1,
        };
        Ok((start, count))
    };

    let (old_start, old_count) = parse_range(old)?;
    let (new_start, new_count) = parse_range(new)?;
    Ok((old_start, old_count, new_start, new_count))
}

/// Locate `block` in `lines`: try the declared anchor first, then scan
/// forward from the consumed prefix. Empty blocks (pure insertion) resolve
/// to the anchor.
fn find_block(lines: &[&str], block: &[&str], anchor: usize, min: usize) -> Option<usize> {
    if block.is_empty() {
        return Some(anchor.clamp(min, lines.len()));
    }

    let matches_at = |at: usize| -> bool {
        at + block.len() <= lines.len() && lines[at..at + block.len()] == block[..]
    };

    if anchor >= min && matches_at(anchor) {
        return Some(anchor);
    }
    (min..lines.len().saturating_sub(block.len() - 1)).find(|&at| matches_at(at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_patch() {
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,1 +1,1 @@\n-A\n+B\n";
        let files = parse(patch).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "a.txt");
        assert!(!files[0].is_new);
        assert_eq!(files[0].hunks.len(), 1);
        assert_eq!(
            files[0].hunks[0].lines,
            vec![PatchLine::Remove("A".into()), PatchLine::Add("B".into())]
        );
    }

    #[test]
    fn apply_replace_line() {
        let patch = parse("--- a/a.txt\n+++ b/a.txt\n@@ -1,1 +1,1 @@\n-A\n+B\n").unwrap();
        let out = apply("A\n", &patch[0]).unwrap();
        assert_eq!(out, "B\n");
    }

    #[test]
    fn apply_with_context() {
        let patch = parse(
            "--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n",
        )
        .unwrap();
        let out = apply("one\ntwo\nthree\n", &patch[0]).unwrap();
        assert_eq!(out, "one\nTWO\nthree\n");
    }

    #[test]
    fn apply_new_file() {
        let patch = parse("--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+hello\n+world\n").unwrap();
        assert!(patch[0].is_new);
        let out = apply("", &patch[0]).unwrap();
        assert_eq!(out, "hello\nworld\n");
    }

    #[test]
    fn apply_multi_file() {
        let text = concat!(
            "--- a/one.txt\n+++ b/one.txt\n@@ -1,1 +1,1 @@\n-a\n+A\n",
            "--- a/two.txt\n+++ b/two.txt\n@@ -1,1 +1,1 @@\n-b\n+B\n",
        );
        let files = parse(text).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(apply("a\n", &files[0]).unwrap(), "A\n");
        assert_eq!(apply("b\n", &files[1]).unwrap(), "B\n");
    }

    #[test]
    fn apply_shifted_context_found_by_scan() {
        // Hunk says line 1 but the block actually lives at line 3.
        let patch = parse("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n x\n-y\n+Y\n").unwrap();
        let out = apply("pre\npre2\nx\ny\n", &patch[0]).unwrap();
        assert_eq!(out, "pre\npre2\nx\nY\n");
    }

    #[test]
    fn mismatched_hunk_errors() {
        let patch = parse("--- a/f\n+++ b/f\n@@ -1,1 +1,1 @@\n-missing\n+x\n").unwrap();
        let err = apply("different\n", &patch[0]).unwrap_err();
        assert!(matches!(err, PatchError::HunkMismatch { .. }));
    }

    #[test]
    fn garbage_input_rejected() {
        assert!(matches!(parse("not a patch"), Err(PatchError::Empty)));
        assert!(parse("--- a/f\n").is_err());
        assert!(parse("--- a/f\n+++ b/f\n").is_err());
    }

    #[test]
    fn hunk_header_without_counts() {
        let patch = parse("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-A\n+B\n").unwrap();
        assert_eq!(patch[0].hunks[0].old_count, 1);
        assert_eq!(apply("A\n", &patch[0]).unwrap(), "B\n");
    }

    #[test]
    fn multiple_hunks_apply_in_order() {
        let old: String = (1..=10).map(|i| format!("l{i}\n")).collect();
        let text = concat!(
            "--- a/f\n+++ b/f\n",
            "@@ -1,2 +1,2 @@\n-l1\n+L1\n l2\n",
            "@@ -9,2 +9,2 @@\n l9\n-l10\n+L10\n",
        );
        let patch = parse(text).unwrap();
        let out = apply(&old, &patch[0]).unwrap();
        assert!(out.starts_with("L1\nl2\n"));
        assert!(out.ends_with("l9\nL10\n"));
    }
}
