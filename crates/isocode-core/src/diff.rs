//! Unified diff creation and application.
//!
//! Diffs are created with `similar` and applied by a strict parser that
//! verifies every context and removal line against the original. The stored
//! diff at `diff_request` time is the single source of truth for what an
//! approval applies.

use crate::error::{Error, Result};
use similar::TextDiff;

/// Render a unified diff between two versions of a file.
pub fn create_unified_diff(path: &str, original: &str, updated: &str) -> String {
    TextDiff::from_lines(original, updated)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{}", path), &format!("b/{}", path))
        .to_string()
}

/// Apply a unified diff to `original`, returning the patched text.
///
/// Fails if any hunk's context or removal lines do not match the original
/// exactly, if hunks overlap, or if the diff is malformed.
pub fn apply_unified_diff(original: &str, diff: &str) -> Result<String> {
    let olines: Vec<&str> = original.split_inclusive('\n').collect();
    let mut out = String::with_capacity(original.len());
    let mut opos = 0usize;
    let mut in_hunk = false;
    let mut saw_hunk = false;
    // Whether the last emitted body line was an addition (for the
    // "\ No newline at end of file" marker).
    let mut last_was_add = false;

    for line in diff.lines() {
        if line.starts_with("--- ") || line.starts_with("+++ ") || line.starts_with("diff ") {
            continue;
        }
        if let Some(header) = line.strip_prefix("@@ ") {
            let (old_start, old_count) = parse_hunk_header(header)
                .ok_or_else(|| Error::user(format!("malformed hunk header: {}", line)))?;
            // A zero-count range names the line after which insertions go.
            let target = if old_count == 0 {
                old_start
            } else {
                old_start.saturating_sub(1)
            };
            if target < opos {
                return Err(Error::user("overlapping hunks"));
            }
            if target > olines.len() {
                return Err(Error::user(format!(
                    "hunk start {} beyond end of file ({} lines)",
                    old_start,
                    olines.len()
                )));
            }
            for l in &olines[opos..target] {
                out.push_str(l);
            }
            opos = target;
            in_hunk = true;
            saw_hunk = true;
            last_was_add = false;
            continue;
        }
        if !in_hunk {
            continue;
        }

        if let Some(marker) = line.strip_prefix('\\') {
            // "\ No newline at end of file" - on the new side, the previous
            // added line must lose the terminator we gave it.
            let _ = marker;
            if last_was_add && out.ends_with('\n') {
                out.pop();
            }
            continue;
        }

        let (op, text) = match line.as_bytes().first() {
            Some(b' ') => (' ', &line[1..]),
            Some(b'-') => ('-', &line[1..]),
            Some(b'+') => ('+', &line[1..]),
            None => (' ', ""), // bare empty line = empty context line
            Some(_) => return Err(Error::user(format!("unexpected diff line: {}", line))),
        };

        match op {
            ' ' | '-' => {
                let actual = olines
                    .get(opos)
                    .map(|l| l.strip_suffix('\n').unwrap_or(l))
                    .ok_or_else(|| Error::user("hunk extends past end of file"))?;
                if actual != text {
                    return Err(Error::user(format!(
                        "context mismatch at line {}: expected {:?}, found {:?}",
                        opos + 1,
                        text,
                        actual
                    )));
                }
                if op == ' ' {
                    out.push_str(olines[opos]);
                }
                opos += 1;
                last_was_add = false;
            }
            '+' => {
                out.push_str(text);
                out.push('\n');
                last_was_add = true;
            }
            _ => unreachable!(),
        }
    }

    if !saw_hunk {
        return Err(Error::user("diff contains no hunks"));
    }

    for l in &olines[opos..] {
        out.push_str(l);
    }
    Ok(out)
}

/// Non-failing variant: `Some(patched)` on success, `None` otherwise. The
/// original is never touched.
pub fn try_apply_patch(original: &str, diff: &str) -> Option<String> {
    apply_unified_diff(original, diff).ok()
}

fn parse_hunk_header(header: &str) -> Option<(usize, usize)> {
    // "-l[,c] +l[,c] @@ ..."
    let rest = header.strip_prefix('-')?;
    let (old_range, _rest) = rest.split_once(" +")?;
    parse_range(old_range)
}

fn parse_range(s: &str) -> Option<(usize, usize)> {
    match s.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((s.parse().ok()?, 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(original: &str, updated: &str) {
        let diff = create_unified_diff("file.txt", original, updated);
        let patched = apply_unified_diff(original, &diff)
            .unwrap_or_else(|e| panic!("apply failed: {}\ndiff:\n{}", e, diff));
        assert_eq!(patched, updated, "diff was:\n{}", diff);
    }

    #[test]
    fn roundtrip_simple_replace() {
        roundtrip("a\nb\nc\n", "a\nB\nc\n");
    }

    #[test]
    fn roundtrip_insert_and_delete() {
        roundtrip("one\ntwo\nthree\nfour\n", "one\nthree\nfour\nfive\n");
    }

    #[test]
    fn roundtrip_from_empty() {
        roundtrip("", "fresh\ncontent\n");
    }

    #[test]
    fn roundtrip_to_empty() {
        roundtrip("going\naway\n", "");
    }

    #[test]
    fn roundtrip_missing_trailing_newline() {
        roundtrip("a\nb\n", "a\nb\nc");
        roundtrip("x\ny", "x\nz");
    }

    #[test]
    fn roundtrip_distant_hunks() {
        let original: String = (0..60).map(|i| format!("line {}\n", i)).collect();
        let updated = original.replace("line 5\n", "LINE 5\n").replace("line 55\n", "LINE 55\n");
        roundtrip(&original, &updated);
    }

    #[test]
    fn apply_rejects_context_mismatch() {
        let diff = create_unified_diff("f", "a\nb\nc\n", "a\nB\nc\n");
        assert!(apply_unified_diff("totally\ndifferent\n", &diff).is_err());
    }

    #[test]
    fn apply_rejects_garbage() {
        assert!(apply_unified_diff("a\n", "not a diff").is_err());
    }

    #[test]
    fn try_apply_patch_is_none_on_failure() {
        assert_eq!(try_apply_patch("a\n", "nonsense"), None);
        let diff = create_unified_diff("f", "a\n", "b\n");
        assert_eq!(try_apply_patch("a\n", &diff), Some("b\n".to_string()));
    }
}
