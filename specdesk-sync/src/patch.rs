//! Unified diffs between document versions.
//!
//! The server renders diffs with `similar`; clients replay them onto their
//! cached copy with [`apply_patch`]. Every context and removed line is
//! checked against the source, so a patch only applies to the exact text it
//! was computed from.

use similar::TextDiff;
use thiserror::Error;

/// Lines of unchanged context around each hunk.
pub const CONTEXT_RADIUS: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("malformed hunk header at patch line {line}")]
    MalformedHeader { line: usize },

    #[error("patch ended inside a hunk at patch line {line}")]
    Truncated { line: usize },

    #[error("unexpected hunk line at patch line {line}")]
    UnexpectedLine { line: usize },

    #[error("hunk at patch line {line} does not fit the source")]
    OutOfRange { line: usize },

    #[error("source does not match hunk at patch line {line}")]
    ContextMismatch { line: usize },
}

/// Render a unified diff from `old` to `new`, labelled with `path`.
///
/// Identical inputs produce an empty string.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(CONTEXT_RADIUS)
        .header(path, path)
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sign {
    Context,
    Remove,
    Add,
}

struct HunkLine {
    sign: Sign,
    text: String,
}

struct HunkHeader {
    old_start: usize,
    old_len: usize,
    new_len: usize,
}

/// Apply a unified diff to `source`.
///
/// Text outside hunks (file headers, `diff`/`index` lines) is ignored.
/// An empty patch returns `source` unchanged.
pub fn apply_patch(source: &str, patch: &str) -> Result<String, PatchError> {
    let src: Vec<&str> = source.split_inclusive('\n').collect();
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0usize;

    let patch = patch.strip_suffix('\n').unwrap_or(patch);
    let mut lines = patch.split('\n').enumerate().peekable();
    while let Some((idx, line)) = lines.next() {
        if !line.starts_with("@@") {
            continue;
        }
        let header_line = idx + 1;
        let header = parse_header(line).ok_or(PatchError::MalformedHeader { line: header_line })?;

        // A zero-length old range names the line *after which* to insert.
        let pos = if header.old_len == 0 {
            header.old_start
        } else {
            header
                .old_start
                .checked_sub(1)
                .ok_or(PatchError::MalformedHeader { line: header_line })?
        };
        if pos < cursor || pos > src.len() {
            return Err(PatchError::OutOfRange { line: header_line });
        }
        src[cursor..pos].iter().for_each(|l| out.push_str(l));
        cursor = pos;

        let body = read_hunk(&mut lines, &header, header_line)?;
        for hunk_line in &body {
            if hunk_line.sign != Sign::Add {
                if src.get(cursor).copied() != Some(hunk_line.text.as_str()) {
                    return Err(PatchError::ContextMismatch { line: header_line });
                }
                cursor += 1;
            }
            if hunk_line.sign != Sign::Remove {
                out.push_str(&hunk_line.text);
            }
        }
    }

    src[cursor..].iter().for_each(|l| out.push_str(l));
    Ok(out)
}

fn read_hunk<'a, I>(
    lines: &mut std::iter::Peekable<I>,
    header: &HunkHeader,
    header_line: usize,
) -> Result<Vec<HunkLine>, PatchError>
where
    I: Iterator<Item = (usize, &'a str)>,
{
    let mut body = Vec::with_capacity(header.old_len.max(header.new_len));
    let (mut old_seen, mut new_seen) = (0usize, 0usize);
    let mut last_line = header_line;

    while old_seen < header.old_len || new_seen < header.new_len {
        let (idx, raw) = lines
            .next()
            .ok_or(PatchError::Truncated { line: last_line })?;
        last_line = idx + 1;

        let (sign, rest) = match raw.chars().next() {
            Some(' ') => (Sign::Context, &raw[1..]),
            Some('-') => (Sign::Remove, &raw[1..]),
            Some('+') => (Sign::Add, &raw[1..]),
            // Some tools strip the space from empty context lines.
            None => (Sign::Context, ""),
            Some(_) => return Err(PatchError::UnexpectedLine { line: last_line }),
        };
        match sign {
            Sign::Context => {
                old_seen += 1;
                new_seen += 1;
            }
            Sign::Remove => old_seen += 1,
            Sign::Add => new_seen += 1,
        }
        if old_seen > header.old_len || new_seen > header.new_len {
            return Err(PatchError::UnexpectedLine { line: last_line });
        }

        let mut text = String::with_capacity(rest.len() + 1);
        text.push_str(rest);
        text.push('\n');
        // "\ No newline at end of file" applies to the line just read.
        if lines.peek().is_some_and(|(_, next)| next.starts_with('\\')) {
            lines.next();
            text.pop();
        }
        body.push(HunkLine { sign, text });
    }

    Ok(body)
}

/// Parse `@@ -a[,b] +c[,d] @@[ section]`.
fn parse_header(line: &str) -> Option<HunkHeader> {
    let inner = line.strip_prefix("@@ ")?;
    let end = inner.find(" @@")?;
    let mut ranges = inner[..end].split_whitespace();
    let (old_start, old_len) = parse_range(ranges.next()?.strip_prefix('-')?)?;
    let (_, new_len) = parse_range(ranges.next()?.strip_prefix('+')?)?;
    if ranges.next().is_some() {
        return None;
    }
    Some(HunkHeader {
        old_start,
        old_len,
        new_len,
    })
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, len)) => Some((start.parse().ok()?, len.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
