//! Git patches restricted to one mapping
//!
//! `git diff` output is split into per-file sections. Sections outside the
//! mapping's filters are dropped, the `add` prefix is stripped from the
//! remaining ones, and changed and binary paths are collected from the
//! section headers.

use crate::git::matcher::PathMatcher;

const DIFF_HEADER: &[u8] = b"diff --git ";

/// A patch ready to be applied under a mapping's `to` directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Patch {
    /// Patch text, binary content embedded as `GIT binary patch` hunks
    pub content: Vec<u8>,
    /// Repository-relative paths touched by the patch
    pub paths: Vec<String>,
    /// Subset of `paths` whose content is binary
    pub binary_paths: Vec<String>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// A full tree of one mapping at one commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    /// Commit the archive was taken from
    pub commit: String,
    /// Tar stream with paths relative to the mapping's `add`
    pub content: Vec<u8>,
    /// Repository-relative paths included
    pub paths: Vec<String>,
}

struct Section<'a> {
    path: String,
    lines: Vec<&'a [u8]>,
}

/// Keep the sections of `raw` that `matcher` accepts, rebased onto `add`
pub fn filter_patch(raw: &[u8], matcher: &PathMatcher) -> Patch {
    let mut patch = Patch::default();

    for section in split_sections(raw) {
        if !matcher.is_path_matched(&section.path) {
            continue;
        }

        let mut binary = false;
        let mut in_body = false;
        for line in &section.lines {
            let trimmed = trim_eol(line);
            if in_body {
                patch.content.extend_from_slice(line);
                continue;
            }

            if trimmed == b"GIT binary patch" || trimmed.starts_with(b"Binary files ") {
                binary = true;
            }
            if trimmed.starts_with(b"@@") || trimmed == b"GIT binary patch" {
                in_body = true;
                patch.content.extend_from_slice(line);
            } else {
                patch.content.extend_from_slice(&rebase_header(line, matcher.base()));
            }
        }

        if binary {
            patch.binary_paths.push(section.path.clone());
        }
        patch.paths.push(section.path);
    }

    patch
}

fn split_sections(raw: &[u8]) -> Vec<Section<'_>> {
    let mut sections: Vec<Section<'_>> = Vec::new();

    for line in raw.split_inclusive(|b| *b == b'\n') {
        if line.starts_with(DIFF_HEADER) {
            if let Some(path) = header_path(trim_eol(&line[DIFF_HEADER.len()..])) {
                sections.push(Section {
                    path,
                    lines: vec![line],
                });
                continue;
            }
        }

        // "Submodule sub 1234..5678:" lines separate nested submodule diffs
        if line.starts_with(b"Submodule ") {
            continue;
        }

        if let Some(current) = sections.last_mut() {
            current.lines.push(line);
        }
    }

    sections
}

/// Split `a/<path> b/<path>` into its two path tokens, quotes included
fn split_header_tokens(rest: &[u8]) -> Option<(&[u8], &[u8])> {
    if rest.first() == Some(&b'"') {
        let end = closing_quote(rest)?;
        let b_side = rest.get(end + 1..)?.strip_prefix(b" ")?;
        return Some((&rest[..=end], b_side));
    }

    // Renames are disabled, so an unquoted header is symmetric
    if rest.len() < 7 || rest.len() % 2 == 0 {
        return None;
    }
    let half = (rest.len() - 1) / 2;
    if rest[half] != b' ' {
        return None;
    }
    Some((&rest[..half], &rest[half + 1..]))
}

/// Index of the quote closing the C-style string starting at `quoted[0]`
fn closing_quote(quoted: &[u8]) -> Option<usize> {
    let mut i = 1;
    while i < quoted.len() {
        match quoted[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Repository path named by a `diff --git` header
fn header_path(rest: &[u8]) -> Option<String> {
    let (a_side, b_side) = split_header_tokens(rest)?;
    let a_path = token_path(a_side)?;
    let path = a_path.strip_prefix(b"a/")?;
    if token_path(b_side)?.strip_prefix(b"b/") != Some(path) {
        return None;
    }
    Some(String::from_utf8_lossy(path).into_owned())
}

/// Raw bytes of a header path token, unquoting it when quoted
fn token_path(token: &[u8]) -> Option<Vec<u8>> {
    match token.strip_prefix(b"\"") {
        Some(quoted) => Some(unquote(quoted.strip_suffix(b"\"")?)),
        None => Some(token.to_vec()),
    }
}

/// Undo git's C-style path quoting
fn unquote(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s[i] != b'\\' || i + 1 == s.len() {
            out.push(s[i]);
            i += 1;
            continue;
        }

        let escaped = s[i + 1];
        let octal = s.get(i + 1..i + 4).filter(|d| d.iter().all(|c| (b'0'..=b'7').contains(c)));
        if let Some(digits) = octal {
            let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
            out.push(value as u8);
            i += 4;
            continue;
        }

        out.push(match escaped {
            b'a' => 0x07,
            b'b' => 0x08,
            b't' => b'\t',
            b'n' => b'\n',
            b'v' => 0x0b,
            b'f' => 0x0c,
            b'r' => b'\r',
            other => other,
        });
        i += 2;
    }
    out
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Strip `<base>/` once from the path tokens of a section header line
fn rebase_header(line: &[u8], base: &str) -> Vec<u8> {
    if base.is_empty() {
        return line.to_vec();
    }

    let body = trim_eol(line);
    let eol = &line[body.len()..];

    let rebased = if let Some(rest) = body.strip_prefix(DIFF_HEADER) {
        split_header_tokens(rest).map(|(a_side, b_side)| {
            let mut out = DIFF_HEADER.to_vec();
            out.extend(rebase_token(a_side, b'a', base));
            out.push(b' ');
            out.extend(rebase_token(b_side, b'b', base));
            out
        })
    } else if let Some(token) = body.strip_prefix(b"--- ") {
        Some([b"--- ".as_slice(), rebase_token(token, b'a', base).as_slice()].concat())
    } else if let Some(token) = body.strip_prefix(b"+++ ") {
        Some([b"+++ ".as_slice(), rebase_token(token, b'b', base).as_slice()].concat())
    } else if let Some(rest) = body.strip_prefix(b"Binary files ") {
        rest.strip_suffix(b" differ")
            .and_then(split_binary_pair)
            .map(|(a_side, b_side)| {
                let mut out = b"Binary files ".to_vec();
                out.extend(rebase_token(a_side, b'a', base));
                out.extend_from_slice(b" and ");
                out.extend(rebase_token(b_side, b'b', base));
                out.extend_from_slice(b" differ");
                out
            })
    } else {
        None
    };

    match rebased {
        Some(mut out) => {
            out.extend_from_slice(eol);
            out
        }
        None => line.to_vec(),
    }
}

/// `<a token> and <b token>` of a `Binary files` line
fn split_binary_pair(pair: &[u8]) -> Option<(&[u8], &[u8])> {
    if pair.first() == Some(&b'"') {
        let end = closing_quote(pair)?;
        let b_side = pair.get(end + 1..)?.strip_prefix(b" and ")?;
        return Some((&pair[..=end], b_side));
    }
    let at = pair.windows(5).position(|w| w == b" and ")?;
    Some((&pair[..at], &pair[at + 5..]))
}

/// `<side>/<base>/<rest>` becomes `<side>/<rest>`; anything else is kept
fn rebase_token(token: &[u8], side: u8, base: &str) -> Vec<u8> {
    let (quoted, inner) = match token.strip_prefix(b"\"") {
        Some(inner) => (true, inner),
        None => (false, token),
    };

    let mut prefix = vec![side, b'/'];
    prefix.extend_from_slice(base.as_bytes());
    prefix.push(b'/');

    let Some(rest) = inner.strip_prefix(prefix.as_slice()) else {
        return token.to_vec();
    };
    let mut out = Vec::with_capacity(token.len());
    if quoted {
        out.push(b'"');
    }
    out.extend_from_slice(&[side, b'/']);
    out.extend_from_slice(rest);
    out
}
