//! Glob matching for KEYS and SCAN ... MATCH.
//!
//! Supported syntax:
//! - `*` matches any run of bytes, including none
//! - `?` matches exactly one byte
//! - `[abc]`, `[a-z]`, `[^a]` match one byte from (or outside) a class
//! - `\x` matches `x` literally

use bytes::Bytes;

/// A compiled glob pattern. Matching is byte-wise, so binary keys are supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobPattern {
    pattern: Bytes,
}

impl GlobPattern {
    pub fn new(pattern: impl Into<Bytes>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// True if the pattern is `*`, i.e. it accepts everything.
    pub fn is_match_all(&self) -> bool {
        self.pattern.as_ref() == b"*"
    }

    pub fn matches(&self, text: &[u8]) -> bool {
        match_bytes(&self.pattern, text)
    }
}

/// Star backtracking over a single pointer pair: on a mismatch the most recent `*`
/// absorbs one more byte. Every other token consumes exactly one byte, so this is
/// O(pattern * text) in the worst case.
fn match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Pattern index after the last star, and the text index it resumes from.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            if pattern[p] == b'*' {
                p += 1;
                star = Some((p, t));
                continue;
            }
            if let Some(next) = match_one(pattern, p, text[t]) {
                p = next;
                t += 1;
                continue;
            }
        }
        match star {
            Some((resume, absorbed)) => {
                star = Some((resume, absorbed + 1));
                p = resume;
                t = absorbed + 1;
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches the single-byte token at `pattern[p]` against `c`, returning the index of
/// the next token.
fn match_one(pattern: &[u8], p: usize, c: u8) -> Option<usize> {
    match pattern[p] {
        b'?' => Some(p + 1),
        b'[' => match match_class(&pattern[p + 1..], c) {
            Some((true, after)) => Some(pattern.len() - after.len()),
            _ => None,
        },
        b'\\' if p + 1 < pattern.len() => (pattern[p + 1] == c).then_some(p + 2),
        literal => (literal == c).then_some(p + 1),
    }
}

/// Matches `c` against the class body following `[`. Returns whether it matched and
/// the pattern after the closing `]`, or None for an unterminated class.
fn match_class(body: &[u8], c: u8) -> Option<(bool, &[u8])> {
    let (negate, mut i) = match body.first() {
        Some(b'^') => (true, 1),
        _ => (false, 0),
    };
    let mut matched = false;

    while i < body.len() && body[i] != b']' {
        if body[i] == b'\\' && i + 1 < body.len() {
            matched |= body[i + 1] == c;
            i += 2;
            continue;
        }
        if i + 2 < body.len() && body[i + 1] == b'-' && body[i + 2] != b']' {
            let (lo, hi) = if body[i] <= body[i + 2] {
                (body[i], body[i + 2])
            } else {
                (body[i + 2], body[i])
            };
            matched |= (lo..=hi).contains(&c);
            i += 3;
            continue;
        }
        matched |= body[i] == c;
        i += 1;
    }

    if i >= body.len() {
        return None;
    }
    Some((matched != negate, &body[i + 1..]))
}
