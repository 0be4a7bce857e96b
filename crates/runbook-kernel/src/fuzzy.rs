//! Fuzzy matcher for search ranking and command-palette highlighting.
//!
//! A dynamic program over a `|query| × |target|` grid. Cell `(q, t)` holds the
//! best score for `query[..=q]` with the last matched character at or before
//! `target[t]`; a parallel grid holds the consecutive-match run ending at
//! `(q, t)` (zero when `(q, t)` is not a match). Positions are recovered by
//! walking back from the bottom-right cell.
//!
//! Scoring per matched character:
//!
//! | Bonus                                  | Points                               |
//! |----------------------------------------|--------------------------------------|
//! | base match                             | 1                                    |
//! | consecutive run of length `r`          | `min(r,3)*6 + max(0,r-3)*3`          |
//! | same case                              | 1                                    |
//! | at target index 0                      | 8                                    |
//! | after `/` or `\`                       | 5                                    |
//! | after `_ - . space ' " :`              | 4                                    |
//! | upper-case starting a new run          | 2                                    |
//!
//! Positions are char indices, not byte offsets.

use serde::{Deserialize, Serialize};

/// Raw matcher output. `score == 0` means no match.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FuzzyScore {
    pub score: u32,
    /// Ascending char indices into the target.
    pub positions: Vec<usize>,
}

impl FuzzyScore {
    pub fn is_match(&self) -> bool {
        self.score > 0
    }
}

/// Half-open char range `[start, end)` to highlight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRange {
    pub start: usize,
    pub end: usize,
}

/// A successful match, positions coalesced into ranges.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzyMatch {
    pub score: u32,
    pub matches: Vec<MatchRange>,
}

/// Score `query` against `target`.
///
/// Returns the zero score when either string is empty or the target is
/// shorter than the query. With `allow_non_contiguous == false` the query
/// must appear as a contiguous (case-insensitive) substring.
pub fn score_fuzzy(target: &str, query: &str, allow_non_contiguous: bool) -> FuzzyScore {
    let target: Vec<char> = target.chars().collect();
    let query: Vec<char> = query.chars().collect();
    if target.is_empty() || query.is_empty() || target.len() < query.len() {
        return FuzzyScore::default();
    }

    let target_lower: Vec<char> = target.iter().map(|c| lower(*c)).collect();
    let query_lower: Vec<char> = query.iter().map(|c| lower(*c)).collect();

    let (qlen, tlen) = (query.len(), target.len());
    let mut scores = vec![0u32; qlen * tlen];
    let mut runs = vec![0u32; qlen * tlen];

    for q in 0..qlen {
        for t in 0..tlen {
            let current = q * tlen + t;
            let left = if t > 0 { scores[current - 1] } else { 0 };
            let (diag, run) = if q > 0 && t > 0 {
                let d = (q - 1) * tlen + t - 1;
                (scores[d], runs[d])
            } else {
                (0, 0)
            };

            // Nothing of the query prefix matched before here.
            let score = if diag == 0 && q > 0 {
                0
            } else {
                char_score(&query, &query_lower, q, &target, &target_lower, t, run)
            };

            let contiguous_ok = allow_non_contiguous
                || if q == 0 {
                    starts_with_at(&target_lower, &query_lower, t)
                } else {
                    run > 0
                };

            if score > 0 && diag + score >= left && contiguous_ok {
                runs[current] = run + 1;
                scores[current] = diag + score;
            } else {
                runs[current] = 0;
                scores[current] = left;
            }
        }
    }

    let mut positions = Vec::with_capacity(qlen);
    let (mut q, mut t) = (qlen as isize - 1, tlen as isize - 1);
    while q >= 0 && t >= 0 {
        let current = q as usize * tlen + t as usize;
        if runs[current] == 0 {
            t -= 1;
        } else {
            positions.push(t as usize);
            q -= 1;
            t -= 1;
        }
    }
    positions.reverse();

    FuzzyScore {
        score: scores[qlen * tlen - 1],
        positions,
    }
}

/// Match `query` against `target` for highlighting.
///
/// `None` when either string is empty or nothing matched.
pub fn fuzzy_match(query: &str, target: &str, allow_non_contiguous: bool) -> Option<FuzzyMatch> {
    if query.is_empty() || target.is_empty() {
        return None;
    }
    let raw = score_fuzzy(target, query, allow_non_contiguous);
    if !raw.is_match() {
        return None;
    }
    Some(FuzzyMatch {
        score: raw.score,
        matches: coalesce(&raw.positions),
    })
}

/// Merge adjacent positions into ranges.
pub fn coalesce(positions: &[usize]) -> Vec<MatchRange> {
    let mut ranges: Vec<MatchRange> = Vec::new();
    for &pos in positions {
        match ranges.last_mut() {
            Some(last) if last.end == pos => last.end = pos + 1,
            _ => ranges.push(MatchRange {
                start: pos,
                end: pos + 1,
            }),
        }
    }
    ranges
}

fn char_score(
    query: &[char],
    query_lower: &[char],
    q: usize,
    target: &[char],
    target_lower: &[char],
    t: usize,
    run: u32,
) -> u32 {
    if !equivalent(query_lower[q], target_lower[t]) {
        return 0;
    }

    let mut score = 1;
    if run > 0 {
        score += run.min(3) * 6 + run.saturating_sub(3) * 3;
    }
    if query[q] == target[t] {
        score += 1;
    }

    if t == 0 {
        score += 8;
    } else {
        let separator = separator_bonus(target[t - 1]);
        if separator > 0 {
            score += separator;
        } else if target[t].is_uppercase() && run == 0 {
            score += 2;
        }
    }
    score
}

fn separator_bonus(c: char) -> u32 {
    match c {
        '/' | '\\' => 5,
        '_' | '-' | '.' | ' ' | '\'' | '"' | ':' => 4,
        _ => 0,
    }
}

fn equivalent(a: char, b: char) -> bool {
    a == b || (is_path_separator(a) && is_path_separator(b))
}

fn is_path_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn starts_with_at(haystack: &[char], needle: &[char], at: usize) -> bool {
    haystack.len() >= at + needle.len()
        && haystack[at..at + needle.len()]
            .iter()
            .zip(needle)
            .all(|(h, n)| equivalent(*h, *n))
}

/// Single-char lowercase so indices stay aligned with the input.
fn lower(c: char) -> char {
    let mut it = c.to_lowercase();
    match (it.next(), it.next()) {
        (Some(l), None) => l,
        _ => c,
    }
}
