//! Glob patterns for symbol selection and trigger key matching
//!
//! Supported syntax: `*` (any run, including `/`), `?` (one character),
//! `[abc]`, `[a-z]`, `[!abc]` / `[^abc]` classes and one level of `{A,B}`
//! alternation. Matching is case-sensitive.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyOne,
    AnyRun,
    Class { negate: bool, ranges: Vec<(char, char)> },
}

/// Compiled glob pattern
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    alternatives: Vec<Vec<Token>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobError {
    pub pattern: String,
    pub reason: &'static str,
}

impl fmt::Display for GlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid glob '{}': {}", self.pattern, self.reason)
    }
}

impl std::error::Error for GlobError {}

impl GlobPattern {
    pub fn compile(pattern: &str) -> Result<Self, GlobError> {
        let err = |reason| GlobError {
            pattern: pattern.to_string(),
            reason,
        };
        if pattern.is_empty() {
            return Err(err("empty pattern"));
        }

        let alternatives = expand_braces(pattern)
            .ok_or_else(|| err("unbalanced braces"))?
            .iter()
            .map(|alt| tokenize(alt).ok_or_else(|| err("unterminated character class")))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            source: pattern.to_string(),
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the pattern is a bare `*`
    pub fn matches_everything(&self) -> bool {
        self.alternatives
            .iter()
            .any(|alt| !alt.is_empty() && alt.iter().all(|t| *t == Token::AnyRun))
    }

    pub fn matches(&self, text: &str) -> bool {
        let chars: Vec<char> = text.chars().collect();
        self.alternatives
            .iter()
            .any(|tokens| match_tokens(tokens, &chars))
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Expand a single, non-nested `{a,b,...}` group
fn expand_braces(pattern: &str) -> Option<Vec<String>> {
    let Some(open) = pattern.find('{') else {
        return (!pattern.contains('}')).then(|| vec![pattern.to_string()]);
    };
    let close = open + pattern[open..].find('}')?;
    let (prefix, body, suffix) = (&pattern[..open], &pattern[open + 1..close], &pattern[close + 1..]);
    if body.contains('{') || suffix.contains('{') || suffix.contains('}') {
        return None;
    }
    Some(
        body.split(',')
            .map(|choice| format!("{}{}{}", prefix, choice, suffix))
            .collect(),
    )
}

fn tokenize(pattern: &str) -> Option<Vec<Token>> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut tokens = Vec::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => {
                // Collapse runs of stars
                if tokens.last() != Some(&Token::AnyRun) {
                    tokens.push(Token::AnyRun);
                }
                i += 1;
            }
            '?' => {
                tokens.push(Token::AnyOne);
                i += 1;
            }
            '[' => {
                i += 1;
                let negate = matches!(chars.get(i), Some('!') | Some('^'));
                if negate {
                    i += 1;
                }
                let mut ranges = Vec::new();
                let mut first = true;
                loop {
                    let c = *chars.get(i)?;
                    if c == ']' && !first {
                        i += 1;
                        break;
                    }
                    first = false;
                    if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|hi| *hi != ']') {
                        ranges.push((c, chars[i + 2]));
                        i += 3;
                    } else {
                        ranges.push((c, c));
                        i += 1;
                    }
                }
                tokens.push(Token::Class { negate, ranges });
            }
            c => {
                tokens.push(Token::Literal(c));
                i += 1;
            }
        }
    }
    Some(tokens)
}

/// Iterative matcher that backtracks to the most recent `*`
fn match_tokens(tokens: &[Token], text: &[char]) -> bool {
    let (mut ti, mut ci) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ci < text.len() {
        let step = match tokens.get(ti) {
            Some(Token::AnyRun) => {
                backtrack = Some((ti, ci));
                ti += 1;
                continue;
            }
            Some(Token::AnyOne) => true,
            Some(Token::Literal(c)) => *c == text[ci],
            Some(Token::Class { negate, ranges }) => {
                let hit = ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&text[ci]));
                hit != *negate
            }
            None => false,
        };
        if step {
            ti += 1;
            ci += 1;
        } else if let Some((star, from)) = backtrack {
            ti = star + 1;
            ci = from + 1;
            backtrack = Some((star, from + 1));
        } else {
            return false;
        }
    }
    tokens[ti..].iter().all(|t| *t == Token::AnyRun)
}
