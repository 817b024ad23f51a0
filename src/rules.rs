//! Substitution rules: the `s/from/to[/count]` grammar and the byte rewriter.
//!
//! Rules are decoded once at startup and shared read-only by every flow.
//! What does change per connection is the expiry counters, handed out by
//! [`RuleSet::fresh_counts`] and passed back into [`RuleSet::apply`].

use log::info;
use std::fmt;
use thiserror::Error;

/// Which half of a rule a decoding error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSide {
    Source,
    Destination,
}

impl fmt::Display for PatternSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternSide::Source => write!(f, "src pattern"),
            PatternSide::Destination => write!(f, "dst pattern"),
        }
    }
}

/// Errors produced while decoding a rule string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule must start with 's/'")]
    NotASubstitution,

    #[error("missing first '/' in rule")]
    MissingFrom,

    #[error("missing second '/' in rule")]
    MissingTo,

    #[error("empty source pattern")]
    EmptySource,

    #[error("{0}: unexpected end")]
    UnexpectedEnd(PatternSide),

    #[error("{0}: non-hex sequence")]
    NonHexSequence(PatternSide),

    #[error("invalid expire count {0:?}")]
    BadCount(String),
}

/// One byte-level substitution, immutable once parsed.
///
/// `from` is never empty; `to` may be. The command-line spellings are kept
/// for diagnostic printing only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    from: Vec<u8>,
    to: Vec<u8>,
    forig: String,
    torig: String,
}

impl Rule {
    /// Decode a single `s/from/to[/count]` string.
    ///
    /// Returns the rule together with its initial expiry count: -1 for
    /// unlimited, otherwise the number of applications allowed per
    /// connection. An absent, empty or non-positive count means unlimited.
    pub fn parse(text: &str) -> Result<(Self, i32), RuleError> {
        let mut fields = text.splitn(4, '/');
        if fields.next() != Some("s") {
            // also rejects a rule with no '/' at all, which would otherwise
            // leave the whole string in the first field
            if !text.contains('/') {
                return Err(RuleError::MissingFrom);
            }
            return Err(RuleError::NotASubstitution);
        }
        let forig = fields.next().ok_or(RuleError::MissingFrom)?;
        let torig = fields.next().ok_or(RuleError::MissingTo)?;
        let count = match fields.next() {
            None | Some("") => -1,
            Some(raw) => {
                let n: i32 = raw
                    .parse()
                    .map_err(|_| RuleError::BadCount(raw.to_string()))?;
                if n > 0 {
                    n
                } else {
                    -1
                }
            }
        };

        let from = unescape(forig, PatternSide::Source)?;
        if from.is_empty() {
            return Err(RuleError::EmptySource);
        }
        let to = unescape(torig, PatternSide::Destination)?;

        Ok((
            Rule {
                from,
                to,
                forig: forig.to_string(),
                torig: torig.to_string(),
            },
            count,
        ))
    }

    /// Decoded byte pattern this rule matches.
    pub fn pattern(&self) -> &[u8] {
        &self.from
    }

    /// Decoded replacement bytes.
    pub fn replacement(&self) -> &[u8] {
        &self.to
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s/{}/{}", self.forig, self.torig)
    }
}

/// Decode HTTP-like percent escapes: `%XX` is one byte, `%%` a literal `%`,
/// anything else passes through unchanged.
fn unescape(text: &str, side: PatternSide) -> Result<Vec<u8>, RuleError> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'%') {
            out.push(b'%');
            i += 2;
            continue;
        }
        let hi = *bytes.get(i + 1).ok_or(RuleError::UnexpectedEnd(side))?;
        let lo = *bytes.get(i + 2).ok_or(RuleError::UnexpectedEnd(side))?;
        let hi = hex_value(hi).ok_or(RuleError::NonHexSequence(side))?;
        let lo = hex_value(lo).ok_or(RuleError::NonHexSequence(side))?;
        out.push(hi * 16 + lo);
        i += 3;
    }
    Ok(out)
}

fn hex_value(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|v| v as u8)
}

/// Ordered rule list shared read-only by every connection.
///
/// Order defines priority: at each buffer position the first non-expired
/// matching rule wins, regardless of pattern length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
    initial: Vec<i32>,
}

impl RuleSet {
    /// Parse every rule string given on the command line.
    pub fn parse<S: AsRef<str>>(texts: &[S]) -> Result<Self, RuleError> {
        let mut rules = Vec::with_capacity(texts.len());
        let mut initial = Vec::with_capacity(texts.len());
        for text in texts {
            info!("Parsing rule {}...", text.as_ref());
            let (rule, count) = Rule::parse(text.as_ref())?;
            rules.push(rule);
            initial.push(count);
        }
        Ok(RuleSet { rules, initial })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Fresh per-connection expiry counters, one per rule: -1 unlimited,
    /// positive N for "N applications remaining".
    pub fn fresh_counts(&self) -> Vec<i32> {
        self.initial.clone()
    }

    /// Greedy left-to-right substitution of `input` into `out`.
    ///
    /// At each position the first rule with a live counter and a matching
    /// prefix wins; its replacement is appended and the cursor skips the
    /// matched bytes, so substituted output is never rescanned. Counted
    /// rules are decremented in `live`; -1 entries are left untouched.
    ///
    /// Returns the number of replacements applied.
    pub fn apply(&self, input: &[u8], live: &mut [i32], out: &mut Vec<u8>) -> usize {
        debug_assert_eq!(live.len(), self.rules.len());
        out.clear();
        let mut changes = 0;
        let mut i = 0;
        while i < input.len() {
            let mut matched = false;
            for (j, rule) in self.rules.iter().enumerate() {
                if live[j] != 0 && input[i..].starts_with(&rule.from) {
                    info!("    Applying rule s/{}/{}...", rule.forig, rule.torig);
                    if live[j] > 0 {
                        live[j] -= 1;
                        if live[j] == 0 {
                            info!("    (rule just expired)");
                        }
                    }
                    out.extend_from_slice(&rule.to);
                    i += rule.from.len();
                    changes += 1;
                    matched = true;
                    break;
                }
            }
            if !matched {
                out.push(input[i]);
                i += 1;
            }
        }
        if changes == 0 {
            info!("Forwarding untouched packet of size {}.", input.len());
        } else {
            info!(
                "Done {} replacements, forwarding packet of size {} (orig {}).",
                changes,
                out.len(),
                input.len()
            );
        }
        changes
    }
}
