//! Quoted-phrase argument parser for the `new` command.
//!
//! The argument blob must hold exactly three double-quoted phrases
//! (repository, title, body). Inside a phrase a backslash escapes the next
//! character; escapes are resolved while scanning so `\"` yields `"` and `\\`
//! yields `\`. Anything between phrases, and any trailing text that never opens
//! another phrase, is ignored. The scanner is a single linear pass over the
//! input with three states: outside a phrase, inside a phrase, and escaped.

use std::fmt;

use thiserror::Error;

/// Number of phrases the `new` command expects.
pub const ISSUE_ARGUMENT_PHRASES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Why an argument blob was rejected. Never carries input text.
pub enum BadArgumentsReason {
    MissingOpeningQuote,
    EmptyPhrase,
    TooFewPhrases,
    TooManyPhrases,
}

impl BadArgumentsReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingOpeningQuote => "missing_opening_quote",
            Self::EmptyPhrase => "empty_phrase",
            Self::TooFewPhrases => "too_few_phrases",
            Self::TooManyPhrases => "too_many_phrases",
        }
    }
}

impl fmt::Display for BadArgumentsReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("bad arguments ({reason} at byte {offset})")]
    BadArguments {
        reason: BadArgumentsReason,
        offset: usize,
    },
}

impl ParseError {
    fn bad(reason: BadArgumentsReason, offset: usize) -> Self {
        Self::BadArguments { reason, offset }
    }

    pub fn reason(&self) -> BadArgumentsReason {
        match self {
            Self::BadArguments { reason, .. } => *reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Three non-empty, escape-resolved fields. Only [`parse_issue_arguments`]
/// constructs this type.
pub struct ParsedArguments {
    repo: String,
    title: String,
    body: String,
}

impl ParsedArguments {
    pub fn repo(&self) -> &str {
        &self.repo
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_parts(self) -> (String, String, String) {
        (self.repo, self.title, self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Outside,
    Inside,
    Escaped,
}

/// Parses `"repo" "title" "body"` into [`ParsedArguments`].
pub fn parse_issue_arguments(input: &str) -> Result<ParsedArguments, ParseError> {
    let first_significant = input
        .char_indices()
        .find(|(_, ch)| !ch.is_whitespace());
    match first_significant {
        Some((_, '"')) => {}
        Some((offset, _)) => {
            return Err(ParseError::bad(
                BadArgumentsReason::MissingOpeningQuote,
                offset,
            ))
        }
        None => {
            return Err(ParseError::bad(
                BadArgumentsReason::MissingOpeningQuote,
                input.len(),
            ))
        }
    }

    let mut phrases: Vec<String> = Vec::with_capacity(ISSUE_ARGUMENT_PHRASES);
    let mut state = ScanState::Outside;
    let mut phrase_start = 0_usize;
    let mut current = String::new();

    for (offset, ch) in input.char_indices() {
        state = match (state, ch) {
            (ScanState::Outside, '"') => {
                phrase_start = offset;
                current.clear();
                ScanState::Inside
            }
            (ScanState::Outside, _) => ScanState::Outside,
            (ScanState::Inside, '\\') => ScanState::Escaped,
            (ScanState::Inside, '"') => {
                // Only a closed fourth phrase counts; an unterminated one is trailing text.
                if phrases.len() == ISSUE_ARGUMENT_PHRASES {
                    return Err(ParseError::bad(
                        BadArgumentsReason::TooManyPhrases,
                        phrase_start,
                    ));
                }
                if current.is_empty() {
                    return Err(ParseError::bad(BadArgumentsReason::EmptyPhrase, phrase_start));
                }
                phrases.push(std::mem::take(&mut current));
                ScanState::Outside
            }
            (ScanState::Inside, _) | (ScanState::Escaped, _) => {
                current.push(ch);
                ScanState::Inside
            }
        };
    }

    if phrases.len() < ISSUE_ARGUMENT_PHRASES {
        return Err(ParseError::bad(
            BadArgumentsReason::TooFewPhrases,
            input.len(),
        ));
    }

    let mut phrases = phrases.into_iter();
    match (phrases.next(), phrases.next(), phrases.next()) {
        (Some(repo), Some(title), Some(body)) => Ok(ParsedArguments { repo, title, body }),
        _ => Err(ParseError::bad(
            BadArgumentsReason::TooFewPhrases,
            input.len(),
        )),
    }
}

/// Escapes `"` and `\` so the result can be wrapped in quotes and re-parsed.
pub fn escape_phrase(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len() + 2);
    for ch in raw.chars() {
        if ch == '"' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Renders parsed arguments back into the quoted form accepted by the parser.
pub fn render_issue_arguments(arguments: &ParsedArguments) -> String {
    format!(
        "\"{}\" \"{}\" \"{}\"",
        escape_phrase(arguments.repo()),
        escape_phrase(arguments.title()),
        escape_phrase(arguments.body())
    )
}
