// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parser for the `{label="value", ...}` label sets carried in the `_stream` field.

use std::collections::HashSet;

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while_m_n,
    character::complete::{char, none_of},
    combinator::{all_consuming, cut, map, map_opt},
    error::Error as NomError,
    multi::fold_many0,
    sequence::{delimited, preceded},
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLabel {
    pub label: String,
    pub value: String,
}

impl StreamLabel {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamLabelError {
    #[error("stream fields must be wrapped in braces: {0:?}")]
    MissingBraces(String),
    #[error("unterminated quoted value in stream fields {0:?}")]
    UnterminatedQuote(String),
    #[error("missing '=' in stream field {0:?}")]
    MissingSeparator(String),
    #[error("invalid label name in stream field {0:?}")]
    InvalidLabel(String),
    #[error("value of label {label:?} must be a double-quoted string, got {value}")]
    UnquotedValue { label: String, value: String },
    #[error("value of label {0:?} must not be empty")]
    EmptyValue(String),
    #[error("duplicate label {0:?} in stream fields")]
    DuplicateLabel(String),
}

/// Parses a `_stream` value into its labels, keeping their original order.
///
/// Both `{}` and the empty string yield no labels.
pub fn parse_stream_labels(input: &str) -> Result<Vec<StreamLabel>, StreamLabelError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let interior = trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| StreamLabelError::MissingBraces(input.to_string()))?;
    if interior.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut seen = HashSet::new();
    let mut labels = Vec::new();
    for field in split_fields(interior).ok_or_else(|| StreamLabelError::UnterminatedQuote(input.to_string()))? {
        let label = parse_field(field)?;
        if !seen.insert(label.label.clone()) {
            return Err(StreamLabelError::DuplicateLabel(label.label));
        }
        labels.push(label);
    }
    Ok(labels)
}

/// Renders labels back into the `{label="value", ...}` form.
pub fn render_stream_labels(labels: &[StreamLabel]) -> String {
    let body = labels
        .iter()
        .map(|label| format!("{}={}", label.label, quote(&label.value)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{body}}}")
}

/// Splits on commas that sit outside double quotes. `None` on an unterminated quote.
fn split_fields(interior: &str) -> Option<Vec<&str>> {
    let mut fields = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (idx, ch) in interior.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(&interior[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if in_quotes {
        return None;
    }
    fields.push(&interior[start..]);
    Some(fields)
}

fn parse_field(field: &str) -> Result<StreamLabel, StreamLabelError> {
    let (label, raw_value) = field
        .split_once('=')
        .ok_or_else(|| StreamLabelError::MissingSeparator(field.trim().to_string()))?;
    let label = label.trim();
    if label.is_empty() || label.contains(['"', '\'', '`']) {
        return Err(StreamLabelError::InvalidLabel(field.trim().to_string()));
    }
    let raw_value = raw_value.trim();
    let value = all_consuming(double_quoted_literal)
        .parse(raw_value)
        .map(|(_, value)| value)
        .map_err(|_| StreamLabelError::UnquotedValue {
            label: label.to_string(),
            value: raw_value.to_string(),
        })?;
    if value.is_empty() {
        return Err(StreamLabelError::EmptyValue(label.to_string()));
    }
    Ok(StreamLabel::new(label, value))
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

type NomResult<'a, T> = IResult<&'a str, T, NomError<&'a str>>;

fn double_quoted_literal(input: &str) -> NomResult<'_, String> {
    delimited(
        char('"'),
        cut(fold_many0(
            alt((none_of("\\\""), escaped_char)),
            String::new,
            |mut acc, item| {
                acc.push(item);
                acc
            },
        )),
        char('"'),
    )
    .parse(input)
}

fn escaped_char(input: &str) -> NomResult<'_, char> {
    preceded(
        char('\\'),
        alt((
            map(char('\\'), |_| '\\'),
            map(char('"'), |_| '"'),
            map(char('\''), |_| '\''),
            map(char('/'), |_| '/'),
            map(char('n'), |_| '\n'),
            map(char('r'), |_| '\r'),
            map(char('t'), |_| '\t'),
            map(char('a'), |_| '\u{07}'),
            map(char('b'), |_| '\u{08}'),
            map(char('f'), |_| '\u{0c}'),
            map(char('v'), |_| '\u{0b}'),
            unicode_escape,
        )),
    )
    .parse(input)
}

fn unicode_escape(input: &str) -> NomResult<'_, char> {
    preceded(
        char('u'),
        map_opt(
            take_while_m_n(4, 4, |c: char| c.is_ascii_hexdigit()),
            |hex: &str| u32::from_str_radix(hex, 16).ok().and_then(char::from_u32),
        ),
    )
    .parse(input)
}
