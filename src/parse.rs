//! Helpers for picking apart `+PREFIX: a,b,"c"` lines.
//!
//! The engine matches raw substrings only; URC handlers and completion
//! callbacks that need the pieces of a response line use these.

use core::str::FromStr;
use heapless::{String, Vec};

use crate::error::Error;

/// Longest line the helpers accept.
pub const URC_LINE_SIZE: usize = 90;
const VALUE_COUNT: usize = 8;

/// A `+PREFIX: values` line split into its command name and raw value list.
#[derive(Clone, Debug, PartialEq)]
pub struct UrcLine {
    line: String<URC_LINE_SIZE>,
    prefix_len: usize,
}

impl UrcLine {
    pub fn new(line: &str) -> crate::Result<Self> {
        let (prefix, rest) = split_at_response(line).ok_or(Error::Parse)?;
        split_values(rest)?;
        Ok(Self {
            line: String::from_str(line).map_err(|_| Error::BufferTooSmall)?,
            prefix_len: prefix.len(),
        })
    }

    /// The command name without the leading `+`, e.g. `CMT` for a `+CMT:` line.
    pub fn command(&self) -> &str {
        &self.line[1..1 + self.prefix_len]
    }

    pub fn values(&self) -> Vec<&str, VALUE_COUNT> {
        split_values(&self.line[self.prefix_len + 3..]).unwrap()
    }

    pub fn parse_values<T: FromStr>(&self) -> crate::Result<Vec<T, VALUE_COUNT>> {
        self.values()
            .iter()
            .map(|val| str::parse::<T>(val).map_err(|_| Error::Parse))
            .collect()
    }
}

/// Splits `+CMD: rest` into `("CMD", "rest")`; `None` for anything else.
pub fn split_at_response(line: &str) -> Option<(&str, &str)> {
    if line.starts_with('+')
        && let Some(pos) = line.find(": ")
    {
        return Some((&line[1..pos], &line[pos + 2..]));
    }
    None
}

/// Splits a comma-separated value list. Double quotes group a value and are
/// stripped; numbers stay strings, e.g. `1,"a,b",15` becomes `["1", "a,b", "15"]`.
pub fn split_values(mut values: &str) -> crate::Result<Vec<&str, VALUE_COUNT>> {
    let mut split = Vec::new();
    while !values.is_empty() {
        let pos = match values.chars().next() {
            Some('"') => {
                let pos = values.find("\",").unwrap_or(values.len() - 1);
                if pos == values.len() - 1 && !values.ends_with('"') {
                    // An unterminated quote ends up here.
                    return Err(Error::Parse);
                }
                split.push(&values[1..pos]).map_err(|_| Error::BufferTooSmall)?;
                pos + 1
            }
            _ => {
                let pos = values.find(',').unwrap_or(values.len());
                split.push(&values[..pos]).map_err(|_| Error::BufferTooSmall)?;
                pos
            }
        };
        if pos >= values.len() {
            break;
        }
        values = &values[pos + 1..];
    }
    Ok(split)
}
