//! Structured-output extraction from free-form model text.
//!
//! Models often wrap JSON in prose or markdown fences.  [`parse_structured`]
//! tolerates that by locating the first *balanced* JSON object in the text,
//! tracking string literals and escapes so braces inside strings do not
//! confuse the scan.  A candidate that never closes, or that is balanced but
//! not valid JSON, is skipped and the scan continues after its opening brace.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no balanced JSON object found in response")]
    NoJsonObject,

    #[error("JSON object is invalid: {0}")]
    InvalidJson(String),
}

/// Extract the first balanced JSON object from `text`.
pub fn parse_structured(text: &str) -> Result<Value, ParseError> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    let mut last_error = None;

    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        if let Some(end) = balanced_end(bytes, start) {
            match serde_json::from_str::<Value>(&text[start..=end]) {
                Ok(value) if value.is_object() => return Ok(value),
                Ok(_) => {}
                Err(e) => last_error = Some(e.to_string()),
            }
        }
        search_from = start + 1;
    }

    Err(match last_error {
        Some(msg) => ParseError::InvalidJson(msg),
        None => ParseError::NoJsonObject,
    })
}

/// Index of the `}` closing the object that opens at `start`.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}
