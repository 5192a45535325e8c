//! Connection-parameter strings and the per-connect argument set hooks rewrite.

use crate::error::{StoreError, StoreResult};
use std::collections::BTreeMap;
use std::fmt;

/// Keys that carry credentials inline; their absence makes the driver fall
/// back to integrated security.
const CREDENTIAL_KEYS: &[&str] = &["uid", "user id", "pwd", "password", "authentication"];

pub const TRUSTED_CONNECTION: &str = "Trusted_Connection";

/// Ordered `key=value;` pairs with case-insensitive keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionParams {
    pairs: Vec<(String, String)>,
}

impl ConnectionParams {
    pub fn parse(input: &str) -> StoreResult<Self> {
        let mut pairs = Vec::new();
        for segment in split_segments(input)? {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                StoreError::EngineCreation(format!("segment `{segment}` is not key=value"))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(StoreError::EngineCreation(format!(
                    "segment `{segment}` has an empty key"
                )));
            }
            pairs.push((key.to_string(), unbrace(value.trim()).to_string()));
        }
        if pairs.is_empty() {
            return Err(StoreError::EngineCreation(
                "connection string is empty".to_string(),
            ));
        }
        Ok(Self { pairs })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// First value found among `keys`.
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replace an existing value in place or append a new pair.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.pairs.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }

    /// Remove every occurrence of `key`; returns whether anything was removed.
    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.pairs.len();
        self.pairs.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.pairs.len() != before
    }

    pub fn has_inline_credentials(&self) -> bool {
        CREDENTIAL_KEYS.iter().any(|k| self.contains(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.pairs {
            if v.contains(';') {
                write!(f, "{k}={{{v}}};")?;
            } else {
                write!(f, "{k}={v};")?;
            }
        }
        Ok(())
    }
}

/// Arguments for one physical connection attempt.
///
/// Built fresh from the engine's parameters every time; hooks may rewrite
/// `params` and add pre-connect attributes without touching the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectArgs {
    pub params: ConnectionParams,
    pub attrs_before: BTreeMap<u32, Vec<u8>>,
}

impl ConnectArgs {
    /// Mirror the driver: without inline credentials it asks for integrated security.
    pub fn for_connect(params: &ConnectionParams) -> Self {
        let mut params = params.clone();
        if !params.has_inline_credentials() {
            params.set(TRUSTED_CONNECTION, "Yes");
        }
        Self {
            params,
            attrs_before: BTreeMap::new(),
        }
    }
}

/// Split on `;` outside of `{...}` blocks.
fn split_segments(input: &str) -> StoreResult<Vec<&str>> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    StoreError::EngineCreation(format!("unbalanced `}}` at offset {i}"))
                })?
            }
            ';' if depth == 0 => {
                segments.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(StoreError::EngineCreation("unterminated `{` block".to_string()));
    }
    segments.push(&input[start..]);
    Ok(segments)
}

fn unbrace(value: &str) -> &str {
    value
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .unwrap_or(value)
}
