//! Out-of-band access-token attribute layout.
//!
//! The native SQL Server driver reads the token from a pre-connect attribute
//! rather than the connection string. The attribute is a `u32` little-endian
//! byte length followed by the token encoded as UTF-16LE.

use super::token::AccessToken;
use crate::error::{StoreError, StoreResult};

/// Connection option slot for access tokens, as defined in msodbcsql.h.
pub const SQL_COPT_SS_ACCESS_TOKEN: u32 = 1256;

pub fn encode(token: &AccessToken) -> StoreResult<Vec<u8>> {
    encode_token(token.secret())
}

pub fn encode_token(token: &str) -> StoreResult<Vec<u8>> {
    let units: Vec<u16> = token.encode_utf16().collect();
    let byte_len = length_prefix(units.len())?;

    let mut out = Vec::with_capacity(4 + units.len() * 2);
    out.extend_from_slice(&byte_len.to_le_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

/// Byte length of `units` UTF-16 code units, if it fits the `u32` prefix.
fn length_prefix(units: usize) -> StoreResult<u32> {
    units
        .checked_mul(2)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            StoreError::TokenEncoding(format!(
                "token of {units} UTF-16 units does not fit a 32-bit length prefix"
            ))
        })
}
