use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Bearer credential scoped to the database resource.
///
/// Never mutated after issue; a refresh produces a new value.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    token: String,
    expires_on: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_on: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    pub fn secret(&self) -> &str {
        &self.token
    }

    pub fn expires_on(&self) -> DateTime<Utc> {
        self.expires_on
    }

    pub fn is_expired(&self) -> bool {
        self.expires_on <= Utc::now()
    }

    /// True if the token expires before `margin` has elapsed from now.
    pub fn expires_within(&self, margin: std::time::Duration) -> bool {
        let margin = Duration::from_std(margin).unwrap_or(Duration::MAX);
        match Utc::now().checked_add_signed(margin) {
            Some(deadline) => self.expires_on <= deadline,
            None => true,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}
