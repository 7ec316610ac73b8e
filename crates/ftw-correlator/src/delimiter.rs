// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sentinel markers.
//!
//! The generator reports no correlation identifiers, so every test request is
//! sent between two synthetic sentinel requests whose `Host` header carries a
//! marker of the form `<secret>-<key>`. The secret is fixed for a session and
//! the key identifies the test. The same marker shows up in the WAF audit log
//! when the firewall rule from [`Delimiter::firewall_rule`] is installed.

use regex::bytes::Regex;
use uuid::Uuid;

use crate::errors::PatternError;

/// Capture used for the key part of a marker.
const KEY_CAPTURE: &str = r"(\w+)";

/// Rule id of the sentinel rule installed on the WAF.
const RULE_ID: &str = "010203";

#[derive(Debug, Clone)]
pub struct Delimiter {
    secret: String,
    marker: Regex,
}

impl Delimiter {
    /// Creates a delimiter with an unpredictable secret.
    ///
    /// # Errors
    ///
    /// Only fails if the marker regex cannot be compiled.
    pub fn generate() -> Result<Self, PatternError> {
        let secret = format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        Self::with_secret(secret)
    }

    /// Creates a delimiter with a caller-supplied secret, for reproducible runs.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError::EmptySecret`] for an empty secret.
    pub fn with_secret(secret: impl Into<String>) -> Result<Self, PatternError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(PatternError::EmptySecret);
        }
        let marker = Regex::new(&capture_pattern(&secret))?;
        Ok(Self { secret, marker })
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// A fresh opaque test key.
    #[must_use]
    pub fn new_key(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Renders the marker for `key`, or a regex capturing the key when `key`
    /// is `None`.
    #[must_use]
    pub fn pattern(&self, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("{}-{key}", self.secret),
            None => capture_pattern(&self.secret),
        }
    }

    /// Key of the first marker found in `data`.
    #[must_use]
    pub fn try_extract_key(&self, data: &[u8]) -> Option<String> {
        self.marker
            .captures(data)
            .and_then(|captures| captures.get(1))
            .map(|key| String::from_utf8_lossy(key.as_bytes()).into_owned())
    }

    /// The wire-ready sentinel request for `key`.
    #[must_use]
    pub fn sentinel_packet(&self, key: &str) -> Vec<u8> {
        format!(
            "GET / HTTP/1.1\r\n\
             Host: {}\r\n\
             Accept: */*\r\n\
             User-Agent: WAFBench\r\n\
             Connection: Close\r\n\
             \r\n",
            self.pattern(Some(key))
        )
        .into_bytes()
    }

    /// A ModSecurity rule that denies sentinel requests and writes the marker
    /// into the audit log.
    #[must_use]
    pub fn firewall_rule(&self) -> String {
        format!(
            "SecRule REQUEST_HEADERS:Host \"{}\" \"phase:1,id:{RULE_ID},t:none,deny,msg:'delimiter-%{{matched_var}}'\"",
            self.pattern(None)
        )
    }

    /// Regex matching the audit-log line produced by [`Self::firewall_rule`],
    /// capturing the key.
    #[must_use]
    pub fn log_pattern(&self) -> String {
        format!("msg \"delimiter-{}", capture_pattern(&self.secret))
    }
}

fn capture_pattern(secret: &str) -> String {
    format!("{}-{KEY_CAPTURE}", regex::escape(secret))
}
