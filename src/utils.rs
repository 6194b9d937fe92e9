// ABOUTME: Utility functions for validation, quoting and retry handling
// ABOUTME: Provides identifier validation, URL redaction and exponential backoff

use rand::Rng;
use std::time::Duration;

use crate::error::{Result, SourceError};

/// Exponential backoff schedule used for reconnects and control-plane retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (doubles on each subsequent retry)
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Maximum retry attempts after the initial attempt
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), capped and with up to
    /// 10% random jitter so reconnecting consumers do not synchronize.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ceiling = (base.as_millis() as u64) / 10;
        if jitter_ceiling == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ceiling);
        (base + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

/// Retry an async operation with exponential backoff on transient failure
///
/// Only errors for which [`SourceError::is_transient`] holds are retried; any
/// other error is returned immediately. After `max_retries` retries the last
/// error is returned.
///
/// # Examples
///
/// ```no_run
/// # use database_extractor::utils::{retry_with_backoff, BackoffPolicy};
/// # async fn example() -> database_extractor::error::Result<()> {
/// let value = retry_with_backoff(
///     || async { Ok::<_, database_extractor::error::SourceError>(42) },
///     &BackoffPolicy::default(),
///     "connect",
/// )
/// .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    policy: &BackoffPolicy,
    label: &str,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label,
                    attempt + 1,
                    policy.max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Validate a PostgreSQL identifier (schema, table, column, slot, publication)
///
/// Only letters, digits and underscores are accepted, starting with a letter
/// or underscore, at most 63 characters. Every name interpolated into SQL or
/// replication commands passes through here first.
pub fn validate_postgres_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(SourceError::config(
            "identifier cannot be empty or whitespace-only",
            "provide a non-empty schema/table/column name",
        ));
    }
    if trimmed.len() > 63 {
        return Err(SourceError::config(
            format!(
                "identifier '{}' exceeds maximum length of 63 characters (got {})",
                sanitize_identifier(trimmed),
                trimmed.len()
            ),
            "PostgreSQL truncates identifiers at 63 bytes; use the actual object name",
        ));
    }
    let mut chars = trimmed.chars();
    let first = chars.next().unwrap_or('_');
    if !first.is_ascii_alphabetic() && first != '_' {
        return Err(SourceError::config(
            format!(
                "identifier '{}' must start with a letter or underscore",
                sanitize_identifier(trimmed)
            ),
            "rename the object or reference an existing identifier",
        ));
    }
    if let Some(bad) = trimmed.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '_') {
        return Err(SourceError::config(
            format!(
                "identifier '{}' contains invalid character '{}'",
                sanitize_identifier(trimmed),
                if bad.is_control() {
                    format!("\\x{:02x}", bad as u32)
                } else {
                    bad.to_string()
                }
            ),
            "only letters, digits and underscores are allowed",
        ));
    }
    Ok(())
}

/// Strip control characters and cap length, for display only.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier. Assumes it was validated.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Replace the password in a connection URL with `***`
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}
