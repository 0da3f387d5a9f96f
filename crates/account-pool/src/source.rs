//! Credential pool sources
//!
//! Three ranked sources, first non-empty wins with no merging:
//! 1. inline list: `label:secret` entries separated by commas
//! 2. file: one `label:secret` entry per line
//! 3. fallback: a single secret, labeled `account-1`
//!
//! Entries without a label get `account-N`, N being the entry's 1-based
//! position among all non-blank entries, dropped ones included. Entries with
//! more than one `:` or an empty secret are dropped with a warning naming
//! their position. Only the file source treats `#` lines as comments.

use std::path::{Path, PathBuf};

use common::Secret;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One labeled credential. Immutable after parse.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialRecord {
    pub label: String,
    pub secret: Secret<String>,
}

impl CredentialRecord {
    pub fn new(label: impl Into<String>, secret: impl Into<Secret<String>>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
        }
    }
}

/// Configured credential sources, in precedence order.
#[derive(Debug, Clone, Default)]
pub struct PoolSources {
    pub inline: Option<String>,
    pub file: Option<PathBuf>,
    pub fallback: Option<Secret<String>>,
}

/// Parse `label:secret` entries separated by `delimiter`.
///
/// Blank entries are skipped without consuming a position. Dropped entries
/// still consume theirs, so later auto-labels match what the operator wrote.
pub fn parse_entries(input: &str, delimiter: char) -> Vec<CredentialRecord> {
    parse_with(input, delimiter, false)
}

fn parse_with(input: &str, delimiter: char, comments: bool) -> Vec<CredentialRecord> {
    let mut records = Vec::new();
    let mut position = 0;

    for raw in input.split(delimiter) {
        let entry = raw.trim();
        if entry.is_empty() || (comments && entry.starts_with('#')) {
            continue;
        }
        position += 1;

        let (label, secret) = match entry.split_once(':') {
            None => (None, entry),
            Some((_, rest)) if rest.contains(':') => {
                warn!(
                    position,
                    "dropping credential entry with more than one ':' separator"
                );
                continue;
            }
            Some((label, secret)) => {
                let label = label.trim();
                ((!label.is_empty()).then_some(label), secret.trim())
            }
        };

        if secret.is_empty() {
            warn!(position, "dropping credential entry with empty secret");
            continue;
        }

        let label = match label {
            Some(l) => l.to_string(),
            None => format!("account-{position}"),
        };
        records.push(CredentialRecord::new(label, secret));
    }

    records
}

/// Read a newline-delimited credential file.
///
/// A missing or unreadable file yields an empty list so the next source is tried.
pub async fn parse_file(path: &Path) -> Vec<CredentialRecord> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_with(&contents.replace('\r', ""), '\n', true),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "credential file not readable");
            Vec::new()
        }
    }
}

/// Resolve the credential pool from the configured sources.
pub async fn load_pool(sources: &PoolSources) -> Result<Vec<CredentialRecord>> {
    if let Some(inline) = &sources.inline {
        let records = parse_entries(inline, ',');
        if !records.is_empty() {
            info!(accounts = records.len(), source = "inline", "resolved credential pool");
            return Ok(records);
        }
    }

    if let Some(path) = &sources.file {
        let records = parse_file(path).await;
        if !records.is_empty() {
            info!(
                accounts = records.len(),
                source = "file",
                path = %path.display(),
                "resolved credential pool"
            );
            return Ok(records);
        }
    }

    if let Some(secret) = &sources.fallback
        && !secret.is_blank()
    {
        info!(accounts = 1, source = "fallback", "resolved credential pool");
        return Ok(vec![CredentialRecord::new(
            "account-1",
            secret.expose().trim(),
        )]);
    }

    Err(Error::NoCredentials(
        "no inline list, credential file, or single token produced a credential".into(),
    ))
}
