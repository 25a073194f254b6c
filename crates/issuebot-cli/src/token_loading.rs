use std::{collections::HashSet, path::Path};

use anyhow::{bail, Context, Result};
use issuebot_session::{AllowList, UserId};

use crate::validation::TokenSource;

/// Resolves a token from its source. File contents lose one trailing line ending.
pub fn load_token(label: &str, source: &TokenSource) -> Result<String> {
    let token = match source {
        TokenSource::Inline(value) => value.trim().to_string(),
        TokenSource::File(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {label} from {}", path.display()))?;
            strip_trailing_newline(label, path, raw)
        }
    };
    if token.is_empty() {
        bail!("{label} is empty");
    }
    Ok(token)
}

fn strip_trailing_newline(label: &str, path: &Path, mut raw: String) -> String {
    let suffix = if raw.ends_with("\r\n") {
        Some("\r\n")
    } else if raw.ends_with('\n') {
        Some("\n")
    } else {
        None
    };
    if let Some(suffix) = suffix {
        raw.truncate(raw.len() - suffix.len());
        tracing::warn!(
            label,
            path = %path.display(),
            "removed trailing newline from token file"
        );
    }
    raw
}

/// Reads the allow-list file. A missing file is an error; an empty one allows everyone.
pub fn load_allow_list(path: &Path) -> Result<HashSet<UserId>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read allow-list {}", path.display()))?;
    Ok(AllowList::parse(&raw))
}
