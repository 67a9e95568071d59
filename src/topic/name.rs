//! Domain and topic name rules

use crate::{
    config::MAX_NAME_LEN,
    error::{Result, SeuratError},
};

/// Validate a domain or topic name.
///
/// Names become path components, so only `[A-Za-z0-9_.-]` is accepted and a
/// leading dot is rejected.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SeuratError::invalid_parameter(
            kind,
            format!("{} name cannot be empty", kind),
        ));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(SeuratError::invalid_parameter(
            kind,
            format!("{} name exceeds {} bytes", kind, MAX_NAME_LEN),
        ));
    }

    if name.starts_with('.') {
        return Err(SeuratError::invalid_parameter(
            kind,
            format!("{} name cannot start with '.'", kind),
        ));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(SeuratError::invalid_parameter(
            kind,
            format!("{} name contains invalid character {:?}", kind, bad),
        ));
    }

    Ok(())
}
