use crate::error::{Error, Result};

/// Default maximum identifier length accepted by [`ColumnNameValidator`].
pub const DEFAULT_MAX_LENGTH: usize = 128;

/// Whitelist check for table and column identifiers.
///
/// Accepts `^[A-Za-z_][A-Za-z0-9_]*$` up to `max_length` characters. Dots,
/// quotes, whitespace and operators are always rejected, so a validated
/// identifier can be rendered into SQL without quoting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnNameValidator {
    max_length: usize,
}

impl ColumnNameValidator {
    /// Validator with a custom length cap.
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Configured length cap.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Validate a column (or any single) identifier.
    pub fn validate(&self, identifier: &str) -> Result<()> {
        let reject = |reason| Error::InvalidIdentifier {
            identifier: identifier.to_string(),
            reason,
        };

        let mut chars = identifier.chars();
        let Some(first) = chars.next() else {
            return Err(reject("identifier is empty"));
        };
        if identifier.len() > self.max_length {
            return Err(reject("identifier exceeds the maximum length"));
        }
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(reject("identifier must start with a letter or underscore"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(reject(
                "identifier may only contain letters, digits and underscores",
            ));
        }
        Ok(())
    }

    /// Validate an optional table identifier; absent or blank is accepted.
    pub fn validate_table(&self, table: Option<&str>) -> Result<()> {
        match table {
            Some(table) if !table.trim().is_empty() => self.validate(table),
            _ => Ok(()),
        }
    }
}

impl Default for ColumnNameValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LENGTH)
    }
}
