//! Conflict naming for keep-both resolution
//!
//! Generates names for conflict copies of the local version:
//! `report (conflict alice).odt`, then `report (conflict alice 2).odt`,
//! `report (conflict alice 3).odt`, ... until a free name is found.
//! Names are deterministic so a repeated pass produces the same backups.

use crate::ConflictError;

/// Highest counter tried before giving up
const MAX_COUNTER: u32 = 999;

/// Generates conflict copy names
pub struct ConflictNamer;

impl ConflictNamer {
    /// Conflict copy name for attempt `n` (1 = no counter)
    ///
    /// The extension is the text after the last dot. A leading dot does not
    /// start an extension, so `.profile` keeps its whole name as the stem.
    pub fn generate(original_name: &str, user: &str, n: u32) -> String {
        let suffix = if n <= 1 {
            format!("(conflict {user})")
        } else {
            format!("(conflict {user} {n})")
        };

        match original_name.rfind('.') {
            Some(dot_pos) if dot_pos > 0 => {
                let stem = &original_name[..dot_pos];
                let ext = &original_name[dot_pos..];
                format!("{stem} {suffix}{ext}")
            }
            _ => format!("{original_name} {suffix}"),
        }
    }

    /// First conflict copy name for which `exists` returns false
    ///
    /// # Errors
    /// `ConflictError::InvalidName` for empty or multi-component names,
    /// `ConflictError::NamesExhausted` when every counter is taken
    pub fn generate_unique<F>(
        original_name: &str,
        user: &str,
        mut exists: F,
    ) -> Result<String, ConflictError>
    where
        F: FnMut(&str) -> bool,
    {
        if original_name.is_empty() || original_name.contains('/') {
            return Err(ConflictError::InvalidName(original_name.to_string()));
        }

        for n in 1..=MAX_COUNTER {
            let candidate = Self::generate(original_name, user, n);
            if !exists(&candidate) {
                return Ok(candidate);
            }
        }

        tracing::warn!(name = original_name, "Conflict names exhausted");
        Err(ConflictError::NamesExhausted(original_name.to_string()))
    }
}
