//! Short-ID generation and loose name/ID resolution.

use std::collections::HashMap;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

const SHORT_ID_LEN: usize = 8;
const SHORT_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_SHORT_ID_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum IdError {
    #[error("exhausted {0} attempts generating a unique short id")]
    Exhausted(u32),
}

/// Draw a single candidate short id: 8 lowercase alphanumeric characters.
fn draw_short_id() -> String {
    let mut rng = rand::rng();
    (0..SHORT_ID_LEN)
        .map(|_| {
            let idx = rng.random_range(0..SHORT_ID_ALPHABET.len());
            SHORT_ID_ALPHABET[idx] as char
        })
        .collect()
}

/// Generate a short id that is not already present in `existing`, retrying
/// on collision up to `MAX_SHORT_ID_ATTEMPTS` times.
pub fn generate_short_id(exists: impl Fn(&str) -> bool) -> Result<String, IdError> {
    for attempt in 0..MAX_SHORT_ID_ATTEMPTS {
        let candidate = draw_short_id();
        debug!(attempt, %candidate, "generate_short_id: candidate drawn");
        if !exists(&candidate) {
            return Ok(candidate);
        }
    }
    debug!(attempts = MAX_SHORT_ID_ATTEMPTS, "generate_short_id: exhausted");
    Err(IdError::Exhausted(MAX_SHORT_ID_ATTEMPTS))
}

/// Resolves an operator-supplied reference (full name, full id, or a short-id
/// prefix of at least 4 characters) against a map of `id -> name`.
///
/// Returns `Ok(None)` for no match, `Ok(Some(id))` for a unique match, and
/// `Err(candidates)` when the reference is ambiguous.
pub struct IdResolver<'a> {
    /// id -> (name, short_id)
    entries: &'a HashMap<String, (String, String)>,
}

impl<'a> IdResolver<'a> {
    pub fn new(entries: &'a HashMap<String, (String, String)>) -> Self {
        Self { entries }
    }

    pub fn resolve(&self, reference: &str) -> Result<Option<String>, Vec<String>> {
        debug!(%reference, "IdResolver::resolve: called");
        let mut matches: Vec<&String> = self
            .entries
            .iter()
            .filter(|(id, (name, short_id))| matches(id, name, short_id, reference))
            .map(|(id, _)| id)
            .collect();
        matches.sort();
        matches.dedup();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0].clone())),
            _ => Err(matches.into_iter().cloned().collect()),
        }
    }
}

fn matches(id: &str, name: &str, short_id: &str, reference: &str) -> bool {
    if id == reference || name == reference {
        return true;
    }
    if reference.len() >= 4 && short_id.starts_with(reference) {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_eight_lowercase_alphanumeric() {
        let id = generate_short_id(|_| false).unwrap();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn short_id_retries_on_collision_then_succeeds() {
        let mut calls = 0;
        let id = generate_short_id(|_| {
            calls += 1;
            calls <= 5
        })
        .unwrap();
        assert_eq!(id.len(), 8);
    }

    #[test]
    fn short_id_exhausts_after_ten_collisions() {
        let err = generate_short_id(|_| true).unwrap_err();
        assert!(matches!(err, IdError::Exhausted(10)));
    }

    fn sample() -> HashMap<String, (String, String)> {
        let mut m = HashMap::new();
        m.insert("id-1".to_string(), ("alpha".to_string(), "ab12cd34".to_string()));
        m.insert("id-2".to_string(), ("beta".to_string(), "ab99zz11".to_string()));
        m
    }

    #[test]
    fn resolves_exact_name() {
        let entries = sample();
        let resolver = IdResolver::new(&entries);
        assert_eq!(resolver.resolve("alpha").unwrap(), Some("id-1".to_string()));
    }

    #[test]
    fn resolves_exact_id() {
        let entries = sample();
        let resolver = IdResolver::new(&entries);
        assert_eq!(resolver.resolve("id-2").unwrap(), Some("id-2".to_string()));
    }

    #[test]
    fn resolves_unique_short_id_prefix() {
        let entries = sample();
        let resolver = IdResolver::new(&entries);
        assert_eq!(resolver.resolve("ab12").unwrap(), Some("id-1".to_string()));
    }

    #[test]
    fn ambiguous_prefix_returns_all_candidates() {
        let entries = sample();
        let resolver = IdResolver::new(&entries);
        let err = resolver.resolve("ab").unwrap_err();
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn no_match_returns_none() {
        let entries = sample();
        let resolver = IdResolver::new(&entries);
        assert_eq!(resolver.resolve("nope").unwrap(), None);
    }

    #[test]
    fn short_prefix_under_four_chars_does_not_match() {
        let entries = sample();
        let resolver = IdResolver::new(&entries);
        assert_eq!(resolver.resolve("ab1").unwrap(), None);
    }
}
