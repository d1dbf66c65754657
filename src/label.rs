//! Key lifecycle labels
//!
//! A key row carries a mutable lifecycle label (`active`, `rotating::<ts>`,
//! `retired::<ts>`) and an immutable origin label (`active::<ts>` for the
//! first key, `rotating::<ts>` for rotated keys). Ciphertext always carries
//! the origin label.

use chrono::{DateTime, Utc};

use crate::error::{EnvelopeError, Result};

/// Label of the key new ciphertext is written under outside a rotation
pub const ACTIVE_LABEL: &str = "active";

pub const ROTATING_PREFIX: &str = "rotating::";
pub const RETIRED_PREFIX: &str = "retired::";

const ACTIVE_ORIGIN_PREFIX: &str = "active::";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";

/// Lifecycle state encoded in a label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Active,
    Rotating,
    Retired,
}

impl LabelKind {
    pub fn of(label: &str) -> Option<Self> {
        if label == ACTIVE_LABEL || label.starts_with(ACTIVE_ORIGIN_PREFIX) {
            Some(LabelKind::Active)
        } else if label.starts_with(ROTATING_PREFIX) {
            Some(LabelKind::Rotating)
        } else if label.starts_with(RETIRED_PREFIX) {
            Some(LabelKind::Retired)
        } else {
            None
        }
    }
}

fn stamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn rotating_label(at: DateTime<Utc>) -> String {
    format!("{}{}", ROTATING_PREFIX, stamp(at))
}

pub fn retired_label(at: DateTime<Utc>) -> String {
    format!("{}{}", RETIRED_PREFIX, stamp(at))
}

/// Origin label for the key created by `crypto-init`
pub fn initial_origin_label(at: DateTime<Utc>) -> String {
    format!("{}{}", ACTIVE_ORIGIN_PREFIX, stamp(at))
}

pub fn is_rotating(label: &str) -> bool {
    LabelKind::of(label) == Some(LabelKind::Rotating)
}

/// Labels travel inside the `$`-delimited field encoding
pub fn validate(label: &str) -> Result<()> {
    if label.is_empty() || label.len() > 128 {
        return Err(EnvelopeError::UnknownLabel(format!("invalid label length: {:?}", label)));
    }
    if label.chars().any(|c| c == '$' || c.is_whitespace() || c.is_control()) {
        return Err(EnvelopeError::UnknownLabel(format!("invalid label: {:?}", label)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_label_formats() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap();
        assert_eq!(rotating_label(at), "rotating::20261016T093000.000000Z");
        assert_eq!(retired_label(at), "retired::20261016T093000.000000Z");
        assert_eq!(initial_origin_label(at), "active::20261016T093000.000000Z");
    }

    #[test]
    fn test_label_kinds() {
        assert_eq!(LabelKind::of("active"), Some(LabelKind::Active));
        assert_eq!(LabelKind::of("active::20261016T093000.000000Z"), Some(LabelKind::Active));
        assert_eq!(LabelKind::of("rotating::x"), Some(LabelKind::Rotating));
        assert_eq!(LabelKind::of("retired::x"), Some(LabelKind::Retired));
        assert_eq!(LabelKind::of("current"), None);
        assert!(is_rotating("rotating::1"));
        assert!(!is_rotating("active"));
    }

    #[test]
    fn test_validate_rejects_delimiters() {
        assert!(validate("rotating::20261016T093000.000000Z").is_ok());
        assert!(validate("").is_err());
        assert!(validate("bad$label").is_err());
        assert!(validate("bad label").is_err());
    }
}
