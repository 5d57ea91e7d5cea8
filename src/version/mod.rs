//! Version extraction and comparison.
//!
//! Release tags and `--version` output are free-form text. This module pulls
//! the first dotted numeric run out of such text and reduces it to a
//! [`Version`] that can be compared with another one:
//!
//! - `YYYY.MM.DD` runs become [`Version::Calendar`] dates.
//! - Anything else is split on `.` and reduced to a weighted scalar,
//!   [`Version::Ordinal`]: `major * 100 + minor * 10 + patch`, with every
//!   position past the second added unscaled.
//!
//! The weighting is deliberately lossy. A patch level of 10 or more spills
//! into the minor weight class (`1.0.10` and `1.1.0` both weigh 110), and
//! installed components already depend on this ordering, so it must not be
//! replaced by semver.
//!
//! Ordinal and calendar versions never compare with each other:
//! [`PartialOrd`] returns `None` across kinds and [`Version::compare`]
//! reports [`VersionError::Incomparable`].
//!
//! # Examples
//!
//! ```rust
//! use vpnmupd::version::{Version, extract, power};
//!
//! assert_eq!(extract("Some string containing v1.1.1"), "1.1.1");
//! assert_eq!(power("1.1.1").unwrap(), Version::Ordinal(111));
//! assert!(power("2021.1.1").unwrap() > power("2020.1.1").unwrap());
//! ```

use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

static VERSION_RUN: LazyLock<Regex> = LazyLock::new(|| {
    // Two digit-or-dot characters followed by at least two more.
    Regex::new(r"[\d.][\d.][\d.]{2,}").expect("version pattern is valid")
});

/// A comparable version value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Version {
    /// Weighted scalar of a dotted numeric version.
    Ordinal(u64),
    /// A calendar version (`YYYY.MM.DD`).
    Calendar(NaiveDate),
}

/// Which variant a [`Version`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKind {
    /// See [`Version::Ordinal`]
    Ordinal,
    /// See [`Version::Calendar`]
    Calendar,
}

/// Why a string could not be reduced to a [`Version`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    /// The input was empty (no version present).
    #[error("empty version string")]
    Empty,
    /// A dotted token was not a non-negative integer.
    #[error("'{token}' in '{text}' is not a number")]
    NonNumeric {
        /// Offending token
        token: String,
        /// Whole input
        text: String,
    },
    /// The weighted value does not fit in 64 bits.
    #[error("version '{0}' is too large")]
    Overflow(String),
    /// An ordinal version was compared with a calendar version.
    #[error("cannot compare {0} with {1}")]
    Incomparable(Version, Version),
}

impl Version {
    /// The variant of this version.
    #[must_use]
    pub const fn kind(&self) -> VersionKind {
        match self {
            Self::Ordinal(_) => VersionKind::Ordinal,
            Self::Calendar(_) => VersionKind::Calendar,
        }
    }

    /// Compare two versions of the same kind.
    ///
    /// # Errors
    ///
    /// Returns [`VersionError::Incomparable`] when the kinds differ.
    pub fn compare(&self, other: &Self) -> Result<Ordering, VersionError> {
        self.partial_cmp(other).ok_or(VersionError::Incomparable(*self, *other))
    }

    /// `true` only when `self` is strictly newer than `other` and both are
    /// the same kind.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Greater))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Ordinal(a), Self::Ordinal(b)) => Some(a.cmp(b)),
            (Self::Calendar(a), Self::Calendar(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ordinal(weight) => write!(f, "{weight}"),
            Self::Calendar(date) => write!(f, "{}", date.format("%Y.%m.%d")),
        }
    }
}

/// Return the first dotted numeric run of at least four characters in
/// `text`, or an empty string when there is none.
///
/// The empty string means "no version present" and must be treated as an
/// unknown version by callers.
#[must_use]
pub fn extract(text: &str) -> &str {
    VERSION_RUN.find(text).map_or("", |m| m.as_str())
}

/// Reduce a version string to a comparable [`Version`].
///
/// A calendar parse is attempted first; otherwise the string is treated as a
/// dotted ordinal and weighted 100/10/1.
///
/// # Errors
///
/// Fails when the string is empty, when a token is not a number or when
/// the weighted value overflows. Callers treat every failure as an unknown
/// version.
pub fn power(text: &str) -> Result<Version, VersionError> {
    if text.is_empty() {
        return Err(VersionError::Empty);
    }

    if let Some(date) = parse_calendar(text) {
        return Ok(Version::Calendar(date));
    }

    let mut total: u64 = 0;
    for (index, token) in text.split('.').enumerate() {
        let value: u64 = token.parse().map_err(|_| VersionError::NonNumeric {
            token: token.to_string(),
            text: text.to_string(),
        })?;
        let weight = match index {
            0 => 100,
            1 => 10,
            _ => 1,
        };
        total = value
            .checked_mul(weight)
            .and_then(|weighted| total.checked_add(weighted))
            .ok_or_else(|| VersionError::Overflow(text.to_string()))?;
    }

    Ok(Version::Ordinal(total))
}

/// Extract then reduce in one step; `None` for any unknown version.
#[must_use]
pub fn parse_text(text: &str) -> Option<Version> {
    power(extract(text)).ok()
}

/// `YYYY.M.D` with a four digit year and one or two digit month and day.
fn parse_calendar(text: &str) -> Option<NaiveDate> {
    let mut parts = text.split('.');
    let (year, month, day) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let digits = |s: &str, min: usize, max: usize| {
        (min..=max).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_digit())
    };
    if !digits(year, 4, 4) || !digits(month, 1, 2) || !digits(day, 1, 2) {
        return None;
    }

    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}
