//! Core types for the silence engine.
//!
//! This module provides the fundamental types used throughout the silencer crate:
//! - [`MatchType`]: The operator a matcher applies to a label
//! - [`Matcher`]: One label-matching rule
//! - [`SilenceStatus`]: The status derived from a silence's time window
//! - [`Silence`]: A stored suppression rule
//! - [`NewSilence`]: Input for creating a silence
//! - [`SilencePatch`]: Partial update with an optimistic-lock token

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SilenceError};

/// Maximum number of matchers a silence may carry.
pub const MAX_MATCHERS: usize = 100;
/// Maximum length of `created_by`, in bytes.
pub const MAX_CREATED_BY_LEN: usize = 256;
/// Maximum length of `comment`, in bytes.
pub const MAX_COMMENT_LEN: usize = 4096;
/// Maximum length of a matcher name, in bytes.
pub const MAX_MATCHER_NAME_LEN: usize = 256;
/// Maximum length of a matcher value, in bytes.
pub const MAX_MATCHER_VALUE_LEN: usize = 1024;
/// Maximum length of a caller-supplied silence ID, in bytes.
pub const MAX_ID_LEN: usize = 128;

/// The operator a matcher applies to a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    /// Label equals the value (`=`).
    #[serde(rename = "=")]
    Equal,
    /// Label differs from the value or is absent (`!=`).
    #[serde(rename = "!=")]
    NotEqual,
    /// Label matches the regex (`=~`).
    #[serde(rename = "=~")]
    Regex,
    /// Label does not match the regex or is absent (`!~`).
    #[serde(rename = "!~")]
    NotRegex,
}

impl MatchType {
    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }

    /// Returns true for the regex operators.
    #[must_use]
    pub const fn is_regex(&self) -> bool {
        matches!(self, Self::Regex | Self::NotRegex)
    }

    /// Returns true for the negating operators.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        matches!(self, Self::NotEqual | Self::NotRegex)
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

impl FromStr for MatchType {
    type Err = SilenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "=" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            "=~" => Ok(Self::Regex),
            "!~" => Ok(Self::NotRegex),
            other => Err(SilenceError::validation(
                "matcher.type",
                format!("unknown operator '{other}'"),
            )),
        }
    }
}

/// A single label-matching rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Matcher {
    /// The label key.
    pub name: String,
    /// A literal, or a regex pattern for the regex operators.
    pub value: String,
    /// The operator.
    #[serde(rename = "type")]
    pub match_type: MatchType,
}

impl Matcher {
    /// Creates a matcher.
    pub fn new(name: impl Into<String>, value: impl Into<String>, match_type: MatchType) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            match_type,
        }
    }

    /// `name="value"`.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, value, MatchType::Equal)
    }

    /// `name!="value"`.
    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, value, MatchType::NotEqual)
    }

    /// `name=~"pattern"`.
    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(name, pattern, MatchType::Regex)
    }

    /// `name!~"pattern"`.
    pub fn not_regex(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(name, pattern, MatchType::NotRegex)
    }

    /// Returns true if the value is a regex pattern.
    #[must_use]
    pub const fn is_regex(&self) -> bool {
        self.match_type.is_regex()
    }

    /// Checks the matcher's invariants, including that regex patterns compile.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(SilenceError::validation(
                "matcher.name",
                "must not be empty",
            ));
        }
        if self.name.len() > MAX_MATCHER_NAME_LEN {
            return Err(SilenceError::validation(
                "matcher.name",
                format!("exceeds {MAX_MATCHER_NAME_LEN} bytes"),
            ));
        }
        if self.value.is_empty() {
            return Err(SilenceError::validation(
                "matcher.value",
                format!("must not be empty (matcher '{}')", self.name),
            ));
        }
        if self.value.len() > MAX_MATCHER_VALUE_LEN {
            return Err(SilenceError::validation(
                "matcher.value",
                format!("exceeds {MAX_MATCHER_VALUE_LEN} bytes"),
            ));
        }
        if self.is_regex() {
            crate::matcher::compile_pattern(&self.value).map_err(|e| {
                SilenceError::validation(
                    "matcher.value",
                    format!("invalid regex for '{}': {e}", self.name),
                )
            })?;
        }
        Ok(())
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.match_type, self.value)
    }
}

/// The status of a silence, derived from its time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SilenceStatus {
    /// The window has not started yet.
    Pending,
    /// The window contains the current instant.
    Active,
    /// The window has ended.
    Expired,
}

impl SilenceStatus {
    /// Derives the status of a window at `now`.
    #[must_use]
    pub fn at(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now >= ends_at {
            Self::Expired
        } else if now < starts_at {
            Self::Pending
        } else {
            Self::Active
        }
    }

    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for SilenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SilenceStatus {
    type Err = SilenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            other => Err(SilenceError::validation(
                "status",
                format!("unknown status '{other}'"),
            )),
        }
    }
}

/// A suppression rule for alerts whose labels match every matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Silence {
    /// Unique identifier.
    pub id: String,
    /// Author of the silence.
    pub created_by: String,
    /// Why the silence exists.
    pub comment: String,
    /// Start of the window (inclusive).
    pub starts_at: DateTime<Utc>,
    /// End of the window (exclusive).
    pub ends_at: DateTime<Utc>,
    /// Label matchers, AND-combined.
    pub matchers: Vec<Matcher>,
    /// Status derived at the last read or write.
    pub status: SilenceStatus,
    /// When the silence was created.
    pub created_at: DateTime<Utc>,
    /// When the silence last changed; the optimistic-lock token.
    pub updated_at: DateTime<Utc>,
}

impl Silence {
    /// Derives the status at `now` without modifying the silence.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> SilenceStatus {
        SilenceStatus::at(self.starts_at, self.ends_at, now)
    }

    /// Recomputes `status` for `now`.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        self.status = self.status_at(now);
    }

    /// Returns a copy with `status` recomputed for `now`.
    #[must_use]
    pub fn with_status_at(&self, now: DateTime<Utc>) -> Self {
        let mut silence = self.clone();
        silence.refresh_status(now);
        silence
    }

    /// Returns true if the silence suppresses alerts at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == SilenceStatus::Active
    }
}

/// Input for creating a silence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSilence {
    /// Caller-chosen ID; a UUID is assigned when absent or empty.
    #[serde(default)]
    pub id: Option<String>,
    /// Author of the silence.
    pub created_by: String,
    /// Why the silence exists.
    pub comment: String,
    /// Start of the window.
    pub starts_at: DateTime<Utc>,
    /// End of the window.
    pub ends_at: DateTime<Utc>,
    /// Label matchers.
    pub matchers: Vec<Matcher>,
}

impl NewSilence {
    /// Creates a builder for a silence authored by `created_by`.
    #[must_use]
    pub fn builder(created_by: impl Into<String>, comment: impl Into<String>) -> NewSilenceBuilder {
        NewSilenceBuilder::new(created_by, comment)
    }

    /// Returns the caller-supplied ID, treating an empty string as absent.
    #[must_use]
    pub fn requested_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }

    /// Checks every creation invariant.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = self.requested_id() {
            validate_id(id)?;
        }
        validate_created_by(&self.created_by)?;
        validate_comment(&self.comment)?;
        validate_window(self.starts_at, self.ends_at)?;
        validate_matchers(&self.matchers)
    }
}

/// Builder for [`NewSilence`].
#[derive(Debug)]
pub struct NewSilenceBuilder {
    id: Option<String>,
    created_by: String,
    comment: String,
    starts_at: Option<DateTime<Utc>>,
    ends_at: Option<DateTime<Utc>>,
    matchers: Vec<Matcher>,
}

impl NewSilenceBuilder {
    fn new(created_by: impl Into<String>, comment: impl Into<String>) -> Self {
        Self {
            id: None,
            created_by: created_by.into(),
            comment: comment.into(),
            starts_at: None,
            ends_at: None,
            matchers: Vec::new(),
        }
    }

    /// Requests a specific ID.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the start of the window.
    #[must_use]
    pub fn starts_at(mut self, starts_at: DateTime<Utc>) -> Self {
        self.starts_at = Some(starts_at);
        self
    }

    /// Sets the end of the window.
    #[must_use]
    pub fn ends_at(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    /// Sets both ends of the window.
    #[must_use]
    pub fn window(self, starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Self {
        self.starts_at(starts_at).ends_at(ends_at)
    }

    /// Appends a matcher.
    #[must_use]
    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Appends several matchers.
    #[must_use]
    pub fn matchers(mut self, matchers: impl IntoIterator<Item = Matcher>) -> Self {
        self.matchers.extend(matchers);
        self
    }

    /// Builds and validates the input.
    ///
    /// # Errors
    ///
    /// Returns `SilenceError::Validation` if the window is missing or any
    /// invariant is violated.
    pub fn build(self) -> Result<NewSilence> {
        let starts_at = self
            .starts_at
            .ok_or_else(|| SilenceError::validation("startsAt", "is required"))?;
        let ends_at = self
            .ends_at
            .ok_or_else(|| SilenceError::validation("endsAt", "is required"))?;

        let silence = NewSilence {
            id: self.id,
            created_by: self.created_by,
            comment: self.comment,
            starts_at,
            ends_at,
            matchers: self.matchers,
        };
        silence.validate()?;
        Ok(silence)
    }
}

/// A partial update guarded by the caller's view of `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SilencePatch {
    /// The silence to update.
    pub id: String,
    /// The `updated_at` the caller last observed.
    pub expected_updated_at: DateTime<Utc>,
    /// New comment.
    #[serde(default)]
    pub comment: Option<String>,
    /// New start of the window.
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    /// New end of the window.
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// Replacement matcher list.
    #[serde(default)]
    pub matchers: Option<Vec<Matcher>>,
}

impl SilencePatch {
    /// Starts a patch from the silence the caller last read.
    #[must_use]
    pub fn for_silence(silence: &Silence) -> Self {
        Self {
            id: silence.id.clone(),
            expected_updated_at: silence.updated_at,
            comment: None,
            starts_at: None,
            ends_at: None,
            matchers: None,
        }
    }

    /// Replaces the comment.
    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Moves the start of the window.
    #[must_use]
    pub fn starts_at(mut self, starts_at: DateTime<Utc>) -> Self {
        self.starts_at = Some(starts_at);
        self
    }

    /// Moves the end of the window.
    #[must_use]
    pub fn ends_at(mut self, ends_at: DateTime<Utc>) -> Self {
        self.ends_at = Some(ends_at);
        self
    }

    /// Replaces the matchers.
    #[must_use]
    pub fn matchers(mut self, matchers: Vec<Matcher>) -> Self {
        self.matchers = Some(matchers);
        self
    }

    /// Returns true if no field would change.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.comment.is_none()
            && self.starts_at.is_none()
            && self.ends_at.is_none()
            && self.matchers.is_none()
    }

    /// Merges the supplied fields onto `current` and validates the result.
    ///
    /// Immutable fields (`id`, `created_by`, `created_at`) are carried over
    /// untouched; `status` and `updated_at` are left for the caller to set.
    pub fn apply(&self, current: &Silence) -> Result<Silence> {
        if self.is_empty() {
            return Err(SilenceError::validation("patch", "no fields to update"));
        }

        let mut merged = current.clone();
        if let Some(comment) = &self.comment {
            validate_comment(comment)?;
            merged.comment.clone_from(comment);
        }
        if let Some(starts_at) = self.starts_at {
            merged.starts_at = starts_at;
        }
        if let Some(ends_at) = self.ends_at {
            merged.ends_at = ends_at;
        }
        if let Some(matchers) = &self.matchers {
            validate_matchers(matchers)?;
            merged.matchers.clone_from(matchers);
        }
        validate_window(merged.starts_at, merged.ends_at)?;
        Ok(merged)
    }
}

fn validate_id(id: &str) -> Result<()> {
    if id.len() > MAX_ID_LEN {
        return Err(SilenceError::validation(
            "id",
            format!("exceeds {MAX_ID_LEN} bytes"),
        ));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(SilenceError::validation("id", "must not contain whitespace"));
    }
    Ok(())
}

fn validate_created_by(created_by: &str) -> Result<()> {
    if created_by.trim().is_empty() {
        return Err(SilenceError::validation("createdBy", "must not be empty"));
    }
    if created_by.len() > MAX_CREATED_BY_LEN {
        return Err(SilenceError::validation(
            "createdBy",
            format!("exceeds {MAX_CREATED_BY_LEN} bytes"),
        ));
    }
    Ok(())
}

fn validate_comment(comment: &str) -> Result<()> {
    if comment.trim().is_empty() {
        return Err(SilenceError::validation("comment", "must not be empty"));
    }
    if comment.len() > MAX_COMMENT_LEN {
        return Err(SilenceError::validation(
            "comment",
            format!("exceeds {MAX_COMMENT_LEN} bytes"),
        ));
    }
    Ok(())
}

fn validate_window(starts_at: DateTime<Utc>, ends_at: DateTime<Utc>) -> Result<()> {
    // Timestamps are persisted as i64 nanoseconds.
    if starts_at.timestamp_nanos_opt().is_none() {
        return Err(SilenceError::validation("startsAt", "out of range"));
    }
    if ends_at.timestamp_nanos_opt().is_none() {
        return Err(SilenceError::validation("endsAt", "out of range"));
    }
    if ends_at <= starts_at {
        return Err(SilenceError::validation(
            "endsAt",
            "silence end time must be after start time",
        ));
    }
    Ok(())
}

fn validate_matchers(matchers: &[Matcher]) -> Result<()> {
    if matchers.is_empty() {
        return Err(SilenceError::validation(
            "matchers",
            "at least one matcher is required",
        ));
    }
    if matchers.len() > MAX_MATCHERS {
        return Err(SilenceError::validation(
            "matchers",
            format!("at most {MAX_MATCHERS} matchers are allowed"),
        ));
    }
    matchers.iter().try_for_each(Matcher::validate)
}
