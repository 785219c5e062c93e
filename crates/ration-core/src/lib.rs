use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RationError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Separates the category label from the rest of a record's content.
pub const CATEGORY_DELIMITER: char = '-';

pub const MAX_CONTENT_CHARS: usize = 255;
pub const MAX_USER_ID_CHARS: usize = 64;

// Fixed transport replies. The quota scales with the live category set,
// so none of these texts quotes a number.
pub const GREETING_MESSAGE: &str = "Hello! Send /get_records to receive today's records.";
pub const LIMIT_REACHED_MESSAGE: &str =
    "You have already received your daily share of records. Try again tomorrow.";
pub const NO_RECORDS_MESSAGE: &str = "No records are available today.";

const DAY_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const UTC_OFFSET_FORMAT: &[FormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

/// Opaque caller identity supplied by the messaging transport.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// # Errors
    /// Returns [`RationError::Validation`] when the identity is blank or
    /// longer than [`MAX_USER_ID_CHARS`].
    pub fn new(value: impl Into<String>) -> Result<Self, RationError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(RationError::Validation(
                "user id MUST NOT be empty".to_string(),
            ));
        }
        if value.chars().count() > MAX_USER_ID_CHARS {
            return Err(RationError::Validation(format!(
                "user id MUST be at most {MAX_USER_ID_CHARS} characters"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the category label of a record: the content prefix before the
/// first [`CATEGORY_DELIMITER`], or the whole content when no delimiter is
/// present.
#[must_use]
pub fn category_of(content: &str) -> &str {
    match content.find(CATEGORY_DELIMITER) {
        Some(index) => &content[..index],
        None => content,
    }
}

/// Checks that a content string is storable as a record.
///
/// # Errors
/// Returns [`RationError::Validation`] when the content is empty, longer
/// than [`MAX_CONTENT_CHARS`], or would carry an empty category label.
pub fn validate_content(content: &str) -> Result<(), RationError> {
    if content.is_empty() {
        return Err(RationError::Validation(
            "record content MUST NOT be empty".to_string(),
        ));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(RationError::Validation(format!(
            "record content MUST be at most {MAX_CONTENT_CHARS} characters"
        )));
    }
    if category_of(content).is_empty() {
        return Err(RationError::Validation(
            "record content MUST NOT begin with the category delimiter".to_string(),
        ));
    }
    Ok(())
}

/// Derives the distinct category set of a batch of record contents.
pub fn categories_from_contents<'a, I>(contents: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    contents
        .into_iter()
        .map(|content| category_of(content).to_string())
        .collect()
}

/// Quota knobs. The daily quota is `per_category_allowance` multiplied by
/// the number of live categories, so seeding a new category raises every
/// user's ceiling without a configuration change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct IssuancePolicy {
    pub per_category_allowance: u32,
    pub discovery_window: u32,
}

impl IssuancePolicy {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            per_category_allowance: 4,
            discovery_window: 25,
        }
    }

    /// # Errors
    /// Returns [`RationError::Configuration`] when a knob is zero.
    pub fn validate(&self) -> Result<(), RationError> {
        if self.per_category_allowance == 0 {
            return Err(RationError::Configuration(
                "per_category_allowance MUST be >= 1".to_string(),
            ));
        }
        if self.discovery_window == 0 {
            return Err(RationError::Configuration(
                "discovery_window MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn daily_quota(&self, category_count: u32) -> u32 {
        category_count.saturating_mul(self.per_category_allowance)
    }
}

/// Budget share each category may contribute to one allocation. Integer
/// truncation is deliberate: rounding up could let a request exceed the
/// remaining budget, so a budget that is not a multiple of the category
/// count under-issues instead.
#[must_use]
pub fn per_category_share(remaining_budget: u32, category_count: u32) -> u32 {
    if category_count == 0 {
        return 0;
    }
    remaining_budget / category_count
}

/// One reserved record as handed to the delivery side.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IssuedRecord {
    pub id: i64,
    pub category: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AllocationOutcome {
    LimitReached,
    NoRecordsAvailable,
    Issued { records: Vec<IssuedRecord> },
}

impl AllocationOutcome {
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Self::LimitReached => "limit_reached",
            Self::NoRecordsAvailable => "no_records_available",
            Self::Issued { .. } => "issued",
        }
    }
}

/// Commands the messaging transport may submit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Start,
    GetRecords,
}

impl Command {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::GetRecords => "get_records",
        }
    }

    /// Accepts the bare command name or the slash-prefixed chat form.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.strip_prefix('/').unwrap_or(value) {
            "start" => Some(Self::Start),
            "get_records" => Some(Self::GetRecords),
            _ => None,
        }
    }
}

/// Formats a day key as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`RationError::Validation`] when formatting fails.
pub fn format_day(day: Date) -> Result<String, RationError> {
    day.format(&DAY_FORMAT)
        .map_err(|err| RationError::Validation(format!("failed to format day key: {err}")))
}

/// Parses a `YYYY-MM-DD` day key.
///
/// # Errors
/// Returns [`RationError::Validation`] when the value is not a valid
/// calendar date in that form.
pub fn parse_day(value: &str) -> Result<Date, RationError> {
    Date::parse(value, &DAY_FORMAT)
        .map_err(|err| RationError::Validation(format!("invalid day key {value}: {err}")))
}

/// Parses a fixed UTC offset in `+HH:MM` / `-HH:MM` form.
///
/// # Errors
/// Returns [`RationError::Configuration`] when the value is not a valid
/// offset.
pub fn parse_utc_offset(value: &str) -> Result<UtcOffset, RationError> {
    UtcOffset::parse(value, &UTC_OFFSET_FORMAT)
        .map_err(|err| RationError::Configuration(format!("invalid utc offset {value}: {err}")))
}

/// Calendar day at `timestamp` as observed in the given offset.
#[must_use]
pub fn day_key_at(timestamp: OffsetDateTime, offset: UtcOffset) -> Date {
    timestamp.to_offset(offset).date()
}

/// Next midnight after `timestamp` in the given offset; the instant at
/// which the issuance day rolls over.
///
/// # Errors
/// Returns [`RationError::Validation`] when the following day is outside
/// the supported calendar range.
pub fn next_rollover(
    timestamp: OffsetDateTime,
    offset: UtcOffset,
) -> Result<OffsetDateTime, RationError> {
    let today = day_key_at(timestamp, offset);
    let tomorrow = Date::from_julian_day(today.to_julian_day() + 1)
        .map_err(|err| RationError::Validation(format!("day rollover out of range: {err}")))?;
    Ok(tomorrow.midnight().assume_offset(offset))
}
