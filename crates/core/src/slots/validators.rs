use chrono::{Datelike, NaiveDate};
use serde_json::Value;
use thiserror::Error;

use crate::domain::slots::{GroupKey, SlotRecord};
use crate::slots::FieldSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validator {
    NonEmpty,
    OneOf(&'static [&'static str]),
    /// `YYYYMMDD`.
    CalendarDate,
    Email,
    Phone,
    TicketCount { min: u32, max: u32 },
    CardNumber,
    /// `MM/YY`, not before the current month.
    CardExpiry,
    Cvv,
    Boolean,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fixup {
    Trim,
    Uppercase,
    DigitsOnly,
    StripWhitespace,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldProblem {
    Missing,
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldIssue {
    pub field: &'static str,
    pub hint: &'static str,
    pub problem: FieldProblem,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("slot group `{group}` failed validation: {}", describe_issues(.issues))]
pub struct ValidationError {
    pub group: GroupKey,
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    /// Re-prompt text naming each problem field and what a good value looks like.
    pub fn user_guidance(&self) -> String {
        let lines: Vec<String> = self
            .issues
            .iter()
            .map(|issue| match &issue.problem {
                FieldProblem::Missing => format!("- {} is still missing ({})", issue.field, issue.hint),
                FieldProblem::Invalid(reason) => {
                    format!("- {} doesn't look right: {reason} ({})", issue.field, issue.hint)
                }
            })
            .collect();
        format!("I need a little more detail before I can continue:\n{}", lines.join("\n"))
    }
}

fn describe_issues(issues: &[FieldIssue]) -> String {
    issues.iter().map(|issue| issue.field).collect::<Vec<_>>().join(", ")
}

impl Fixup {
    pub fn apply(&self, value: Value) -> Value {
        let Value::String(text) = value else {
            return value;
        };
        let fixed = match self {
            Self::Trim => text.trim().to_owned(),
            Self::Uppercase => text.trim().to_ascii_uppercase(),
            Self::DigitsOnly => text.chars().filter(char::is_ascii_digit).collect(),
            Self::StripWhitespace => text.chars().filter(|ch| !ch.is_whitespace()).collect(),
        };
        Value::String(fixed)
    }
}

impl Validator {
    /// Checks one value, returning the normalized form on success.
    pub fn check(&self, value: &Value, today: NaiveDate) -> Result<Value, String> {
        match self {
            Self::NonEmpty => {
                let text = as_text(value)?;
                if text.trim().is_empty() {
                    return Err("must not be empty".to_owned());
                }
                Ok(Value::String(text))
            }
            Self::OneOf(allowed) => {
                let text = as_text(value)?;
                allowed
                    .iter()
                    .find(|candidate| candidate.eq_ignore_ascii_case(text.trim()))
                    .map(|candidate| Value::String((*candidate).to_owned()))
                    .ok_or_else(|| format!("expected one of {}", allowed.join(", ")))
            }
            Self::CalendarDate => {
                let text = as_text(value)?;
                NaiveDate::parse_from_str(&text, "%Y%m%d")
                    .map_err(|_| "expected a real date as YYYYMMDD".to_owned())?;
                if text.len() != 8 {
                    return Err("expected a real date as YYYYMMDD".to_owned());
                }
                Ok(Value::String(text))
            }
            Self::Email => {
                let text = as_text(value)?.trim().to_ascii_lowercase();
                if is_plausible_email(&text) {
                    Ok(Value::String(text))
                } else {
                    Err("expected an address like name@example.com".to_owned())
                }
            }
            Self::Phone => {
                let text = as_text(value)?;
                let allowed = text
                    .chars()
                    .all(|ch| ch.is_ascii_digit() || matches!(ch, '+' | '-' | ' ' | '(' | ')' | '.'));
                let digits = text.chars().filter(char::is_ascii_digit).count();
                if allowed && digits >= 10 {
                    Ok(Value::String(text.trim().to_owned()))
                } else {
                    Err("expected a phone number with at least 10 digits".to_owned())
                }
            }
            Self::TicketCount { min, max } => {
                let count = as_count(value).ok_or_else(|| "expected a whole number".to_owned())?;
                if count < *min || count > *max {
                    return Err(format!("expected a number between {min} and {max}"));
                }
                Ok(Value::from(count))
            }
            Self::CardNumber => {
                let text = as_text(value)?;
                let digits: Vec<u32> = text.chars().filter_map(|ch| ch.to_digit(10)).collect();
                if digits.len() != text.len() || !(13..=19).contains(&digits.len()) {
                    return Err("expected 13 to 19 digits".to_owned());
                }
                if !luhn_valid(&digits) {
                    return Err("the card number checksum does not match".to_owned());
                }
                Ok(Value::String(text))
            }
            Self::CardExpiry => {
                let text = as_text(value)?;
                let (month, year) =
                    parse_expiry(text.trim()).ok_or_else(|| "expected MM/YY".to_owned())?;
                if (year, month) < (today.year(), today.month()) {
                    return Err("the card has expired".to_owned());
                }
                Ok(Value::String(format!("{month:02}/{:02}", year % 100)))
            }
            Self::Cvv => {
                let text = as_text(value)?;
                let all_digits = text.chars().all(|ch| ch.is_ascii_digit());
                if all_digits && (3..=4).contains(&text.len()) {
                    Ok(Value::String(text))
                } else {
                    Err("expected 3 or 4 digits".to_owned())
                }
            }
            Self::Boolean => match value {
                Value::Bool(flag) => Ok(Value::Bool(*flag)),
                Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
                    "yes" | "y" | "true" | "confirm" | "confirmed" => Ok(Value::Bool(true)),
                    "no" | "n" | "false" | "cancel" | "declined" => Ok(Value::Bool(false)),
                    _ => Err("expected yes or no".to_owned()),
                },
                _ => Err("expected yes or no".to_owned()),
            },
        }
    }
}

/// Runs fixups then validators over every declared field. Returns the normalized record
/// (declared fields only) or every problem found.
pub fn validate_group(
    group: GroupKey,
    fields: &[FieldSpec],
    record: &SlotRecord,
    today: NaiveDate,
) -> Result<SlotRecord, ValidationError> {
    let mut normalized = SlotRecord::new();
    let mut issues = Vec::new();

    for spec in fields {
        let Some(raw) = record.get(spec.name) else {
            issues.push(FieldIssue { field: spec.name, hint: spec.hint, problem: FieldProblem::Missing });
            continue;
        };
        let fixed = spec.fixups.iter().fold(raw.clone(), |value, fixup| fixup.apply(value));
        match spec.validator.check(&fixed, today) {
            Ok(value) => normalized.insert(spec.name, value),
            Err(reason) => issues.push(FieldIssue {
                field: spec.name,
                hint: spec.hint,
                problem: FieldProblem::Invalid(reason),
            }),
        }
    }

    if issues.is_empty() {
        Ok(normalized)
    } else {
        Err(ValidationError { group, issues })
    }
}

fn as_text(value: &Value) -> Result<String, String> {
    match value {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        _ => Err("expected text".to_owned()),
    }
}

fn as_count(value: &Value) -> Option<u32> {
    match value {
        Value::Number(number) => number.as_u64().and_then(|count| u32::try_from(count).ok()),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn is_plausible_email(text: &str) -> bool {
    let Some((local, domain)) = text.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !text.chars().any(char::is_whitespace)
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty())
}

fn luhn_valid(digits: &[u32]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(index, digit)| {
            if index % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                *digit
            }
        })
        .sum();
    sum % 10 == 0
}

fn parse_expiry(text: &str) -> Option<(u32, i32)> {
    let (month, year) = text.split_once('/')?;
    let month: u32 = month.trim().parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    let year = year.trim();
    let year: i32 = match year.len() {
        2 => 2000 + year.parse::<i32>().ok()?,
        4 => year.parse().ok()?,
        _ => return None,
    };
    Some((month, year))
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::{json, Value};

    use super::{validate_group, FieldProblem, Fixup, Validator};
    use crate::domain::slots::{GroupKey, SlotRecord};
    use crate::slots::SlotSchemaRegistry;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).expect("valid date")
    }

    #[test]
    fn calendar_dates_must_exist() {
        assert!(Validator::CalendarDate.check(&json!("20261201"), today()).is_ok());
        assert!(Validator::CalendarDate.check(&json!("20260231"), today()).is_err());
        assert!(Validator::CalendarDate.check(&json!("2026-12-01"), today()).is_err());
    }

    #[test]
    fn card_number_requires_luhn_checksum() {
        assert!(Validator::CardNumber.check(&json!("4111111111111111"), today()).is_ok());
        assert!(Validator::CardNumber.check(&json!("4111111111111112"), today()).is_err());
        assert!(Validator::CardNumber.check(&json!("4111"), today()).is_err());
    }

    #[test]
    fn card_expiry_rejects_past_months() {
        assert_eq!(
            Validator::CardExpiry.check(&json!("10/26"), today()),
            Ok(Value::String("10/26".to_owned()))
        );
        assert!(Validator::CardExpiry.check(&json!("09/26"), today()).is_err());
        assert!(Validator::CardExpiry.check(&json!("13/30"), today()).is_err());
    }

    #[test]
    fn boolean_accepts_yes_and_no_words() {
        assert_eq!(Validator::Boolean.check(&json!("Yes"), today()), Ok(Value::Bool(true)));
        assert_eq!(Validator::Boolean.check(&json!(false), today()), Ok(Value::Bool(false)));
        assert!(Validator::Boolean.check(&json!("maybe"), today()).is_err());
    }

    #[test]
    fn fixups_run_before_validation() {
        assert_eq!(Fixup::DigitsOnly.apply(json!("2026-12-01")), json!("20261201"));
        assert_eq!(Fixup::Uppercase.apply(json!(" sia ")), json!("SIA"));
        assert_eq!(Fixup::StripWhitespace.apply(json!("4111 1111")), json!("41111111"));
        assert_eq!(Fixup::Trim.apply(json!(3)), json!(3));
    }

    #[test]
    fn itinerary_group_normalizes_and_reports_every_problem() {
        let registry = SlotSchemaRegistry::standard();
        let fields = registry.fields(GroupKey::Arrival).expect("itinerary fields");

        let good = SlotRecord::new()
            .with("airportid", "sia")
            .with("traveldate", "2026-12-01")
            .with("flightId", "aa 123");
        let normalized =
            validate_group(GroupKey::Arrival, fields, &good, today()).expect("valid itinerary");
        assert_eq!(normalized.get_str("airportid"), Some("SIA"));
        assert_eq!(normalized.get_str("traveldate"), Some("20261201"));
        assert_eq!(normalized.get_str("flightId"), Some("AA123"));

        let bad = SlotRecord::new().with("airportid", "JFK").with("traveldate", "20261301");
        let error = validate_group(GroupKey::Arrival, fields, &bad, today()).expect_err("invalid");
        assert_eq!(error.issues.len(), 3);
        assert!(error.issues.iter().any(|issue| issue.problem == FieldProblem::Missing));
        assert!(error.user_guidance().contains("airportid"));
    }
}
