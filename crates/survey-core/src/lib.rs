use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use ulid::Ulid;

pub mod crypto;

pub use crypto::AnswerCodec;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SurveyError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

macro_rules! ulid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a canonical ULID string id.
            ///
            /// # Errors
            /// Returns [`SurveyError::Validation`] for malformed ids.
            pub fn parse(value: &str) -> Result<Self, SurveyError> {
                Ulid::from_string(value)
                    .map(Self)
                    .map_err(|err| SurveyError::Validation(format!("invalid id '{value}': {err}")))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(SurveyId);
ulid_id!(SectionId);
ulid_id!(QuestionId);
ulid_id!(OptionId);
ulid_id!(SessionId);
ulid_id!(InvitationId);
ulid_id!(ResponseId);
ulid_id!(AnswerId);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SurveyStatus {
    Draft,
    Active,
    Archived,
}

impl SurveyStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    Text,
    Number,
    Date,
    Dropdown,
    Checkbox,
    Radio,
}

impl QuestionType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Date => "date",
            Self::Dropdown => "dropdown",
            Self::Checkbox => "checkbox",
            Self::Radio => "radio",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(Self::Text),
            "number" => Some(Self::Number),
            "date" => Some(Self::Date),
            "dropdown" => Some(Self::Dropdown),
            "checkbox" => Some(Self::Checkbox),
            "radio" => Some(Self::Radio),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_selection(self) -> bool {
        matches!(self, Self::Dropdown | Self::Checkbox | Self::Radio)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    Abandoned,
}

impl SessionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Submitted,
    Expired,
}

impl InvitationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Expired => "expired",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "submitted" => Some(Self::Submitted),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Submitted,
    Revised,
    Deleted,
}

impl ResponseStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Revised => "revised",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "submitted" => Some(Self::Submitted),
            "revised" => Some(Self::Revised),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

// ---- time helpers --------------------------------------------------------

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Formats a timestamp as RFC3339 (UTC, `Z` suffix).
///
/// # Errors
/// Returns [`SurveyError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SurveyError> {
    value
        .format(&Rfc3339)
        .map_err(|err| SurveyError::Validation(format!("invalid timestamp: {err}")))
}

/// Parses an RFC3339 timestamp into UTC.
///
/// # Errors
/// Returns [`SurveyError::Validation`] for malformed timestamps.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SurveyError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|parsed| parsed.to_offset(time::UtcOffset::UTC))
        .map_err(|err| SurveyError::Validation(format!("invalid RFC3339 timestamp '{value}': {err}")))
}

const ISO_DATE: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

/// Parses a calendar date in ISO `YYYY-MM-DD` form.
///
/// # Errors
/// Returns [`SurveyError::Validation`] for malformed dates.
pub fn parse_iso_date(value: &str) -> Result<Date, SurveyError> {
    Date::parse(value, ISO_DATE)
        .map_err(|err| SurveyError::Validation(format!("invalid date '{value}': {err}")))
}

/// Formats a calendar date as ISO `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`SurveyError::Validation`] when formatting fails.
pub fn format_iso_date(value: Date) -> Result<String, SurveyError> {
    value
        .format(ISO_DATE)
        .map_err(|err| SurveyError::Validation(format!("invalid date: {err}")))
}

// ---- conditional rules ---------------------------------------------------

/// Comparison operators supported by `show_if` / `required_if`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub enum CompareOp {
    #[default]
    #[serde(rename = "==", alias = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CompareOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "=" | "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }
}

/// One conditional rule: compare the answer of `question_code` against
/// `value` using `operator`. Reused for both visibility and conditional
/// requirement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConditionRule {
    pub question_code: String,
    #[serde(default)]
    pub operator: CompareOp,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct TextBounds {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct NumberBounds {
    pub min_value: Option<Decimal>,
    pub max_value: Option<Decimal>,
    pub step: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DateBounds {
    pub min_date: Option<String>,
    pub max_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SelectionBounds {
    pub min_selected: Option<usize>,
    pub max_selected: Option<usize>,
}

/// Structured per-question constraint record. Bounds sections are
/// validated against the question type at authoring time instead of
/// being carried as an open JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct QuestionConstraints {
    pub text: Option<TextBounds>,
    pub number: Option<NumberBounds>,
    pub date: Option<DateBounds>,
    pub selection: Option<SelectionBounds>,
    pub show_if: Option<ConditionRule>,
    pub required_if: Option<ConditionRule>,
}

impl QuestionConstraints {
    /// Checks that the populated bounds sections match the question type.
    ///
    /// # Errors
    /// Returns [`SurveyError::Validation`] when a bounds section does not
    /// apply to `question_type` or the date bounds are malformed.
    pub fn validate_for(&self, question_type: QuestionType) -> Result<(), SurveyError> {
        if self.text.is_some() && question_type != QuestionType::Text {
            return Err(SurveyError::Validation(format!(
                "text bounds are not valid for a {} question",
                question_type.as_str()
            )));
        }
        if self.number.is_some() && question_type != QuestionType::Number {
            return Err(SurveyError::Validation(format!(
                "number bounds are not valid for a {} question",
                question_type.as_str()
            )));
        }
        if self.date.is_some() && question_type != QuestionType::Date {
            return Err(SurveyError::Validation(format!(
                "date bounds are not valid for a {} question",
                question_type.as_str()
            )));
        }
        if self.selection.is_some() && !question_type.is_selection() {
            return Err(SurveyError::Validation(format!(
                "selection bounds are not valid for a {} question",
                question_type.as_str()
            )));
        }
        if let Some(date) = &self.date {
            for bound in [date.min_date.as_deref(), date.max_date.as_deref()]
                .into_iter()
                .flatten()
            {
                parse_iso_date(bound)?;
            }
        }
        Ok(())
    }

    /// Decodes and validates a constraints record from JSON.
    ///
    /// # Errors
    /// Returns [`SurveyError::Validation`] when decoding fails or the
    /// record does not apply to `question_type`.
    pub fn from_json(value: &Value, question_type: QuestionType) -> Result<Self, SurveyError> {
        let constraints: Self = serde_json::from_value(value.clone())
            .map_err(|err| SurveyError::Validation(format!("invalid constraints: {err}")))?;
        constraints.validate_for(question_type)?;
        Ok(constraints)
    }
}

// ---- schema index --------------------------------------------------------

/// One question as the validation pipeline sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionDef {
    pub id: QuestionId,
    pub code: String,
    pub prompt: String,
    pub question_type: QuestionType,
    pub required: bool,
    pub sensitive: bool,
    pub constraints: QuestionConstraints,
}

impl QuestionDef {
    /// Human-facing identification used in validation messages.
    #[must_use]
    pub fn display_name(&self) -> String {
        if !self.prompt.trim().is_empty() {
            self.prompt.clone()
        } else if !self.code.trim().is_empty() {
            self.code.clone()
        } else {
            format!("question #{}", self.id)
        }
    }
}

/// In-memory snapshot of one survey's questions and option sets, built
/// once per submission.
#[derive(Debug, Clone, Default)]
pub struct SurveySchema {
    questions: BTreeMap<String, QuestionDef>,
    options_by_code: BTreeMap<String, BTreeSet<String>>,
}

impl SurveySchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a question; `option_values` is only retained for
    /// selection-type questions.
    pub fn insert_question(&mut self, question: QuestionDef, option_values: Vec<String>) {
        if question.question_type.is_selection() {
            self.options_by_code
                .insert(question.code.clone(), option_values.into_iter().collect());
        }
        self.questions.insert(question.code.clone(), question);
    }

    #[must_use]
    pub fn question(&self, code: &str) -> Option<&QuestionDef> {
        self.questions.get(code)
    }

    pub fn questions(&self) -> impl Iterator<Item = &QuestionDef> {
        self.questions.values()
    }

    #[must_use]
    pub fn option_values(&self, code: &str) -> Option<&BTreeSet<String>> {
        self.options_by_code.get(code)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

// ---- condition evaluation ------------------------------------------------

/// A value coerced into one comparison domain. Comparisons across
/// domains fail closed.
#[derive(Debug, Clone, PartialEq)]
pub enum CompareValue {
    Number(Decimal),
    Date(Date),
    Text(String),
}

/// Evaluates `left <op> right`. Mismatched domains yield `false`;
/// conditions never raise.
#[must_use]
pub fn evaluate_condition(left: &CompareValue, op: CompareOp, right: &CompareValue) -> bool {
    let ordering = match (left, right) {
        (CompareValue::Number(l), CompareValue::Number(r)) => l.cmp(r),
        (CompareValue::Date(l), CompareValue::Date(r)) => l.cmp(r),
        (CompareValue::Text(l), CompareValue::Text(r)) => l.cmp(r),
        _ => return false,
    };
    match op {
        CompareOp::Eq => ordering.is_eq(),
        CompareOp::Ne => ordering.is_ne(),
        CompareOp::Lt => ordering.is_lt(),
        CompareOp::Le => ordering.is_le(),
        CompareOp::Gt => ordering.is_gt(),
        CompareOp::Ge => ordering.is_ge(),
    }
}

fn value_as_plain_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => Decimal::from_str(&number.to_string()).ok(),
        Value::String(text) => Decimal::from_str(text.trim()).ok(),
        _ => None,
    }
}

fn date_from_value(value: &Value) -> Option<Date> {
    match value {
        Value::String(text) => parse_iso_date(text.trim()).ok(),
        _ => None,
    }
}

/// Coerces the submitted value and the rule literal into the referenced
/// question type's comparison domain. `None` means the comparison is
/// indeterminate and the caller applies its conservative default.
///
/// Only a missing or null answer is indeterminate by itself: an empty
/// string converts in the string domain and compares as `""`, while the
/// number and date domains report it through their failed parses.
#[must_use]
pub fn coerce_for_compare(
    ref_type: QuestionType,
    submitted: Option<&Value>,
    literal: &Value,
) -> Option<(CompareValue, CompareValue)> {
    let submitted = submitted.filter(|value| !value.is_null())?;
    match ref_type {
        QuestionType::Number => Some((
            CompareValue::Number(decimal_from_value(submitted)?),
            CompareValue::Number(decimal_from_value(literal)?),
        )),
        QuestionType::Date => Some((
            CompareValue::Date(date_from_value(submitted)?),
            CompareValue::Date(date_from_value(literal)?),
        )),
        _ => {
            if literal.is_null() {
                return None;
            }
            Some((
                CompareValue::Text(value_as_plain_string(submitted)),
                CompareValue::Text(value_as_plain_string(literal)),
            ))
        }
    }
}

/// Uniform presence check used by required/conditional validations:
/// null, empty string and empty list count as absent.
#[must_use]
pub fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

fn condition_holds(
    rule: &ConditionRule,
    answers: &BTreeMap<String, Value>,
    schema: &SurveySchema,
) -> Option<bool> {
    let ref_question = schema.question(&rule.question_code)?;
    let (left, right) = coerce_for_compare(
        ref_question.question_type,
        answers.get(&rule.question_code),
        &rule.value,
    )?;
    Some(evaluate_condition(&left, rule.operator, &right))
}

/// Returns whether a question is visible under its optional `show_if`
/// rule. Unknown references and indeterminate comparisons hide the
/// question conservatively.
#[must_use]
pub fn passes_visibility(
    question: &QuestionDef,
    answers: &BTreeMap<String, Value>,
    schema: &SurveySchema,
) -> bool {
    let Some(rule) = &question.constraints.show_if else {
        return true;
    };
    if schema.question(&rule.question_code).is_none() {
        return false;
    }
    condition_holds(rule, answers, schema).unwrap_or(false)
}

/// Validates unconditional `required` and conditional `required_if` for
/// one question. Hidden questions are exempt from both.
///
/// # Errors
/// Returns [`SurveyError::Validation`] when a required answer is absent.
pub fn validate_required_rules(
    question: &QuestionDef,
    answers: &BTreeMap<String, Value>,
    schema: &SurveySchema,
) -> Result<(), SurveyError> {
    if !passes_visibility(question, answers, schema) {
        return Ok(());
    }

    let answered = answers
        .get(&question.code)
        .is_some_and(is_present);

    if question.required && !answered {
        return Err(SurveyError::Validation(format!(
            "Missing required answer for {}",
            question.display_name()
        )));
    }

    if let Some(rule) = &question.constraints.required_if {
        // Indeterminate comparison means the requirement is not triggered.
        let triggered = schema.question(&rule.question_code).is_some()
            && condition_holds(rule, answers, schema).unwrap_or(false);
        if triggered && !answered {
            return Err(SurveyError::Validation(format!(
                "Missing required answer for {} (conditional)",
                question.display_name()
            )));
        }
    }

    Ok(())
}

fn validate_text_bounds(question: &QuestionDef, raw: &Value) -> Result<(), SurveyError> {
    let Some(bounds) = &question.constraints.text else {
        return Ok(());
    };
    let text = match raw {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    let length = text.chars().count();

    if let Some(min_length) = bounds.min_length {
        if length < min_length {
            return Err(SurveyError::Validation(format!(
                "{}: must be at least {min_length} characters",
                question.code
            )));
        }
    }
    if let Some(max_length) = bounds.max_length {
        if length > max_length {
            return Err(SurveyError::Validation(format!(
                "{}: must be at most {max_length} characters",
                question.code
            )));
        }
    }
    if let Some(pattern) = &bounds.pattern {
        // Invalid patterns are ignored rather than failing the answer.
        let anchored = format!("^(?:{pattern})$");
        if let Ok(compiled) = regex::Regex::new(&anchored) {
            if !compiled.is_match(&text) {
                let message = bounds.error_message.clone().unwrap_or_else(|| {
                    format!("{}: value does not match pattern", question.code)
                });
                return Err(SurveyError::Validation(message));
            }
        }
    }
    Ok(())
}

fn validate_number_bounds(question: &QuestionDef, raw: &Value) -> Result<(), SurveyError> {
    let Some(bounds) = &question.constraints.number else {
        return Ok(());
    };
    // An unparseable literal is reported by coercion, not here.
    let Some(number) = decimal_from_value(raw) else {
        return Ok(());
    };

    if let Some(min_value) = bounds.min_value {
        if number < min_value {
            return Err(SurveyError::Validation(format!(
                "{}: must be >= {min_value}",
                question.code
            )));
        }
    }
    if let Some(max_value) = bounds.max_value {
        if number > max_value {
            return Err(SurveyError::Validation(format!(
                "{}: must be <= {max_value}",
                question.code
            )));
        }
    }
    if let Some(step) = bounds.step {
        if !step.is_zero() {
            let base = bounds.min_value.unwrap_or_default();
            // Step arithmetic edge cases are ignored rather than failing
            // the answer.
            if let Some(remainder) = number
                .checked_sub(base)
                .and_then(|delta| delta.checked_rem(step))
            {
                if !remainder.is_zero() {
                    return Err(SurveyError::Validation(format!(
                        "{}: must be in increments of {step}",
                        question.code
                    )));
                }
            }
        }
    }
    Ok(())
}

fn validate_date_bounds(question: &QuestionDef, raw: &Value) -> Result<(), SurveyError> {
    let Some(bounds) = &question.constraints.date else {
        return Ok(());
    };
    let Some(date) = date_from_value(raw) else {
        return Ok(());
    };

    if let Some(min_date) = bounds.min_date.as_deref().and_then(|v| parse_iso_date(v).ok()) {
        if date < min_date {
            return Err(SurveyError::Validation(format!(
                "{}: date must be on/after {}",
                question.code,
                bounds.min_date.as_deref().unwrap_or_default()
            )));
        }
    }
    if let Some(max_date) = bounds.max_date.as_deref().and_then(|v| parse_iso_date(v).ok()) {
        if date > max_date {
            return Err(SurveyError::Validation(format!(
                "{}: date must be on/before {}",
                question.code,
                bounds.max_date.as_deref().unwrap_or_default()
            )));
        }
    }
    Ok(())
}

fn validate_selection_count(question: &QuestionDef, count: usize) -> Result<(), SurveyError> {
    let Some(bounds) = &question.constraints.selection else {
        return Ok(());
    };
    let checkbox = question.question_type == QuestionType::Checkbox;
    if let Some(min_selected) = bounds.min_selected {
        if count < min_selected {
            let message = if checkbox {
                format!("{}: select at least {min_selected} option(s)", question.code)
            } else {
                format!("{}: at least {min_selected} selection required", question.code)
            };
            return Err(SurveyError::Validation(message));
        }
    }
    if let Some(max_selected) = bounds.max_selected {
        if count > max_selected {
            let message = if checkbox {
                format!("{}: select at most {max_selected} option(s)", question.code)
            } else {
                format!("{}: at most {max_selected} selection allowed", question.code)
            };
            return Err(SurveyError::Validation(message));
        }
    }
    Ok(())
}

/// Validates one submitted raw value against the question's type and
/// bounds. The first violation found is reported.
///
/// # Errors
/// Returns [`SurveyError::Validation`] describing the violated
/// constraint and the question.
pub fn validate_constraints(
    question: &QuestionDef,
    raw: &Value,
    schema: &SurveySchema,
) -> Result<(), SurveyError> {
    match question.question_type {
        QuestionType::Dropdown | QuestionType::Radio => {
            if is_present(raw) {
                let selected = value_as_plain_string(raw);
                let allowed = schema.option_values(&question.code);
                if !allowed.is_some_and(|set| set.contains(&selected)) {
                    return Err(SurveyError::Validation(format!(
                        "Invalid option '{selected}' for question {}",
                        question.code
                    )));
                }
            }
            let count = usize::from(is_present(raw));
            validate_selection_count(question, count)?;
        }
        QuestionType::Checkbox => {
            let selected: Vec<String> = match raw {
                Value::Null => Vec::new(),
                Value::String(text) if text.is_empty() => Vec::new(),
                Value::Array(items) => items.iter().map(value_as_plain_string).collect(),
                _ => {
                    return Err(SurveyError::Validation(format!(
                        "Expected list for checkbox question {}",
                        question.code
                    )))
                }
            };
            let empty = BTreeSet::new();
            let allowed = schema.option_values(&question.code).unwrap_or(&empty);
            let invalid: Vec<&String> = selected
                .iter()
                .filter(|value| !allowed.contains(value.as_str()))
                .collect();
            if !invalid.is_empty() {
                return Err(SurveyError::Validation(format!(
                    "Invalid option(s) {invalid:?} for question {}",
                    question.code
                )));
            }
            validate_selection_count(question, selected.len())?;
        }
        QuestionType::Text => validate_text_bounds(question, raw)?,
        QuestionType::Number => {
            if is_present(raw) {
                validate_number_bounds(question, raw)?;
            }
        }
        QuestionType::Date => {
            if is_present(raw) {
                validate_date_bounds(question, raw)?;
            }
        }
    }
    Ok(())
}

// ---- coercion to storage -------------------------------------------------

/// Typed storage fields for one answer. Sensitive answers carry the raw
/// payload instead and populate no plaintext field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoercedAnswer {
    pub value_text: Option<String>,
    pub value_number: Option<Decimal>,
    pub value_boolean: Option<bool>,
    pub value_date: Option<Date>,
    pub value_timestamp: Option<OffsetDateTime>,
    pub sensitive_payload: Option<Value>,
}

/// Converts a raw submitted value into the question type's canonical
/// storage representation.
///
/// # Errors
/// Returns [`SurveyError::Validation`] for unparseable number or date
/// literals and non-list checkbox values.
pub fn coerce_answer(question: &QuestionDef, raw: &Value) -> Result<CoercedAnswer, SurveyError> {
    if question.sensitive {
        return Ok(CoercedAnswer {
            sensitive_payload: Some(raw.clone()),
            ..CoercedAnswer::default()
        });
    }

    let mut coerced = CoercedAnswer::default();
    match question.question_type {
        QuestionType::Text => {
            coerced.value_text = match raw {
                Value::Null => None,
                other => Some(value_as_plain_string(other)),
            };
        }
        QuestionType::Number => {
            if is_present(raw) {
                coerced.value_number = Some(decimal_from_value(raw).ok_or_else(|| {
                    SurveyError::Validation(format!(
                        "Invalid number for question {}",
                        question.code
                    ))
                })?);
            }
        }
        QuestionType::Date => {
            if is_present(raw) {
                coerced.value_date = Some(date_from_value(raw).ok_or_else(|| {
                    SurveyError::Validation(format!(
                        "Invalid date (YYYY-MM-DD) for question {}",
                        question.code
                    ))
                })?);
            }
        }
        QuestionType::Dropdown | QuestionType::Radio => {
            coerced.value_text = match raw {
                Value::Null => None,
                other => Some(value_as_plain_string(other)),
            };
        }
        QuestionType::Checkbox => {
            coerced.value_text = match raw {
                Value::Null => None,
                Value::String(text) if text.is_empty() => None,
                Value::Array(items) => Some(
                    items
                        .iter()
                        .map(value_as_plain_string)
                        .collect::<Vec<_>>()
                        .join(","),
                ),
                _ => {
                    return Err(SurveyError::Validation(format!(
                        "Expected list for checkbox question {}",
                        question.code
                    )))
                }
            };
        }
    }
    Ok(coerced)
}

// ---- submission pipeline -------------------------------------------------

/// One validated, coerced, optionally encrypted answer ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedAnswer {
    pub question_id: QuestionId,
    pub question_code: String,
    pub value_text: Option<String>,
    pub value_number: Option<Decimal>,
    pub value_boolean: Option<bool>,
    pub value_date: Option<Date>,
    pub value_timestamp: Option<OffsetDateTime>,
    pub encrypted_value: Option<Vec<u8>>,
}

/// Runs the full per-submission validation pipeline: required and
/// visibility checks across every schema question, then per-answer
/// constraint validation, coercion and encryption. Unknown answer codes
/// are silently ignored.
///
/// # Errors
/// Returns [`SurveyError::Validation`] on the first violation found.
pub fn prepare_answers(
    schema: &SurveySchema,
    answers: &BTreeMap<String, Value>,
    codec: &AnswerCodec,
) -> Result<Vec<PreparedAnswer>, SurveyError> {
    for question in schema.questions() {
        validate_required_rules(question, answers, schema)?;
    }

    let mut prepared = Vec::new();
    for (code, raw) in answers {
        let Some(question) = schema.question(code) else {
            continue;
        };

        validate_constraints(question, raw, schema)?;
        let coerced = coerce_answer(question, raw)?;

        let encrypted_value = match &coerced.sensitive_payload {
            Some(payload) if !payload.is_null() => Some(codec.encrypt(payload)?),
            _ => None,
        };

        prepared.push(PreparedAnswer {
            question_id: question.id,
            question_code: question.code.clone(),
            value_text: coerced.value_text,
            value_number: coerced.value_number,
            value_boolean: coerced.value_boolean,
            value_date: coerced.value_date,
            value_timestamp: coerced.value_timestamp,
            encrypted_value,
        });
    }

    Ok(prepared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn question(code: &str, question_type: QuestionType) -> QuestionDef {
        QuestionDef {
            id: QuestionId::new(),
            code: code.to_string(),
            prompt: String::new(),
            question_type,
            required: false,
            sensitive: false,
            constraints: QuestionConstraints::default(),
        }
    }

    fn schema_with(questions: Vec<(QuestionDef, Vec<&str>)>) -> SurveySchema {
        let mut schema = SurveySchema::new();
        for (def, options) in questions {
            schema.insert_question(def, options.into_iter().map(String::from).collect());
        }
        schema
    }

    fn codec() -> AnswerCodec {
        match AnswerCodec::new("test-secret") {
            Ok(value) => value,
            Err(err) => panic!("codec construction failed: {err}"),
        }
    }

    #[test]
    fn condition_operators_compare_within_one_domain() {
        let five = CompareValue::Number(Decimal::from(5));
        let seven = CompareValue::Number(Decimal::from(7));
        assert!(evaluate_condition(&five, CompareOp::Lt, &seven));
        assert!(evaluate_condition(&seven, CompareOp::Ge, &five));
        assert!(evaluate_condition(&five, CompareOp::Ne, &seven));
        assert!(!evaluate_condition(&five, CompareOp::Eq, &seven));
    }

    #[test]
    fn condition_across_domains_fails_closed() {
        let number = CompareValue::Number(Decimal::from(5));
        let text = CompareValue::Text("5".to_string());
        assert!(!evaluate_condition(&number, CompareOp::Eq, &text));
        assert!(!evaluate_condition(&number, CompareOp::Ne, &text));
    }

    #[test]
    fn coerce_for_compare_number_accepts_json_numbers_and_strings() {
        let (left, right) = match coerce_for_compare(
            QuestionType::Number,
            Some(&json!("3.5")),
            &json!(3.5),
        ) {
            Some(pair) => pair,
            None => panic!("expected comparable pair"),
        };
        assert!(evaluate_condition(&left, CompareOp::Eq, &right));
    }

    #[test]
    fn coerce_for_compare_is_indeterminate_on_bad_literal() {
        assert!(coerce_for_compare(
            QuestionType::Number,
            Some(&json!("not-a-number")),
            &json!(1)
        )
        .is_none());
        assert!(coerce_for_compare(QuestionType::Date, Some(&json!("2026-13-40")), &json!("2026-01-01")).is_none());
        assert!(coerce_for_compare(QuestionType::Number, None, &json!(1)).is_none());
    }

    #[test]
    fn empty_string_text_gate_compares_in_string_domain() {
        let gate = question("q-gate", QuestionType::Text);
        let mut dependent = question("q-dep", QuestionType::Text);
        dependent.required = true;
        dependent.constraints.show_if = Some(ConditionRule {
            question_code: "q-gate".to_string(),
            operator: CompareOp::Ne,
            value: json!("x"),
        });
        let schema = schema_with(vec![(gate, vec![]), (dependent.clone(), vec![])]);

        let mut answers = BTreeMap::new();
        answers.insert("q-gate".to_string(), json!(""));

        // "" != "x" holds in the string domain, so the dependent stays
        // visible and its required flag still applies.
        let pair = coerce_for_compare(QuestionType::Text, Some(&json!("")), &json!("x"));
        assert!(pair.is_some());
        assert!(passes_visibility(&dependent, &answers, &schema));
        let err = match validate_required_rules(&dependent, &answers, &schema) {
            Err(err) => err,
            Ok(()) => panic!("expected missing-required failure"),
        };
        assert!(err.to_string().contains("Missing required answer"));
    }

    #[test]
    fn show_if_unknown_reference_hides_question_and_waives_required() {
        let mut dependent = question("q-dep", QuestionType::Text);
        dependent.required = true;
        dependent.constraints.show_if = Some(ConditionRule {
            question_code: "q-missing".to_string(),
            operator: CompareOp::Eq,
            value: json!("yes"),
        });
        let schema = schema_with(vec![(dependent.clone(), vec![])]);
        let answers = BTreeMap::new();

        assert!(!passes_visibility(&dependent, &answers, &schema));
        assert!(validate_required_rules(&dependent, &answers, &schema).is_ok());
    }

    #[test]
    fn show_if_resolvable_reference_controls_visibility() {
        let gate = question("q-gate", QuestionType::Text);
        let mut dependent = question("q-dep", QuestionType::Text);
        dependent.required = true;
        dependent.constraints.show_if = Some(ConditionRule {
            question_code: "q-gate".to_string(),
            operator: CompareOp::Eq,
            value: json!("yes"),
        });
        let schema = schema_with(vec![(gate, vec![]), (dependent.clone(), vec![])]);

        let mut answers = BTreeMap::new();
        answers.insert("q-gate".to_string(), json!("no"));
        assert!(!passes_visibility(&dependent, &answers, &schema));
        assert!(validate_required_rules(&dependent, &answers, &schema).is_ok());

        answers.insert("q-gate".to_string(), json!("yes"));
        assert!(passes_visibility(&dependent, &answers, &schema));
        let err = match validate_required_rules(&dependent, &answers, &schema) {
            Err(err) => err,
            Ok(()) => panic!("expected missing-required failure"),
        };
        assert!(err.to_string().contains("Missing required answer"));
    }

    #[test]
    fn required_if_coercion_failure_means_not_required() {
        let gate = question("q-age", QuestionType::Number);
        let mut dependent = question("q-reason", QuestionType::Text);
        dependent.constraints.required_if = Some(ConditionRule {
            question_code: "q-age".to_string(),
            operator: CompareOp::Ge,
            value: json!(18),
        });
        let schema = schema_with(vec![(gate, vec![]), (dependent.clone(), vec![])]);

        let mut answers = BTreeMap::new();
        answers.insert("q-age".to_string(), json!("unknown"));
        assert!(validate_required_rules(&dependent, &answers, &schema).is_ok());

        answers.insert("q-age".to_string(), json!(21));
        let result = validate_required_rules(&dependent, &answers, &schema);
        let err = match result {
            Err(err) => err,
            Ok(()) => panic!("expected conditional missing-required failure"),
        };
        assert!(err.to_string().contains("(conditional)"));
    }

    #[test]
    fn text_length_and_pattern_bounds() {
        let mut q = question("q-name", QuestionType::Text);
        q.constraints.text = Some(TextBounds {
            min_length: Some(2),
            max_length: Some(5),
            pattern: Some("[a-z]+".to_string()),
            error_message: None,
        });
        let schema = schema_with(vec![(q.clone(), vec![])]);

        assert!(validate_constraints(&q, &json!("abc"), &schema).is_ok());
        assert!(validate_constraints(&q, &json!("a"), &schema).is_err());
        assert!(validate_constraints(&q, &json!("toolong"), &schema).is_err());
        let err = match validate_constraints(&q, &json!("ABC"), &schema) {
            Err(err) => err,
            Ok(()) => panic!("expected pattern failure"),
        };
        assert!(err.to_string().contains("does not match pattern"));
    }

    #[test]
    fn text_pattern_custom_error_message_is_used() {
        let mut q = question("q-zip", QuestionType::Text);
        q.constraints.text = Some(TextBounds {
            min_length: None,
            max_length: None,
            pattern: Some("[0-9]{5}".to_string()),
            error_message: Some("zip must be five digits".to_string()),
        });
        let schema = schema_with(vec![(q.clone(), vec![])]);
        let err = match validate_constraints(&q, &json!("abcde"), &schema) {
            Err(err) => err,
            Ok(()) => panic!("expected pattern failure"),
        };
        assert!(err.to_string().contains("zip must be five digits"));
    }

    #[test]
    fn invalid_pattern_is_silently_ignored() {
        let mut q = question("q-free", QuestionType::Text);
        q.constraints.text = Some(TextBounds {
            min_length: None,
            max_length: None,
            pattern: Some("([unclosed".to_string()),
            error_message: None,
        });
        let schema = schema_with(vec![(q.clone(), vec![])]);
        assert!(validate_constraints(&q, &json!("anything"), &schema).is_ok());
    }

    #[test]
    fn number_bounds_and_step() {
        let mut q = question("q-2", QuestionType::Number);
        q.constraints.number = Some(NumberBounds {
            min_value: Some(Decimal::from(0)),
            max_value: Some(Decimal::from(10)),
            step: Some(Decimal::from(2)),
        });
        let schema = schema_with(vec![(q.clone(), vec![])]);

        assert!(validate_constraints(&q, &json!(4), &schema).is_ok());
        let err = match validate_constraints(&q, &json!(15), &schema) {
            Err(err) => err,
            Ok(()) => panic!("expected max bound failure"),
        };
        assert!(err.to_string().contains("q-2"));
        assert!(err.to_string().contains("10"));
        assert!(validate_constraints(&q, &json!(-1), &schema).is_err());
        assert!(validate_constraints(&q, &json!(3), &schema).is_err());
    }

    #[test]
    fn date_bounds_inclusive() {
        let mut q = question("q-when", QuestionType::Date);
        q.constraints.date = Some(DateBounds {
            min_date: Some("2026-01-01".to_string()),
            max_date: Some("2026-12-31".to_string()),
        });
        let schema = schema_with(vec![(q.clone(), vec![])]);

        assert!(validate_constraints(&q, &json!("2026-01-01"), &schema).is_ok());
        assert!(validate_constraints(&q, &json!("2026-12-31"), &schema).is_ok());
        assert!(validate_constraints(&q, &json!("2025-12-31"), &schema).is_err());
        assert!(validate_constraints(&q, &json!("2027-01-01"), &schema).is_err());
    }

    #[test]
    fn dropdown_requires_option_membership() {
        let q = question("q-city", QuestionType::Dropdown);
        let schema = schema_with(vec![(q.clone(), vec!["cairo", "alex"])]);
        assert!(validate_constraints(&q, &json!("cairo"), &schema).is_ok());
        assert!(validate_constraints(&q, &json!("giza"), &schema).is_err());
        // Absent value skips the membership check.
        assert!(validate_constraints(&q, &json!(null), &schema).is_ok());
    }

    #[test]
    fn checkbox_membership_and_count() {
        let mut q = question("q-tags", QuestionType::Checkbox);
        q.constraints.selection = Some(SelectionBounds {
            min_selected: Some(1),
            max_selected: Some(2),
        });
        let schema = schema_with(vec![(q.clone(), vec!["a", "b", "c"])]);

        assert!(validate_constraints(&q, &json!(["b", "a"]), &schema).is_ok());
        assert!(validate_constraints(&q, &json!(["a", "zzz"]), &schema).is_err());
        assert!(validate_constraints(&q, &json!([]), &schema).is_err());
        assert!(validate_constraints(&q, &json!(["a", "b", "c"]), &schema).is_err());
        assert!(validate_constraints(&q, &json!("a"), &schema).is_err());
    }

    #[test]
    fn dropdown_selection_bounds_use_presence_count_and_wording() {
        let mut q = question("q-city", QuestionType::Dropdown);
        q.constraints.selection = Some(SelectionBounds {
            min_selected: Some(1),
            max_selected: None,
        });
        let schema = schema_with(vec![(q.clone(), vec!["cairo", "alex"])]);

        assert!(validate_constraints(&q, &json!("cairo"), &schema).is_ok());
        let err = match validate_constraints(&q, &json!(null), &schema) {
            Err(err) => err,
            Ok(()) => panic!("expected min-selection failure"),
        };
        assert!(err.to_string().contains("at least 1 selection required"));

        let mut strict = question("q-pick", QuestionType::Radio);
        strict.constraints.selection = Some(SelectionBounds {
            min_selected: None,
            max_selected: Some(0),
        });
        let schema = schema_with(vec![(strict.clone(), vec!["a"])]);
        let err = match validate_constraints(&strict, &json!("a"), &schema) {
            Err(err) => err,
            Ok(()) => panic!("expected max-selection failure"),
        };
        assert!(err.to_string().contains("at most 0 selection allowed"));
    }

    #[test]
    fn coerce_checkbox_joins_with_commas() {
        let q = question("q-tags", QuestionType::Checkbox);
        let coerced = match coerce_answer(&q, &json!(["b", "a"])) {
            Ok(value) => value,
            Err(err) => panic!("unexpected coercion failure: {err}"),
        };
        assert_eq!(coerced.value_text.as_deref(), Some("b,a"));
        assert!(coerced.sensitive_payload.is_none());
    }

    #[test]
    fn coerce_number_rejects_bad_literal() {
        let q = question("q-n", QuestionType::Number);
        assert!(coerce_answer(&q, &json!("12.5")).is_ok());
        let err = match coerce_answer(&q, &json!("twelve")) {
            Err(err) => err,
            Ok(_) => panic!("expected number coercion failure"),
        };
        assert!(err.to_string().contains("Invalid number"));
    }

    #[test]
    fn coerce_sensitive_skips_typed_fields() {
        let mut q = question("q-ssn", QuestionType::Text);
        q.sensitive = true;
        let coerced = match coerce_answer(&q, &json!("123-45-6789")) {
            Ok(value) => value,
            Err(err) => panic!("unexpected coercion failure: {err}"),
        };
        assert!(coerced.value_text.is_none());
        assert_eq!(coerced.sensitive_payload, Some(json!("123-45-6789")));
    }

    #[test]
    fn prepare_answers_ignores_unknown_codes() {
        let q = question("q-1", QuestionType::Text);
        let schema = schema_with(vec![(q, vec![])]);
        let mut answers = BTreeMap::new();
        answers.insert("q-1".to_string(), json!("Alice"));
        answers.insert("q-unknown".to_string(), json!("ignored"));

        let prepared = match prepare_answers(&schema, &answers, &codec()) {
            Ok(value) => value,
            Err(err) => panic!("unexpected pipeline failure: {err}"),
        };
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].question_code, "q-1");
        assert_eq!(prepared[0].value_text.as_deref(), Some("Alice"));
    }

    #[test]
    fn prepare_answers_encrypts_sensitive_payloads() {
        let mut q = question("q-secret", QuestionType::Text);
        q.sensitive = true;
        let schema = schema_with(vec![(q, vec![])]);
        let mut answers = BTreeMap::new();
        answers.insert("q-secret".to_string(), json!("hidden"));

        let codec = codec();
        let prepared = match prepare_answers(&schema, &answers, &codec) {
            Ok(value) => value,
            Err(err) => panic!("unexpected pipeline failure: {err}"),
        };
        assert_eq!(prepared.len(), 1);
        assert!(prepared[0].value_text.is_none());
        let blob = match &prepared[0].encrypted_value {
            Some(blob) => blob.clone(),
            None => panic!("expected encrypted blob"),
        };
        assert_ne!(blob, serde_json::to_vec(&json!("hidden")).unwrap_or_default());
        assert_eq!(codec.decrypt(&blob), json!("hidden"));
    }

    #[test]
    fn constraints_record_rejects_mismatched_bounds() {
        let constraints = QuestionConstraints {
            number: Some(NumberBounds::default()),
            ..QuestionConstraints::default()
        };
        assert!(constraints.validate_for(QuestionType::Number).is_ok());
        assert!(constraints.validate_for(QuestionType::Text).is_err());
    }

    #[test]
    fn condition_rule_accepts_both_equality_spellings() {
        let single: ConditionRule = match serde_json::from_value(
            json!({"question_code": "q", "operator": "=", "value": "x"}),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to decode '=': {err}"),
        };
        let double: ConditionRule = match serde_json::from_value(
            json!({"question_code": "q", "operator": "==", "value": "x"}),
        ) {
            Ok(value) => value,
            Err(err) => panic!("failed to decode '==': {err}"),
        };
        assert_eq!(single.operator, CompareOp::Eq);
        assert_eq!(double.operator, CompareOp::Eq);
    }
}
