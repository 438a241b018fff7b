#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use survey_core::{
    format_iso_date, format_rfc3339, now_utc, parse_rfc3339_utc, prepare_answers, AnswerCodec,
    AnswerId, InvitationId, InvitationStatus, OptionId, QuestionConstraints, QuestionDef,
    QuestionId, QuestionType, ResponseId, ResponseStatus, SectionId, SessionId, SessionStatus,
    SurveyError, SurveyId, SurveySchema, SurveyStatus,
};
use time::OffsetDateTime;
use ulid::Ulid;

const SURVEY_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SURVEY_V1: &str = r"
CREATE TABLE IF NOT EXISTS surveys (
  survey_id TEXT PRIMARY KEY,
  code TEXT NOT NULL UNIQUE,
  title TEXT NOT NULL,
  description TEXT,
  status TEXT NOT NULL CHECK (status IN ('draft', 'active', 'archived')),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_surveys_status ON surveys(status);

CREATE TABLE IF NOT EXISTS survey_sections (
  section_id TEXT PRIMARY KEY,
  survey_id TEXT NOT NULL REFERENCES surveys(survey_id),
  title TEXT NOT NULL,
  description TEXT,
  sort_order INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (survey_id, sort_order)
);

CREATE TABLE IF NOT EXISTS survey_questions (
  question_id TEXT PRIMARY KEY,
  section_id TEXT NOT NULL REFERENCES survey_sections(section_id),
  code TEXT NOT NULL,
  prompt TEXT NOT NULL,
  help_text TEXT,
  question_type TEXT NOT NULL CHECK (
    question_type IN ('text', 'number', 'date', 'dropdown', 'checkbox', 'radio')
  ),
  required INTEGER NOT NULL DEFAULT 0 CHECK (required IN (0, 1)),
  sensitive INTEGER NOT NULL DEFAULT 0 CHECK (sensitive IN (0, 1)),
  constraints_json TEXT NOT NULL DEFAULT '{}',
  sort_order INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (section_id, code),
  UNIQUE (section_id, sort_order)
);

CREATE TABLE IF NOT EXISTS survey_question_options (
  option_id TEXT PRIMARY KEY,
  question_id TEXT NOT NULL REFERENCES survey_questions(question_id),
  value TEXT NOT NULL,
  label TEXT NOT NULL,
  sort_order INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (question_id, sort_order)
);

CREATE TABLE IF NOT EXISTS survey_invitations (
  invitation_id TEXT PRIMARY KEY,
  survey_id TEXT NOT NULL REFERENCES surveys(survey_id),
  token TEXT NOT NULL UNIQUE,
  email TEXT NOT NULL,
  expires_at TEXT,
  status TEXT NOT NULL CHECK (status IN ('pending', 'submitted', 'expired')),
  response_id TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_invitations_survey ON survey_invitations(survey_id, status);

CREATE TABLE IF NOT EXISTS survey_sessions (
  session_id TEXT PRIMARY KEY,
  survey_id TEXT NOT NULL REFERENCES surveys(survey_id),
  status TEXT NOT NULL CHECK (status IN ('in_progress', 'completed', 'abandoned')),
  partial_payload TEXT NOT NULL DEFAULT '{}',
  last_step INTEGER,
  invitation_token TEXT,
  invited_email TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_survey ON survey_sessions(survey_id, status);

CREATE TABLE IF NOT EXISTS survey_responses (
  response_id TEXT PRIMARY KEY,
  survey_id TEXT NOT NULL REFERENCES surveys(survey_id),
  session_id TEXT REFERENCES survey_sessions(session_id),
  respondent_email TEXT,
  status TEXT NOT NULL CHECK (status IN ('submitted', 'revised', 'deleted')),
  submitted_at TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_responses_survey_time
  ON survey_responses(survey_id, submitted_at DESC);

CREATE TABLE IF NOT EXISTS survey_answers (
  answer_id TEXT PRIMARY KEY,
  response_id TEXT NOT NULL REFERENCES survey_responses(response_id),
  question_id TEXT NOT NULL REFERENCES survey_questions(question_id),
  value_text TEXT,
  value_number TEXT,
  value_boolean INTEGER CHECK (value_boolean IN (0, 1) OR value_boolean IS NULL),
  value_date TEXT,
  value_timestamp TEXT,
  encrypted_value BLOB,
  created_at TEXT NOT NULL,
  UNIQUE (response_id, question_id)
);

CREATE INDEX IF NOT EXISTS idx_answers_question ON survey_answers(question_id);
";

pub struct SqliteSurveyStore {
    conn: Connection,
    codec: AnswerCodec,
}

// ---- boundary records ----------------------------------------------------

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SurveyRecord {
    pub survey_id: SurveyId,
    pub code: String,
    pub title: String,
    pub description: Option<String>,
    pub status: SurveyStatus,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SectionRecord {
    pub section_id: SectionId,
    pub survey_id: SurveyId,
    pub title: String,
    pub description: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct QuestionRecord {
    pub question_id: QuestionId,
    pub section_id: SectionId,
    pub code: String,
    pub prompt: String,
    pub help_text: Option<String>,
    pub question_type: QuestionType,
    pub required: bool,
    pub sensitive: bool,
    pub constraints: QuestionConstraints,
    pub sort_order: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct OptionRecord {
    pub option_id: OptionId,
    pub question_id: QuestionId,
    pub value: String,
    pub label: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct InvitationRecord {
    pub invitation_id: InvitationId,
    pub survey_id: SurveyId,
    pub token: String,
    pub email: String,
    pub expires_at: Option<String>,
    pub status: InvitationStatus,
    pub response_id: Option<ResponseId>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub survey_id: SurveyId,
    pub status: SessionStatus,
    pub partial_payload: Map<String, Value>,
    pub last_step: Option<i64>,
    pub invitation_token: Option<String>,
    pub invited_email: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct AnswerRecord {
    pub answer_id: AnswerId,
    pub question_id: QuestionId,
    pub question_code: String,
    pub value: Value,
    pub encrypted: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ResponseRecord {
    pub response_id: ResponseId,
    pub survey_id: SurveyId,
    pub session_id: Option<SessionId>,
    pub respondent_email: Option<String>,
    pub status: ResponseStatus,
    pub submitted_at: String,
    pub answers: Vec<AnswerRecord>,
}

/// Authoring input for one question.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct NewQuestion {
    pub code: String,
    pub prompt: String,
    pub help_text: Option<String>,
    pub question_type: QuestionType,
    pub required: bool,
    pub sensitive: bool,
    pub constraints: Value,
    pub sort_order: i64,
}

impl SqliteSurveyStore {
    pub fn open(path: &Path, codec: AnswerCodec) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, codec })
    }

    pub fn open_in_memory(codec: AnswerCodec) -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to configure sqlite pragmas")?;
        Ok(Self { conn, codec })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SURVEY_V1)
            .context("failed to apply survey schema")?;

        let now = now_str()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SURVEY_MIGRATION_VERSION, now],
            )
            .context("failed to register survey schema migration")?;

        Ok(())
    }

    // ---- authoring writes ------------------------------------------------

    pub fn create_survey(
        &self,
        code: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<SurveyRecord> {
        if code.trim().is_empty() {
            return Err(SurveyError::Validation("survey code must not be empty".to_string()).into());
        }
        let survey_id = SurveyId::new();
        let now = now_str()?;
        self.conn
            .execute(
                "INSERT INTO surveys(survey_id, code, title, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    survey_id.to_string(),
                    code,
                    title,
                    description,
                    SurveyStatus::Draft.as_str(),
                    now,
                ],
            )
            .context("failed to insert survey")?;
        self.get_survey(survey_id)
    }

    pub fn set_survey_status(&self, survey_id: SurveyId, status: SurveyStatus) -> Result<SurveyRecord> {
        let now = now_str()?;
        let changed = self
            .conn
            .execute(
                "UPDATE surveys SET status = ?1, updated_at = ?2 WHERE survey_id = ?3",
                params![status.as_str(), now, survey_id.to_string()],
            )
            .context("failed to update survey status")?;
        if changed == 0 {
            return Err(SurveyError::NotFound(format!("survey {survey_id}")).into());
        }
        self.get_survey(survey_id)
    }

    pub fn get_survey(&self, survey_id: SurveyId) -> Result<SurveyRecord> {
        let record = self
            .conn
            .query_row(
                "SELECT survey_id, code, title, description, status, created_at, updated_at
                 FROM surveys WHERE survey_id = ?1",
                params![survey_id.to_string()],
                parse_survey_row,
            )
            .optional()
            .context("failed to load survey")?;
        record.ok_or_else(|| SurveyError::NotFound(format!("survey {survey_id}")).into())
    }

    pub fn add_section(
        &self,
        survey_id: SurveyId,
        title: &str,
        description: Option<&str>,
        sort_order: i64,
    ) -> Result<SectionRecord> {
        let _ = self.get_survey(survey_id)?;
        let section_id = SectionId::new();
        let now = now_str()?;
        self.conn
            .execute(
                "INSERT INTO survey_sections(section_id, survey_id, title, description, sort_order, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                params![
                    section_id.to_string(),
                    survey_id.to_string(),
                    title,
                    description,
                    sort_order,
                    now,
                ],
            )
            .context("failed to insert section")?;
        Ok(SectionRecord {
            section_id,
            survey_id,
            title: title.to_string(),
            description: description.map(str::to_string),
            sort_order,
        })
    }

    pub fn add_question(&self, section_id: SectionId, input: &NewQuestion) -> Result<QuestionRecord> {
        if input.code.trim().is_empty() {
            return Err(SurveyError::Validation("question code must not be empty".to_string()).into());
        }
        // Constraint documents are validated against the question type at
        // authoring time, never at submission time.
        let constraints = QuestionConstraints::from_json(&input.constraints, input.question_type)
            .map_err(anyhow::Error::from)?;

        let question_id = QuestionId::new();
        let now = now_str()?;
        let constraints_json =
            serde_json::to_string(&constraints).context("failed to serialize constraints")?;
        self.conn
            .execute(
                "INSERT INTO survey_questions(
                    question_id, section_id, code, prompt, help_text, question_type,
                    required, sensitive, constraints_json, sort_order, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    question_id.to_string(),
                    section_id.to_string(),
                    input.code,
                    input.prompt,
                    input.help_text,
                    input.question_type.as_str(),
                    i64::from(input.required),
                    i64::from(input.sensitive),
                    constraints_json,
                    input.sort_order,
                    now,
                ],
            )
            .context("failed to insert question")?;

        Ok(QuestionRecord {
            question_id,
            section_id,
            code: input.code.clone(),
            prompt: input.prompt.clone(),
            help_text: input.help_text.clone(),
            question_type: input.question_type,
            required: input.required,
            sensitive: input.sensitive,
            constraints,
            sort_order: input.sort_order,
        })
    }

    pub fn add_option(
        &self,
        question_id: QuestionId,
        value: &str,
        label: &str,
        sort_order: i64,
    ) -> Result<OptionRecord> {
        let option_id = OptionId::new();
        let now = now_str()?;
        self.conn
            .execute(
                "INSERT INTO survey_question_options(option_id, question_id, value, label, sort_order, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    option_id.to_string(),
                    question_id.to_string(),
                    value,
                    label,
                    sort_order,
                    now,
                ],
            )
            .context("failed to insert question option")?;
        Ok(OptionRecord {
            option_id,
            question_id,
            value: value.to_string(),
            label: label.to_string(),
            sort_order,
        })
    }

    // ---- invitations -----------------------------------------------------

    pub fn create_invitation(
        &self,
        survey_id: SurveyId,
        email: &str,
        expires_at: Option<OffsetDateTime>,
    ) -> Result<InvitationRecord> {
        let survey = self.get_survey(survey_id)?;
        if survey.status != SurveyStatus::Active {
            return Err(SurveyError::Validation(
                "invitations can only be issued for active surveys".to_string(),
            )
            .into());
        }

        let invitation_id = InvitationId::new();
        let token = Ulid::new().to_string();
        let now = now_str()?;
        let expires = match expires_at {
            Some(value) => Some(format_rfc3339(value).map_err(anyhow::Error::from)?),
            None => None,
        };
        self.conn
            .execute(
                "INSERT INTO survey_invitations(invitation_id, survey_id, token, email, expires_at, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    invitation_id.to_string(),
                    survey_id.to_string(),
                    token,
                    email,
                    expires,
                    InvitationStatus::Pending.as_str(),
                    now,
                ],
            )
            .context("failed to insert invitation")?;

        Ok(InvitationRecord {
            invitation_id,
            survey_id,
            token,
            email: email.to_string(),
            expires_at: expires,
            status: InvitationStatus::Pending,
            response_id: None,
        })
    }

    pub fn get_invitation_by_token(&self, token: &str) -> Result<Option<InvitationRecord>> {
        self.conn
            .query_row(
                "SELECT invitation_id, survey_id, token, email, expires_at, status, response_id
                 FROM survey_invitations WHERE token = ?1",
                params![token],
                parse_invitation_row,
            )
            .optional()
            .context("failed to load invitation")
    }

    /// Marks pending invitations past their expiry as `expired`.
    /// Returns the number of invitations transitioned.
    ///
    /// Expiries are parsed and compared as timestamps; RFC3339 strings
    /// with mixed subsecond precision do not order lexically.
    pub fn expire_overdue_invitations(&self, now: OffsetDateTime) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT invitation_id, expires_at FROM survey_invitations
                 WHERE status = 'pending' AND expires_at IS NOT NULL",
            )
            .context("failed to prepare expiry sweep")?;
        let rows = stmt
            .query_map([], |row| {
                let invitation_id: String = row.get(0)?;
                let expires_at: String = row.get(1)?;
                Ok((invitation_id, expires_at))
            })
            .context("failed to query pending invitations")?;

        let mut overdue = Vec::new();
        for row in rows {
            let (invitation_id, expires_raw) = row.context("failed to read pending invitation")?;
            let expires = parse_rfc3339_utc(&expires_raw)
                .map_err(|err| anyhow!("invalid stored expiry for {invitation_id}: {err}"))?;
            if expires < now {
                overdue.push(invitation_id);
            }
        }

        let updated_at = now_str()?;
        let mut changed = 0;
        for invitation_id in &overdue {
            changed += self
                .conn
                .execute(
                    "UPDATE survey_invitations
                     SET status = 'expired', updated_at = ?1
                     WHERE invitation_id = ?2 AND status = 'pending'",
                    params![updated_at, invitation_id],
                )
                .context("failed to expire overdue invitation")?;
        }
        Ok(changed)
    }

    // ---- sessions --------------------------------------------------------

    pub fn start_session(&self, survey_id: SurveyId, token: Option<&str>) -> Result<SessionRecord> {
        let survey = self.get_survey(survey_id)?;
        if survey.status != SurveyStatus::Active {
            return Err(SurveyError::Validation(
                "survey is not accepting submissions".to_string(),
            )
            .into());
        }

        let mut invited_email = None;
        let token = token.map(str::trim).filter(|value| !value.is_empty());
        if let Some(token) = token {
            let Some(invitation) = self.get_invitation_by_token(token)? else {
                return Err(SurveyError::Validation("Invalid invitation".to_string()).into());
            };
            if invitation.survey_id != survey_id {
                return Err(SurveyError::Validation("Invalid invitation".to_string()).into());
            }
            if invitation.status == InvitationStatus::Submitted {
                return Err(SurveyError::Validation("Invitation already used".to_string()).into());
            }
            if invitation_expired(&invitation, now_utc())? {
                return Err(SurveyError::Validation("Invitation expired".to_string()).into());
            }
            invited_email = Some(invitation.email);
        }

        let session_id = SessionId::new();
        let now = now_str()?;
        self.conn
            .execute(
                "INSERT INTO survey_sessions(session_id, survey_id, status, partial_payload, invitation_token, invited_email, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '{}', ?4, ?5, ?6, ?6)",
                params![
                    session_id.to_string(),
                    survey_id.to_string(),
                    SessionStatus::InProgress.as_str(),
                    token,
                    invited_email,
                    now,
                ],
            )
            .context("failed to insert session")?;
        self.get_session(session_id)
    }

    pub fn get_session(&self, session_id: SessionId) -> Result<SessionRecord> {
        let record = self
            .conn
            .query_row(
                "SELECT session_id, survey_id, status, partial_payload, last_step, invitation_token, invited_email
                 FROM survey_sessions WHERE session_id = ?1",
                params![session_id.to_string()],
                parse_session_row,
            )
            .optional()
            .context("failed to load session")?;
        record.ok_or_else(|| SurveyError::NotFound(format!("session {session_id}")).into())
    }

    /// Merges `payload` key-by-key into the stored draft and keeps the
    /// session in progress.
    pub fn autosave_session(
        &self,
        session_id: SessionId,
        payload: &Map<String, Value>,
        last_step: Option<i64>,
    ) -> Result<SessionRecord> {
        let session = self.get_session(session_id)?;
        let mut merged = session.partial_payload;
        for (code, value) in payload {
            merged.insert(code.clone(), value.clone());
        }
        let serialized =
            serde_json::to_string(&merged).context("failed to serialize partial payload")?;
        let now = now_str()?;
        self.conn
            .execute(
                "UPDATE survey_sessions
                 SET partial_payload = ?1,
                     last_step = COALESCE(?2, last_step),
                     status = ?3,
                     updated_at = ?4
                 WHERE session_id = ?5",
                params![
                    serialized,
                    last_step,
                    SessionStatus::InProgress.as_str(),
                    now,
                    session_id.to_string(),
                ],
            )
            .context("failed to autosave session")?;
        self.get_session(session_id)
    }

    pub fn abandon_session(&self, session_id: SessionId) -> Result<SessionRecord> {
        let _ = self.get_session(session_id)?;
        let now = now_str()?;
        self.conn
            .execute(
                "UPDATE survey_sessions SET status = ?1, updated_at = ?2 WHERE session_id = ?3",
                params![SessionStatus::Abandoned.as_str(), now, session_id.to_string()],
            )
            .context("failed to abandon session")?;
        self.get_session(session_id)
    }

    // ---- submission orchestrator ----------------------------------------

    /// Submits using an existing session: merges `extra_answers` over the
    /// autosaved draft (extras win key-by-key) and runs the shared
    /// submission core with the session attached.
    pub fn submit_from_session(
        &mut self,
        session_id: SessionId,
        extra_answers: Option<&BTreeMap<String, Value>>,
    ) -> Result<ResponseRecord> {
        let session = self.get_session(session_id)?;
        if session.status == SessionStatus::Abandoned {
            return Err(SurveyError::Validation("Session abandoned".to_string()).into());
        }

        let mut answers: BTreeMap<String, Value> = session
            .partial_payload
            .iter()
            .map(|(code, value)| (code.clone(), value.clone()))
            .collect();
        if let Some(extra) = extra_answers {
            for (code, value) in extra {
                answers.insert(code.clone(), value.clone());
            }
        }

        let survey_id = session.survey_id;
        self.submit(survey_id, &answers, Some(&session))
    }

    /// Submits directly against a survey with no session attached.
    pub fn submit_direct(
        &mut self,
        survey_id: SurveyId,
        answers: &BTreeMap<String, Value>,
    ) -> Result<ResponseRecord> {
        let survey = self.get_survey(survey_id)?;
        if survey.status != SurveyStatus::Active {
            return Err(SurveyError::Validation(
                "survey is not accepting submissions".to_string(),
            )
            .into());
        }
        self.submit(survey_id, answers, None)
    }

    /// Shared submission core. All writes happen in one immediate
    /// transaction: any failure rolls back the response, its answers and
    /// the invitation/session transitions together.
    fn submit(
        &mut self,
        survey_id: SurveyId,
        answers: &BTreeMap<String, Value>,
        session: Option<&SessionRecord>,
    ) -> Result<ResponseRecord> {
        if answers.is_empty() {
            return Err(SurveyError::Validation("No answers to submit".to_string()).into());
        }

        let codec = self.codec.clone();
        let response_id = ResponseId::new();
        let now = now_utc();
        let now_text = format_rfc3339(now).map_err(anyhow::Error::from)?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start submission transaction")?;

        let schema = build_schema(&tx, survey_id)?;

        let invitation_token = session.and_then(|value| value.invitation_token.as_deref());
        if let Some(token) = invitation_token {
            let invitation = tx
                .query_row(
                    "SELECT invitation_id, survey_id, token, email, expires_at, status, response_id
                     FROM survey_invitations WHERE token = ?1 AND survey_id = ?2",
                    params![token, survey_id.to_string()],
                    parse_invitation_row,
                )
                .optional()
                .context("failed to load invitation for submission")?;
            if let Some(invitation) = invitation {
                if invitation_expired(&invitation, now)? {
                    return Err(
                        SurveyError::Validation("This invitation has expired".to_string()).into(),
                    );
                }
                if invitation.status == InvitationStatus::Submitted {
                    return Err(SurveyError::Validation(
                        "You have already submitted this survey".to_string(),
                    )
                    .into());
                }
            }
        }

        tx.execute(
            "INSERT INTO survey_responses(response_id, survey_id, session_id, respondent_email, status, submitted_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                response_id.to_string(),
                survey_id.to_string(),
                session.map(|value| value.session_id.to_string()),
                session.and_then(|value| value.invited_email.clone()),
                ResponseStatus::Submitted.as_str(),
                now_text,
            ],
        )
        .context("failed to insert response")?;

        let prepared = prepare_answers(&schema, answers, &codec).map_err(anyhow::Error::from)?;
        if prepared.is_empty() {
            // Every provided code may have been unknown.
            return Err(SurveyError::Validation("No valid answers to submit".to_string()).into());
        }

        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO survey_answers(
                        answer_id, response_id, question_id, value_text, value_number,
                        value_boolean, value_date, value_timestamp, encrypted_value, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .context("failed to prepare answer insert")?;
            for answer in &prepared {
                let value_date = match answer.value_date {
                    Some(date) => Some(format_iso_date(date).map_err(anyhow::Error::from)?),
                    None => None,
                };
                let value_timestamp = match answer.value_timestamp {
                    Some(stamp) => Some(format_rfc3339(stamp).map_err(anyhow::Error::from)?),
                    None => None,
                };
                insert
                    .execute(params![
                        AnswerId::new().to_string(),
                        response_id.to_string(),
                        answer.question_id.to_string(),
                        answer.value_text,
                        answer.value_number.map(|number| number.to_string()),
                        answer.value_boolean.map(i64::from),
                        value_date,
                        value_timestamp,
                        answer.encrypted_value,
                        now_text,
                    ])
                    .with_context(|| {
                        format!("failed to insert answer for {}", answer.question_code)
                    })?;
            }
        }

        if let Some(token) = invitation_token {
            // Conditional update keeps the invitation transition
            // at-most-once even with racing submissions on one token.
            tx.execute(
                "UPDATE survey_invitations
                 SET status = 'submitted', response_id = ?1, updated_at = ?2
                 WHERE token = ?3 AND survey_id = ?4 AND status != 'submitted'",
                params![response_id.to_string(), now_text, token, survey_id.to_string()],
            )
            .context("failed to mark invitation submitted")?;
        }

        if let Some(session) = session {
            tx.execute(
                "UPDATE survey_sessions
                 SET status = 'completed', updated_at = ?1
                 WHERE session_id = ?2 AND status != 'completed'",
                params![now_text, session.session_id.to_string()],
            )
            .context("failed to mark session completed")?;
        }

        tx.commit().context("failed to commit submission")?;

        self.get_response(response_id)
    }

    // ---- read paths ------------------------------------------------------

    pub fn get_response(&self, response_id: ResponseId) -> Result<ResponseRecord> {
        let header = self
            .conn
            .query_row(
                "SELECT response_id, survey_id, session_id, respondent_email, status, submitted_at
                 FROM survey_responses WHERE response_id = ?1",
                params![response_id.to_string()],
                parse_response_row,
            )
            .optional()
            .context("failed to load response")?;
        let mut response = header
            .ok_or_else(|| anyhow::Error::from(SurveyError::NotFound(format!("response {response_id}"))))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.answer_id, a.question_id, q.code, a.value_text, a.value_number,
                        a.value_boolean, a.value_date, a.value_timestamp, a.encrypted_value
                 FROM survey_answers a
                 JOIN survey_questions q ON q.question_id = a.question_id
                 WHERE a.response_id = ?1
                 ORDER BY a.answer_id ASC",
            )
            .context("failed to prepare answer query")?;
        let rows = stmt
            .query_map(params![response_id.to_string()], parse_answer_row)
            .context("failed to query answers")?;

        for row in rows {
            let raw = row.context("failed to read answer row")?;
            response.answers.push(resolve_answer(raw, &self.codec));
        }

        Ok(response)
    }

    pub fn list_responses(&self, survey_id: SurveyId) -> Result<Vec<ResponseRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT response_id, survey_id, session_id, respondent_email, status, submitted_at
                 FROM survey_responses WHERE survey_id = ?1
                 ORDER BY submitted_at DESC, response_id DESC",
            )
            .context("failed to prepare response query")?;
        let rows = stmt
            .query_map(params![survey_id.to_string()], parse_response_row)
            .context("failed to query responses")?;

        let mut headers = Vec::new();
        for row in rows {
            headers.push(row.context("failed to read response row")?);
        }

        let mut out = Vec::with_capacity(headers.len());
        for header in headers {
            out.push(self.get_response(header.response_id)?);
        }
        Ok(out)
    }
}

// ---- schema index prefetch -----------------------------------------------

/// Builds the per-submission schema snapshot from one prefetch of
/// sections, questions and options, ordered by sort keys.
fn build_schema(conn: &Connection, survey_id: SurveyId) -> Result<SurveySchema> {
    let mut questions = conn
        .prepare(
            "SELECT q.question_id, q.code, q.prompt, q.question_type, q.required, q.sensitive, q.constraints_json
             FROM survey_questions q
             JOIN survey_sections s ON s.section_id = q.section_id
             WHERE s.survey_id = ?1
             ORDER BY s.sort_order ASC, q.sort_order ASC",
        )
        .context("failed to prepare schema query")?;
    let question_rows = questions
        .query_map(params![survey_id.to_string()], parse_question_def_row)
        .context("failed to query schema questions")?;

    let mut defs = Vec::new();
    for row in question_rows {
        defs.push(row.context("failed to read schema question row")?);
    }

    let mut options = conn
        .prepare(
            "SELECT o.question_id, o.value
             FROM survey_question_options o
             JOIN survey_questions q ON q.question_id = o.question_id
             JOIN survey_sections s ON s.section_id = q.section_id
             WHERE s.survey_id = ?1
             ORDER BY o.sort_order ASC",
        )
        .context("failed to prepare option query")?;
    let option_rows = options
        .query_map(params![survey_id.to_string()], |row| {
            let question_id: String = row.get(0)?;
            let value: String = row.get(1)?;
            Ok((question_id, value))
        })
        .context("failed to query schema options")?;

    let mut options_by_question: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in option_rows {
        let (question_id, value) = row.context("failed to read option row")?;
        options_by_question.entry(question_id).or_default().push(value);
    }

    let mut schema = SurveySchema::new();
    for def in defs {
        let values = options_by_question
            .remove(&def.id.to_string())
            .unwrap_or_default();
        schema.insert_question(def, values);
    }
    Ok(schema)
}

// ---- row parsing ---------------------------------------------------------

fn invalid_column(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ulid_column<T>(index: usize, raw: &str, wrap: fn(Ulid) -> T) -> Result<T, rusqlite::Error> {
    Ulid::from_string(raw)
        .map(wrap)
        .map_err(|err| invalid_column(index, format!("invalid id '{raw}': {err}")))
}

fn parse_survey_row(row: &rusqlite::Row<'_>) -> Result<SurveyRecord, rusqlite::Error> {
    let survey_id_raw: String = row.get(0)?;
    let status_raw: String = row.get(4)?;
    Ok(SurveyRecord {
        survey_id: parse_ulid_column(0, &survey_id_raw, SurveyId)?,
        code: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: SurveyStatus::parse(&status_raw)
            .ok_or_else(|| invalid_column(4, format!("invalid survey status '{status_raw}'")))?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn parse_invitation_row(row: &rusqlite::Row<'_>) -> Result<InvitationRecord, rusqlite::Error> {
    let invitation_id_raw: String = row.get(0)?;
    let survey_id_raw: String = row.get(1)?;
    let status_raw: String = row.get(5)?;
    let response_id_raw: Option<String> = row.get(6)?;
    let response_id = match response_id_raw {
        Some(raw) => Some(parse_ulid_column(6, &raw, ResponseId)?),
        None => None,
    };
    Ok(InvitationRecord {
        invitation_id: parse_ulid_column(0, &invitation_id_raw, InvitationId)?,
        survey_id: parse_ulid_column(1, &survey_id_raw, SurveyId)?,
        token: row.get(2)?,
        email: row.get(3)?,
        expires_at: row.get(4)?,
        status: InvitationStatus::parse(&status_raw)
            .ok_or_else(|| invalid_column(5, format!("invalid invitation status '{status_raw}'")))?,
        response_id,
    })
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> Result<SessionRecord, rusqlite::Error> {
    let session_id_raw: String = row.get(0)?;
    let survey_id_raw: String = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let payload_raw: String = row.get(3)?;
    let payload: Value = serde_json::from_str(&payload_raw)
        .map_err(|err| invalid_column(3, format!("invalid partial payload: {err}")))?;
    let partial_payload = match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(SessionRecord {
        session_id: parse_ulid_column(0, &session_id_raw, SessionId)?,
        survey_id: parse_ulid_column(1, &survey_id_raw, SurveyId)?,
        status: SessionStatus::parse(&status_raw)
            .ok_or_else(|| invalid_column(2, format!("invalid session status '{status_raw}'")))?,
        partial_payload,
        last_step: row.get(4)?,
        invitation_token: row.get(5)?,
        invited_email: row.get(6)?,
    })
}

fn parse_question_def_row(row: &rusqlite::Row<'_>) -> Result<QuestionDef, rusqlite::Error> {
    let question_id_raw: String = row.get(0)?;
    let type_raw: String = row.get(3)?;
    let required: i64 = row.get(4)?;
    let sensitive: i64 = row.get(5)?;
    let constraints_raw: String = row.get(6)?;
    let constraints: QuestionConstraints = serde_json::from_str(&constraints_raw)
        .map_err(|err| invalid_column(6, format!("invalid stored constraints: {err}")))?;
    Ok(QuestionDef {
        id: parse_ulid_column(0, &question_id_raw, QuestionId)?,
        code: row.get(1)?,
        prompt: row.get(2)?,
        question_type: QuestionType::parse(&type_raw)
            .ok_or_else(|| invalid_column(3, format!("invalid question type '{type_raw}'")))?,
        required: required != 0,
        sensitive: sensitive != 0,
        constraints,
    })
}

fn parse_response_row(row: &rusqlite::Row<'_>) -> Result<ResponseRecord, rusqlite::Error> {
    let response_id_raw: String = row.get(0)?;
    let survey_id_raw: String = row.get(1)?;
    let session_id_raw: Option<String> = row.get(2)?;
    let status_raw: String = row.get(4)?;
    let session_id = match session_id_raw {
        Some(raw) => Some(parse_ulid_column(2, &raw, SessionId)?),
        None => None,
    };
    Ok(ResponseRecord {
        response_id: parse_ulid_column(0, &response_id_raw, ResponseId)?,
        survey_id: parse_ulid_column(1, &survey_id_raw, SurveyId)?,
        session_id,
        respondent_email: row.get(3)?,
        status: ResponseStatus::parse(&status_raw)
            .ok_or_else(|| invalid_column(4, format!("invalid response status '{status_raw}'")))?,
        submitted_at: row.get(5)?,
        answers: Vec::new(),
    })
}

struct RawAnswerRow {
    answer_id: AnswerId,
    question_id: QuestionId,
    question_code: String,
    value_text: Option<String>,
    value_number: Option<String>,
    value_boolean: Option<i64>,
    value_date: Option<String>,
    value_timestamp: Option<String>,
    encrypted_value: Option<Vec<u8>>,
}

fn parse_answer_row(row: &rusqlite::Row<'_>) -> Result<RawAnswerRow, rusqlite::Error> {
    let answer_id_raw: String = row.get(0)?;
    let question_id_raw: String = row.get(1)?;
    Ok(RawAnswerRow {
        answer_id: parse_ulid_column(0, &answer_id_raw, AnswerId)?,
        question_id: parse_ulid_column(1, &question_id_raw, QuestionId)?,
        question_code: row.get(2)?,
        value_text: row.get(3)?,
        value_number: row.get(4)?,
        value_boolean: row.get(5)?,
        value_date: row.get(6)?,
        value_timestamp: row.get(7)?,
        encrypted_value: row.get(8)?,
    })
}

/// Resolves one stored answer into its boundary value: encrypted blobs
/// go through the decrypt path (degrading to null, never raising), typed
/// columns become JSON values.
fn resolve_answer(raw: RawAnswerRow, codec: &AnswerCodec) -> AnswerRecord {
    let (value, encrypted) = if let Some(blob) = &raw.encrypted_value {
        (codec.decrypt(blob), true)
    } else if let Some(text) = raw.value_text {
        (Value::String(text), false)
    } else if let Some(number) = raw.value_number {
        // Stored as exact decimal text; surfaced as a string to avoid
        // float rounding at the boundary.
        let rendered = Decimal::from_str(&number)
            .map(|decimal| decimal.to_string())
            .unwrap_or(number);
        (Value::String(rendered), false)
    } else if let Some(flag) = raw.value_boolean {
        (Value::Bool(flag != 0), false)
    } else if let Some(date) = raw.value_date {
        (Value::String(date), false)
    } else if let Some(stamp) = raw.value_timestamp {
        (Value::String(stamp), false)
    } else {
        (Value::Null, false)
    };

    AnswerRecord {
        answer_id: raw.answer_id,
        question_id: raw.question_id,
        question_code: raw.question_code,
        value,
        encrypted,
    }
}

fn invitation_expired(invitation: &InvitationRecord, now: OffsetDateTime) -> Result<bool> {
    match invitation.expires_at.as_deref() {
        Some(raw) => {
            let expires = parse_rfc3339_utc(raw)
                .map_err(|err| anyhow!("invalid stored expiry for {}: {err}", invitation.token))?;
            Ok(invitation.status == InvitationStatus::Expired || expires < now)
        }
        None => Ok(invitation.status == InvitationStatus::Expired),
    }
}

fn now_str() -> Result<String> {
    format_rfc3339(now_utc()).map_err(anyhow::Error::from)
}
