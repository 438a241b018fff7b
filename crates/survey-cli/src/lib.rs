//! Command surface for the survey backend.
//!
//! Every command prints a JSON document on stdout so scripts can pipe
//! output straight into `jq`. Failures go to stderr with a non-zero
//! exit code.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value};
use survey_core::{
    parse_rfc3339_utc, now_utc, AnswerCodec, QuestionId, QuestionType, ResponseId, SectionId,
    SessionId, SurveyId, SurveyStatus,
};
use survey_store_sqlite::{NewQuestion, SqliteSurveyStore};

#[derive(Debug, Parser)]
#[command(name = "svy")]
#[command(about = "Survey authoring and response collection CLI")]
pub struct Cli {
    #[arg(long, default_value = "./survey_backend.sqlite3")]
    db: PathBuf,

    /// Secret for sensitive-answer encryption; falls back to the
    /// SURVEY_ENCRYPTION_SECRET environment variable.
    #[arg(long, env = "SURVEY_ENCRYPTION_SECRET")]
    encryption_secret: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending database migrations.
    Migrate,
    Survey {
        #[command(subcommand)]
        command: SurveyCommand,
    },
    Section {
        #[command(subcommand)]
        command: SectionCommand,
    },
    Question {
        #[command(subcommand)]
        command: Box<QuestionCommand>,
    },
    Option {
        #[command(subcommand)]
        command: OptionCommand,
    },
    Invitation {
        #[command(subcommand)]
        command: InvitationCommand,
    },
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    Submit {
        #[command(subcommand)]
        command: SubmitCommand,
    },
    Response {
        #[command(subcommand)]
        command: ResponseCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SurveyCommand {
    Create(SurveyCreateArgs),
    Activate(SurveyIdArg),
    Archive(SurveyIdArg),
    Show(SurveyIdArg),
}

#[derive(Debug, Args)]
pub struct SurveyCreateArgs {
    #[arg(long)]
    code: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Debug, Args)]
pub struct SurveyIdArg {
    #[arg(long)]
    survey_id: String,
}

#[derive(Debug, Subcommand)]
pub enum SectionCommand {
    Add(SectionAddArgs),
}

#[derive(Debug, Args)]
pub struct SectionAddArgs {
    #[arg(long)]
    survey_id: String,
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, default_value_t = 0)]
    sort_order: i64,
}

#[derive(Debug, Subcommand)]
pub enum QuestionCommand {
    Add(QuestionAddArgs),
}

#[derive(Debug, Args)]
pub struct QuestionAddArgs {
    #[arg(long)]
    section_id: String,
    #[arg(long)]
    code: String,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    help_text: Option<String>,
    #[arg(long, value_enum)]
    question_type: QuestionTypeArg,
    #[arg(long)]
    required: bool,
    #[arg(long)]
    sensitive: bool,
    /// Structured constraint record as a JSON object.
    #[arg(long, default_value = "{}")]
    constraints_json: String,
    #[arg(long, default_value_t = 0)]
    sort_order: i64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QuestionTypeArg {
    Text,
    Number,
    Date,
    Dropdown,
    Checkbox,
    Radio,
}

#[derive(Debug, Subcommand)]
pub enum OptionCommand {
    Add(OptionAddArgs),
}

#[derive(Debug, Args)]
pub struct OptionAddArgs {
    #[arg(long)]
    question_id: String,
    #[arg(long)]
    value: String,
    #[arg(long)]
    label: String,
    #[arg(long, default_value_t = 0)]
    sort_order: i64,
}

#[derive(Debug, Subcommand)]
pub enum InvitationCommand {
    Create(InvitationCreateArgs),
    /// Mark invitations whose deadline has passed as expired.
    ExpireOverdue,
}

#[derive(Debug, Args)]
pub struct InvitationCreateArgs {
    #[arg(long)]
    survey_id: String,
    #[arg(long)]
    email: String,
    /// RFC 3339 UTC deadline after which the token stops working.
    #[arg(long)]
    expires_at: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    Start(SessionStartArgs),
    Autosave(SessionAutosaveArgs),
    Show(SessionIdArg),
    Abandon(SessionIdArg),
}

#[derive(Debug, Args)]
pub struct SessionStartArgs {
    #[arg(long)]
    survey_id: String,
    #[arg(long)]
    token: Option<String>,
}

#[derive(Debug, Args)]
pub struct SessionAutosaveArgs {
    #[arg(long)]
    session_id: String,
    /// Partial answers keyed by question code, as a JSON object.
    #[arg(long)]
    payload_json: String,
    #[arg(long)]
    last_step: Option<i64>,
}

#[derive(Debug, Args)]
pub struct SessionIdArg {
    #[arg(long)]
    session_id: String,
}

#[derive(Debug, Subcommand)]
pub enum SubmitCommand {
    /// Finalize a draft session into a submitted response.
    Session(SubmitSessionArgs),
    /// Submit a full answer map with no prior session.
    Direct(SubmitDirectArgs),
}

#[derive(Debug, Args)]
pub struct SubmitSessionArgs {
    #[arg(long)]
    session_id: String,
    /// Answers merged over the session draft, as a JSON object.
    #[arg(long)]
    answers_json: Option<String>,
}

#[derive(Debug, Args)]
pub struct SubmitDirectArgs {
    #[arg(long)]
    survey_id: String,
    /// Raw answers keyed by question code, as a JSON object.
    #[arg(long)]
    answers_json: String,
}

#[derive(Debug, Subcommand)]
pub enum ResponseCommand {
    Show(ResponseShowArgs),
    List(SurveyIdArg),
}

#[derive(Debug, Args)]
pub struct ResponseShowArgs {
    #[arg(long)]
    response_id: String,
}

/// Opens the store, applies migrations and dispatches the parsed
/// command.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let codec = AnswerCodec::new(&cli.encryption_secret)?;
    let mut store = SqliteSurveyStore::open(&cli.db, codec)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

fn run_command(command: Command, store: &mut SqliteSurveyStore) -> Result<()> {
    match command {
        Command::Migrate => print_json(&serde_json::json!({"migrated": true})),
        Command::Survey { command } => run_survey(command, store),
        Command::Section { command } => run_section(command, store),
        Command::Question { command } => run_question(*command, store),
        Command::Option { command } => run_option(command, store),
        Command::Invitation { command } => run_invitation(command, store),
        Command::Session { command } => run_session(command, store),
        Command::Submit { command } => run_submit(command, store),
        Command::Response { command } => run_response(command, store),
    }
}

fn run_survey(command: SurveyCommand, store: &SqliteSurveyStore) -> Result<()> {
    match command {
        SurveyCommand::Create(args) => {
            let survey =
                store.create_survey(&args.code, &args.title, args.description.as_deref())?;
            print_json(&survey)
        }
        SurveyCommand::Activate(args) => {
            let survey =
                store.set_survey_status(parse_survey_id(&args.survey_id)?, SurveyStatus::Active)?;
            print_json(&survey)
        }
        SurveyCommand::Archive(args) => {
            let survey = store
                .set_survey_status(parse_survey_id(&args.survey_id)?, SurveyStatus::Archived)?;
            print_json(&survey)
        }
        SurveyCommand::Show(args) => {
            let survey = store.get_survey(parse_survey_id(&args.survey_id)?)?;
            print_json(&survey)
        }
    }
}

fn run_section(command: SectionCommand, store: &SqliteSurveyStore) -> Result<()> {
    match command {
        SectionCommand::Add(args) => {
            let section = store.add_section(
                parse_survey_id(&args.survey_id)?,
                &args.title,
                args.description.as_deref(),
                args.sort_order,
            )?;
            print_json(&section)
        }
    }
}

fn run_question(command: QuestionCommand, store: &SqliteSurveyStore) -> Result<()> {
    match command {
        QuestionCommand::Add(args) => {
            let constraints = parse_json_object(&args.constraints_json, "--constraints-json")?;
            let input = NewQuestion {
                code: args.code,
                prompt: args.prompt,
                help_text: args.help_text,
                question_type: map_question_type(args.question_type),
                required: args.required,
                sensitive: args.sensitive,
                constraints: Value::Object(constraints),
                sort_order: args.sort_order,
            };
            let question = store.add_question(
                SectionId::parse(&args.section_id).map_err(to_anyhow)?,
                &input,
            )?;
            print_json(&question)
        }
    }
}

fn run_option(command: OptionCommand, store: &SqliteSurveyStore) -> Result<()> {
    match command {
        OptionCommand::Add(args) => {
            let option = store.add_option(
                QuestionId::parse(&args.question_id).map_err(to_anyhow)?,
                &args.value,
                &args.label,
                args.sort_order,
            )?;
            print_json(&option)
        }
    }
}

fn run_invitation(command: InvitationCommand, store: &SqliteSurveyStore) -> Result<()> {
    match command {
        InvitationCommand::Create(args) => {
            let expires_at = match args.expires_at.as_deref() {
                Some(raw) => Some(parse_rfc3339_utc(raw).map_err(to_anyhow)?),
                None => None,
            };
            let invitation =
                store.create_invitation(parse_survey_id(&args.survey_id)?, &args.email, expires_at)?;
            print_json(&invitation)
        }
        InvitationCommand::ExpireOverdue => {
            let expired = store.expire_overdue_invitations(now_utc())?;
            print_json(&serde_json::json!({"expired": expired}))
        }
    }
}

fn run_session(command: SessionCommand, store: &SqliteSurveyStore) -> Result<()> {
    match command {
        SessionCommand::Start(args) => {
            let session =
                store.start_session(parse_survey_id(&args.survey_id)?, args.token.as_deref())?;
            print_json(&session)
        }
        SessionCommand::Autosave(args) => {
            let payload = parse_json_object(&args.payload_json, "--payload-json")?;
            let session = store.autosave_session(
                parse_session_id(&args.session_id)?,
                &payload,
                args.last_step,
            )?;
            print_json(&session)
        }
        SessionCommand::Show(args) => {
            let session = store.get_session(parse_session_id(&args.session_id)?)?;
            print_json(&session)
        }
        SessionCommand::Abandon(args) => {
            let session = store.abandon_session(parse_session_id(&args.session_id)?)?;
            print_json(&session)
        }
    }
}

fn run_submit(command: SubmitCommand, store: &mut SqliteSurveyStore) -> Result<()> {
    match command {
        SubmitCommand::Session(args) => {
            let extra = match args.answers_json.as_deref() {
                Some(raw) => Some(parse_answer_map(raw)?),
                None => None,
            };
            let response =
                store.submit_from_session(parse_session_id(&args.session_id)?, extra.as_ref())?;
            print_json(&response)
        }
        SubmitCommand::Direct(args) => {
            let answers = parse_answer_map(&args.answers_json)?;
            let response = store.submit_direct(parse_survey_id(&args.survey_id)?, &answers)?;
            print_json(&response)
        }
    }
}

fn run_response(command: ResponseCommand, store: &SqliteSurveyStore) -> Result<()> {
    match command {
        ResponseCommand::Show(args) => {
            let response =
                store.get_response(ResponseId::parse(&args.response_id).map_err(to_anyhow)?)?;
            print_json(&response)
        }
        ResponseCommand::List(args) => {
            let responses = store.list_responses(parse_survey_id(&args.survey_id)?)?;
            print_json(&responses)
        }
    }
}

fn map_question_type(arg: QuestionTypeArg) -> QuestionType {
    match arg {
        QuestionTypeArg::Text => QuestionType::Text,
        QuestionTypeArg::Number => QuestionType::Number,
        QuestionTypeArg::Date => QuestionType::Date,
        QuestionTypeArg::Dropdown => QuestionType::Dropdown,
        QuestionTypeArg::Checkbox => QuestionType::Checkbox,
        QuestionTypeArg::Radio => QuestionType::Radio,
    }
}

fn parse_survey_id(raw: &str) -> Result<SurveyId> {
    SurveyId::parse(raw).map_err(to_anyhow)
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    SessionId::parse(raw).map_err(to_anyhow)
}

fn parse_json_object(raw: &str, flag: &str) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("{flag} is not valid JSON"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("{flag} must be a JSON object, got {other}")),
    }
}

fn parse_answer_map(raw: &str) -> Result<BTreeMap<String, Value>> {
    let map = parse_json_object(raw, "--answers-json")?;
    Ok(map.into_iter().collect())
}

fn to_anyhow(err: survey_core::SurveyError) -> anyhow::Error {
    err.into()
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
