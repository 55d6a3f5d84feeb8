//! Command surface for the personnel mutation engine.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`error_envelope`] and [`exit_code`]
//! turn failures into the stable stderr contract used by the `pm` binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use personnel_mutation_core::{
    AddressCreateRequest, ErrorClass, JobCreateRequest, JobKey, JobMutation, JobPayload,
    JobUpdateRequest, MutationError, MutationPolicy, Person, PhoneCreateRequest,
};
use personnel_mutation_engine::MutationEngine;
use personnel_mutation_store_sqlite::{SqlitePersonnelStore, SqliteSessionFactory};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

pub const ERROR_ENVELOPE_CONTRACT_VERSION: &str = "error_envelope.v1";
pub const LOG_ENV_VAR: &str = "PM_LOG";
pub const CLI_ERROR_MESSAGE: &str = "command failed; set PM_LOG=error for details";

#[derive(Debug, Parser)]
#[command(name = "pm")]
#[command(about = "Personnel record mutation CLI")]
pub struct Cli {
    #[arg(long, default_value = "./personnel.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value_t = 5000)]
    busy_timeout_ms: u64,

    /// JSON mutation policy; defaults to the built-in v1 policy.
    #[arg(long)]
    policy: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Person {
        #[command(subcommand)]
        command: Box<PersonCommand>,
    },
    Reference {
        #[command(subcommand)]
        command: Box<ReferenceCommand>,
    },
    Job {
        #[command(subcommand)]
        command: Box<JobCommand>,
    },
    Address {
        #[command(subcommand)]
        command: Box<AddressCommand>,
    },
    Phone {
        #[command(subcommand)]
        command: Box<PhoneCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum PersonCommand {
    Add(PersonArgs),
}

#[derive(Debug, Subcommand)]
pub enum ReferenceCommand {
    Add(ReferenceAddArgs),
}

#[derive(Debug, Subcommand)]
pub enum JobCommand {
    Create(PayloadArgs),
    Update(JobUpdateArgs),
    Show(JobShowArgs),
    List(PersonArgs),
}

#[derive(Debug, Subcommand)]
pub enum AddressCommand {
    Create(PayloadArgs),
    List(PersonArgs),
}

#[derive(Debug, Subcommand)]
pub enum PhoneCommand {
    Create(PayloadArgs),
    List(PersonArgs),
}

#[derive(Debug, Args)]
pub struct PersonArgs {
    #[arg(long)]
    person_id: String,
}

#[derive(Debug, Args)]
pub struct ReferenceAddArgs {
    #[arg(long)]
    code: String,
    #[arg(long, default_value = "")]
    description: String,
}

#[derive(Debug, Args)]
pub struct PayloadArgs {
    #[arg(long)]
    person_id: String,
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
pub struct JobUpdateArgs {
    #[arg(long)]
    person_id: String,
    #[arg(long)]
    job_id: String,
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
pub struct JobShowArgs {
    #[arg(long)]
    person_id: String,
    #[arg(long)]
    job_id: String,
}

/// Failure report written to stderr.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    pub contract_version: String,
    pub code: String,
    pub class: ErrorClass,
    pub message: String,
}

type SqliteEngine = MutationEngine<SqliteSessionFactory, SqliteSessionFactory>;

/// # Errors
/// Returns engine failures as [`MutationError`] inside the `anyhow` chain so
/// callers can classify them with [`error_envelope`].
pub fn run_cli(cli: Cli) -> Result<()> {
    let busy_timeout = Duration::from_millis(cli.busy_timeout_ms);
    let store = SqlitePersonnelStore::open_with_busy_timeout(&cli.db, busy_timeout)?;
    store.migrate()?;

    match cli.command {
        Command::Migrate => print_json(&serde_json::json!({
            "migrated": true,
            "db": cli.db.display().to_string(),
        })),
        Command::Person { command } => match *command {
            PersonCommand::Add(args) => {
                let person = store.add_person(&args.person_id)?;
                print_json(&person)
            }
        },
        Command::Reference { command } => match *command {
            ReferenceCommand::Add(args) => {
                store.add_change_reason_code(&args.code, &args.description)?;
                print_json(&serde_json::json!({
                    "code": args.code,
                    "description": args.description,
                }))
            }
        },
        Command::Job { command } => {
            let engine = build_engine(&store, cli.busy_timeout_ms, cli.policy.as_deref())?;
            run_job(*command, &store, &engine)
        }
        Command::Address { command } => {
            let engine = build_engine(&store, cli.busy_timeout_ms, cli.policy.as_deref())?;
            match *command {
                AddressCommand::Create(args) => {
                    let request: AddressCreateRequest = parse_payload(&args.payload)?;
                    let record = engine.create_address(&args.person_id, &request)?;
                    print_json(&record)
                }
                AddressCommand::List(args) => {
                    let person = require_person(&store, &args.person_id)?;
                    print_json(&store.list_addresses(person.internal_id)?)
                }
            }
        }
        Command::Phone { command } => {
            let engine = build_engine(&store, cli.busy_timeout_ms, cli.policy.as_deref())?;
            match *command {
                PhoneCommand::Create(args) => {
                    let request: PhoneCreateRequest = parse_payload(&args.payload)?;
                    let record = engine.create_phone(&args.person_id, &request)?;
                    print_json(&record)
                }
                PhoneCommand::List(args) => {
                    let person = require_person(&store, &args.person_id)?;
                    print_json(&store.list_phones(person.internal_id)?)
                }
            }
        }
    }
}

fn run_job(command: JobCommand, store: &SqlitePersonnelStore, engine: &SqliteEngine) -> Result<()> {
    match command {
        JobCommand::Create(args) => {
            let job: JobPayload = parse_payload(&args.payload)?;
            let mutation = JobMutation::Create(JobCreateRequest { job });
            let record = engine.create_or_update_job(&args.person_id, &mutation)?;
            print_json(&record)
        }
        JobCommand::Update(args) => {
            let job_id = JobKey::parse(&args.job_id)?;
            let job: JobPayload = parse_payload(&args.payload)?;
            let mutation = JobMutation::Update(JobUpdateRequest { job_id, job });
            let record = engine.create_or_update_job(&args.person_id, &mutation)?;
            print_json(&record)
        }
        JobCommand::Show(args) => {
            let person = require_person(store, &args.person_id)?;
            let key = JobKey::parse(&args.job_id)?;
            let Some(job) = store.get_job(person.internal_id, &key)? else {
                return Err(anyhow!(
                    "job {key} not found for person {}",
                    args.person_id
                ));
            };
            print_json(&job)
        }
        JobCommand::List(args) => {
            let person = require_person(store, &args.person_id)?;
            print_json(&store.list_jobs(person.internal_id)?)
        }
    }
}

fn build_engine(
    store: &SqlitePersonnelStore,
    busy_timeout_ms: u64,
    policy_path: Option<&Path>,
) -> Result<SqliteEngine> {
    let policy = match policy_path {
        Some(path) => load_policy(path)?,
        None => MutationPolicy::v1(),
    };
    let factory = store.session_factory(Duration::from_millis(busy_timeout_ms));
    let engine = MutationEngine::new(factory.clone(), factory, policy)?;
    Ok(engine)
}

fn load_policy(path: &Path) -> Result<MutationPolicy> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read policy file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body).map_err(|err| {
        MutationError::Configuration(format!("policy file {} is not JSON: {err}", path.display()))
    })?;
    Ok(MutationPolicy::from_json(&value)?)
}

fn require_person(store: &SqlitePersonnelStore, person_id: &str) -> Result<Person> {
    match store.resolve_person(person_id)? {
        Some(person) => Ok(person),
        None => Err(MutationError::PersonNotFound(format!("person {person_id} not found")).into()),
    }
}

fn parse_payload<T: DeserializeOwned>(raw: &str) -> Result<T, MutationError> {
    serde_json::from_str(raw)
        .map_err(|err| MutationError::Validation(format!("invalid payload: {err}")))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Builds the stderr envelope for a failed command.
#[must_use]
pub fn error_envelope(err: &anyhow::Error) -> ErrorEnvelope {
    match err.downcast_ref::<MutationError>() {
        Some(mutation) => ErrorEnvelope {
            contract_version: ERROR_ENVELOPE_CONTRACT_VERSION.to_string(),
            code: mutation.code().to_string(),
            class: mutation.class(),
            message: mutation.public_message(),
        },
        None => {
            tracing::error!(error = %format!("{err:#}"), "command failed");
            ErrorEnvelope {
                contract_version: ERROR_ENVELOPE_CONTRACT_VERSION.to_string(),
                code: "cli_error".to_string(),
                class: ErrorClass::Internal,
                message: CLI_ERROR_MESSAGE.to_string(),
            }
        }
    }
}

#[must_use]
pub fn exit_code(class: ErrorClass) -> u8 {
    match class {
        ErrorClass::Rejected | ErrorClass::NotFound => 2,
        ErrorClass::Retryable => 3,
        ErrorClass::Internal => 1,
    }
}

/// Installs the stderr subscriber, filtered by `PM_LOG` (default `warn`).
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second install (tests, embedding hosts) keeps the existing subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use personnel_mutation_core::SessionFactory;
    use serde_json::json;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_db() -> String {
        std::env::temp_dir()
            .join(format!("personnel-cli-{}.sqlite3", Ulid::new()))
            .display()
            .to_string()
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn args(db: &str, rest: &[&str]) -> Vec<String> {
        let mut values = vec!["pm".to_string(), "--db".to_string(), db.to_string()];
        values.extend(rest.iter().map(|item| (*item).to_string()));
        values
    }

    #[test]
    fn parse_payload_rejects_invalid_json_as_validation() {
        let result = parse_payload::<PhoneCreateRequest>("{");
        assert!(matches!(result, Err(MutationError::Validation(_))));
    }

    #[test]
    fn cli_parses_nested_job_update() {
        let cli = Cli::try_parse_from([
            "pm",
            "--busy-timeout-ms",
            "250",
            "job",
            "update",
            "--person-id",
            "930000001",
            "--job-id",
            "C50001-00",
            "--payload",
            "{}",
        ]);
        let cli = match cli {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(cli.busy_timeout_ms, 250);
        assert!(matches!(
            cli.command,
            Command::Job { ref command } if matches!(**command, JobCommand::Update(_))
        ));
    }

    #[test]
    fn envelope_classifies_engine_errors() {
        let rejected = anyhow::Error::from(MutationError::Validation(
            "Invalid change reason code BOGUS".to_string(),
        ));
        let envelope = error_envelope(&rejected);
        assert_eq!(envelope.code, "validation_error");
        assert_eq!(envelope.class, ErrorClass::Rejected);
        assert_eq!(envelope.message, "Invalid change reason code BOGUS");
        assert_eq!(exit_code(envelope.class), 2);

        let busy = anyhow::Error::from(MutationError::TransientStore("database is locked".to_string()));
        let envelope = error_envelope(&busy);
        assert_eq!(exit_code(envelope.class), 3);
        assert!(!envelope.message.contains("locked"));

        let other = anyhow!("disk I/O error").context("failed to open sqlite database at /srv/pm.db");
        let envelope = error_envelope(&other);
        assert_eq!(envelope.code, "cli_error");
        assert_eq!(envelope.message, CLI_ERROR_MESSAGE);
        assert!(!envelope.message.contains("/srv/pm.db"));
        assert_eq!(exit_code(envelope.class), 1);
    }

    #[test]
    fn job_flow_runs_end_to_end() {
        let db = fixture_db();
        must(execute_cli(args(&db, &["migrate"])));
        must(execute_cli(args(&db, &["person", "add", "--person-id", "930000001"])));

        let payload = json!({
            "positionNumber": "C50001",
            "suffix": "00",
            "employmentType": "student",
            "changeReason": { "code": "HIRE" },
            "hourlyRate": 15.0,
        })
        .to_string();
        must(execute_cli(args(
            &db,
            &["job", "create", "--person-id", "930000001", "--payload", &payload],
        )));
        must(execute_cli(args(
            &db,
            &["job", "show", "--person-id", "930000001", "--job-id", "C50001-00"],
        )));

        let store = must(SqlitePersonnelStore::open(Path::new(&db)));
        let person = match must(store.resolve_person("930000001")) {
            Some(person) => person,
            None => panic!("person should exist"),
        };
        assert_eq!(must(store.list_jobs(person.internal_id)).len(), 1);
    }

    #[test]
    fn bogus_code_surfaces_as_mutation_error() {
        let db = fixture_db();
        must(execute_cli(args(&db, &["person", "add", "--person-id", "930000001"])));

        let payload = json!({
            "positionNumber": "G10001",
            "suffix": "00",
            "employmentType": "graduate",
            "changeReason": { "code": "BOGUS" },
        })
        .to_string();
        let err = match execute_cli(args(
            &db,
            &["job", "create", "--person-id", "930000001", "--payload", &payload],
        )) {
            Ok(()) => panic!("BOGUS should be rejected"),
            Err(err) => err,
        };
        let envelope = error_envelope(&err);
        assert_eq!(envelope.code, "validation_error");
        assert_eq!(envelope.message, "Invalid change reason code BOGUS");
    }

    #[test]
    fn payload_missing_job_key_is_rejected_before_code_lookup() {
        let db = fixture_db();
        must(execute_cli(args(&db, &["person", "add", "--person-id", "930000001"])));

        let payload = json!({ "changeReason": { "code": "BOGUS" } }).to_string();
        let err = match execute_cli(args(
            &db,
            &["job", "create", "--person-id", "930000001", "--payload", &payload],
        )) {
            Ok(()) => panic!("incomplete payload should be rejected"),
            Err(err) => err,
        };
        let envelope = error_envelope(&err);
        assert_eq!(envelope.code, "validation_error");
        assert_eq!(exit_code(envelope.class), 2);
        assert!(envelope.message.starts_with("invalid payload: missing field"));
    }

    #[test]
    fn locked_database_exits_as_retryable() {
        let db = fixture_db();
        must(execute_cli(args(&db, &["migrate"])));
        let store = must(SqlitePersonnelStore::open(Path::new(&db)));
        let holder = match store
            .session_factory(Duration::from_secs(5))
            .open_session()
        {
            Ok(session) => session,
            Err(err) => panic!("test failure: {err}"),
        };

        let result = execute_cli(vec![
            "pm".to_string(),
            "--db".to_string(),
            db,
            "--busy-timeout-ms".to_string(),
            "50".to_string(),
            "person".to_string(),
            "add".to_string(),
            "--person-id".to_string(),
            "930000001".to_string(),
        ]);
        let err = match result {
            Ok(()) => panic!("locked database should not accept writes"),
            Err(err) => err,
        };
        let envelope = error_envelope(&err);
        assert_eq!(envelope.class, ErrorClass::Retryable);
        assert_eq!(exit_code(envelope.class), 3);
        drop(holder);
    }

    #[test]
    fn policy_file_is_validated() {
        let db = fixture_db();
        let policy_path = std::env::temp_dir().join(format!("personnel-policy-{}.json", Ulid::new()));
        let mut policy = must(serde_json::to_value(MutationPolicy::v1()).map_err(anyhow::Error::from));
        policy["termination_codes"] = json!([]);
        must(std::fs::write(&policy_path, policy.to_string()).map_err(anyhow::Error::from));

        let result = execute_cli(vec![
            "pm".to_string(),
            "--db".to_string(),
            db,
            "--policy".to_string(),
            policy_path.display().to_string(),
            "job".to_string(),
            "list".to_string(),
            "--person-id".to_string(),
            "930000001".to_string(),
        ]);
        let err = match result {
            Ok(()) => panic!("invalid policy should fail"),
            Err(err) => err,
        };
        assert_eq!(error_envelope(&err).code, "configuration_error");
    }
}
