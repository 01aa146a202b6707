use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use caselog_api::{CaselogApi, MutationOutcome};
use caselog_core::{parse_iso_date, PatchField, RecordDraft, RecordFilter, RecordId, RecordPatch};
use caselog_store_sqlite::SqliteStore;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use time::Date;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "caselog")]
#[command(about = "Caselog record register CLI")]
struct Cli {
    #[arg(long, default_value = "./caselog.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Dashboard,
    Taxonomy {
        #[command(subcommand)]
        command: TaxonomyCommand,
    },
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Add(RecordAddArgs),
    List(RecordListArgs),
    Update(RecordUpdateArgs),
    Delete(RecordTargetArgs),
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    #[arg(long, default_value = "")]
    status: String,
    #[arg(long, default_value = "")]
    system: String,
    #[arg(long, default_value = "")]
    process_number: String,
    #[arg(long, default_value = "")]
    interested_party: String,
    /// Entry date as YYYY-MM-DD; omit for none.
    #[arg(long)]
    entry_date: Option<String>,
    #[arg(long, default_value = "")]
    situation: String,
    #[arg(long, default_value = "")]
    asymmetry: String,
    #[arg(long, default_value = "")]
    observation: String,
    #[arg(long, default_value = "")]
    origin_unit: String,
    #[arg(long, default_value = "")]
    subject: String,
    #[arg(long, default_value = "")]
    sub_subject: String,
    #[arg(long, default_value = "")]
    responsible_unit: String,
    #[arg(long, default_value = "")]
    destination: String,
    /// Exit date as YYYY-MM-DD; omit for none.
    #[arg(long)]
    exit_date: Option<String>,
}

#[derive(Debug, Args)]
struct RecordListArgs {
    #[arg(long, default_value_t = 1)]
    page: usize,
    #[arg(long, default_value_t = 10)]
    page_size: usize,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    process_number: Option<String>,
    #[arg(long)]
    interested_party: Option<String>,
    #[arg(long)]
    entry_date: Option<String>,
    #[arg(long)]
    situation: Option<String>,
    #[arg(long)]
    asymmetry: Option<String>,
    #[arg(long)]
    observation: Option<String>,
    #[arg(long)]
    origin_unit: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    sub_subject: Option<String>,
    #[arg(long)]
    responsible_unit: Option<String>,
    #[arg(long)]
    destination: Option<String>,
    #[arg(long)]
    exit_date: Option<String>,
}

#[derive(Debug, Args)]
struct RecordUpdateArgs {
    #[command(flatten)]
    target: RecordTargetArgs,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    system: Option<String>,
    #[arg(long)]
    process_number: Option<String>,
    #[arg(long)]
    interested_party: Option<String>,
    /// New entry date as YYYY-MM-DD; pass an empty value to clear it.
    #[arg(long)]
    entry_date: Option<String>,
    #[arg(long)]
    situation: Option<String>,
    #[arg(long)]
    asymmetry: Option<String>,
    #[arg(long)]
    observation: Option<String>,
    #[arg(long)]
    origin_unit: Option<String>,
    #[arg(long)]
    subject: Option<String>,
    #[arg(long)]
    sub_subject: Option<String>,
    #[arg(long)]
    responsible_unit: Option<String>,
    #[arg(long)]
    destination: Option<String>,
    /// New exit date as YYYY-MM-DD; pass an empty value to clear it.
    #[arg(long)]
    exit_date: Option<String>,
}

/// Address a record by surrogate id or physical row index.
#[derive(Debug, Args)]
struct RecordTargetArgs {
    #[arg(long, conflicts_with = "row")]
    id: Option<String>,
    #[arg(long)]
    row: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum TaxonomyCommand {
    Show,
    Add(TaxonomyAddArgs),
}

#[derive(Debug, Args)]
struct TaxonomyAddArgs {
    #[arg(long)]
    subject: String,
    /// Leave empty to register a standalone subject.
    #[arg(long, default_value = "")]
    sub_subject: String,
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    List,
    Check(UsersEmailArgs),
    Add(UsersEmailArgs),
}

#[derive(Debug, Args)]
struct UsersEmailArgs {
    #[arg(long)]
    email: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit_outcome(outcome: &MutationOutcome) -> Result<()> {
    emit_json(serde_json::to_value(outcome)?)?;
    if outcome.success {
        Ok(())
    } else {
        Err(anyhow!("{}", outcome.message))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = CaselogApi::new(cli.db.clone());
    match cli.command {
        Command::Db { command } => run_db(command, &cli.db),
        Command::Record { command } => run_record(*command, &api),
        Command::Dashboard => run_dashboard(&api),
        Command::Taxonomy { command } => run_taxonomy(command, &api),
        Command::Users { command } => run_users(command, &api),
    }
}

fn run_db(command: DbCommand, db_path: &Path) -> Result<()> {
    let mut store = SqliteStore::open(db_path)?;
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::IntegrityCheck => {
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report)?)
        }
    }
}

fn run_record(command: RecordCommand, api: &CaselogApi) -> Result<()> {
    match command {
        RecordCommand::Add(args) => {
            let draft = build_draft(args)?;
            emit_outcome(&api.create_record(draft))
        }
        RecordCommand::List(args) => {
            let page = api.query_records(args.page, args.page_size, &build_filter(&args))?;
            emit_json(serde_json::to_value(&page)?)
        }
        RecordCommand::Update(args) => {
            let patch = build_patch(&args)?;
            let outcome = match resolve_target(&args.target)? {
                RecordTarget::Id(id) => api.update_record(id, &patch),
                RecordTarget::Row(row) => api.update_row(row, &patch),
            };
            emit_outcome(&outcome)
        }
        RecordCommand::Delete(target) => {
            let outcome = match resolve_target(&target)? {
                RecordTarget::Id(id) => api.delete_record(id),
                RecordTarget::Row(row) => api.delete_row(row),
            };
            emit_outcome(&outcome)
        }
    }
}

fn run_dashboard(api: &CaselogApi) -> Result<()> {
    let summary = api.dashboard()?;
    emit_json(serde_json::to_value(summary)?)
}

fn run_taxonomy(command: TaxonomyCommand, api: &CaselogApi) -> Result<()> {
    match command {
        TaxonomyCommand::Show => {
            let map = api.taxonomy()?;
            emit_json(serde_json::json!({ "subjects": map }))
        }
        TaxonomyCommand::Add(args) => {
            emit_outcome(&api.add_taxonomy_entry(&args.subject, &args.sub_subject))
        }
    }
}

fn run_users(command: UsersCommand, api: &CaselogApi) -> Result<()> {
    match command {
        UsersCommand::List => {
            let users = api.authorized_users()?;
            emit_json(serde_json::json!({
                "count": users.len(),
                "users": users
            }))
        }
        UsersCommand::Check(args) => {
            let authorized = api.is_authorized(&args.email)?;
            emit_json(serde_json::json!({
                "email": args.email,
                "authorized": authorized
            }))
        }
        UsersCommand::Add(args) => emit_outcome(&api.add_user(&args.email)),
    }
}

enum RecordTarget {
    Id(RecordId),
    Row(usize),
}

fn resolve_target(target: &RecordTargetArgs) -> Result<RecordTarget> {
    match (&target.id, target.row) {
        (Some(raw), None) => Ok(RecordTarget::Id(parse_record_id(raw)?)),
        (None, Some(row)) => Ok(RecordTarget::Row(row)),
        _ => Err(anyhow!("provide exactly one of --id or --row")),
    }
}

fn parse_record_id(value: &str) -> Result<RecordId> {
    let parsed =
        Ulid::from_string(value).map_err(|err| anyhow!("invalid record id {value}: {err}"))?;
    Ok(RecordId(parsed))
}

fn parse_date_arg(value: &str) -> Result<Date> {
    parse_iso_date(value).map_err(|err| anyhow!(err))
}

fn build_draft(args: RecordAddArgs) -> Result<RecordDraft> {
    let entry_date = optional_date(args.entry_date.as_deref())?;
    let exit_date = optional_date(args.exit_date.as_deref())?;
    Ok(RecordDraft {
        status: args.status,
        system: args.system,
        process_number: args.process_number,
        interested_party: args.interested_party,
        entry_date,
        situation: args.situation,
        asymmetry: args.asymmetry,
        observation: args.observation,
        origin_unit: args.origin_unit,
        subject: args.subject,
        sub_subject: args.sub_subject,
        responsible_unit: args.responsible_unit,
        destination: args.destination,
        exit_date,
    })
}

fn optional_date(value: Option<&str>) -> Result<Option<Date>> {
    match value {
        None | Some("") => Ok(None),
        Some(raw) => Ok(Some(parse_date_arg(raw)?)),
    }
}

fn build_filter(args: &RecordListArgs) -> RecordFilter {
    RecordFilter {
        status: args.status.clone(),
        system: args.system.clone(),
        process_number: args.process_number.clone(),
        interested_party: args.interested_party.clone(),
        entry_date: args.entry_date.clone(),
        situation: args.situation.clone(),
        asymmetry: args.asymmetry.clone(),
        observation: args.observation.clone(),
        origin_unit: args.origin_unit.clone(),
        subject: args.subject.clone(),
        sub_subject: args.sub_subject.clone(),
        responsible_unit: args.responsible_unit.clone(),
        destination: args.destination.clone(),
        exit_date: args.exit_date.clone(),
    }
}

fn text_patch(value: Option<&String>) -> PatchField<String> {
    match value {
        Some(value) => PatchField::Set(value.clone()),
        None => PatchField::Keep,
    }
}

fn date_patch(value: Option<&str>) -> Result<PatchField<Date>> {
    match value {
        None => Ok(PatchField::Keep),
        Some("") => Ok(PatchField::Clear),
        Some(raw) => Ok(PatchField::Set(parse_date_arg(raw)?)),
    }
}

fn build_patch(args: &RecordUpdateArgs) -> Result<RecordPatch> {
    Ok(RecordPatch {
        status: text_patch(args.status.as_ref()),
        system: text_patch(args.system.as_ref()),
        process_number: text_patch(args.process_number.as_ref()),
        interested_party: text_patch(args.interested_party.as_ref()),
        entry_date: date_patch(args.entry_date.as_deref())?,
        situation: text_patch(args.situation.as_ref()),
        asymmetry: text_patch(args.asymmetry.as_ref()),
        observation: text_patch(args.observation.as_ref()),
        origin_unit: text_patch(args.origin_unit.as_ref()),
        subject: text_patch(args.subject.as_ref()),
        sub_subject: text_patch(args.sub_subject.as_ref()),
        responsible_unit: text_patch(args.responsible_unit.as_ref()),
        destination: text_patch(args.destination.as_ref()),
        exit_date: date_patch(args.exit_date.as_deref())?,
    })
}
