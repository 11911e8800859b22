use std::path::PathBuf;

use anyhow::{Context, Result};
use bpk_api::{BatchRequest, BpkApi, ConfigUpdate, MergeRequest, ReplayLookup, ResetRequest};
use bpk_core::{parse_date, BpkError, BpkQuery, ContactType, PersonId, PersonUpdate};
use bpk_store_sqlite::NewPerson;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use time::Date;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "bpk")]
#[command(about = "bPK lookup scheduling and merge CLI")]
struct Cli {
    #[arg(long, global = true, default_value = "./bpk.sqlite3")]
    db: PathBuf,

    /// Answer registry lookups from a JSON file of canned responses instead of
    /// the offline client.
    #[arg(long, global = true)]
    responses: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
    Person {
        #[command(subcommand)]
        command: Box<PersonCommand>,
    },
    Bpk {
        #[command(subcommand)]
        command: Box<BpkCommand>,
    },
    Lookup {
        #[command(subcommand)]
        command: Box<LookupCommand>,
    },
    Merge(MergeArgs),
    Runs {
        #[command(subcommand)]
        command: Box<RunsCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
struct ConfigSetArgs {
    #[arg(long)]
    rate_limit: Option<u32>,
    #[arg(long)]
    retry_interval_days: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum PersonCommand {
    Add(PersonAddArgs),
    List,
    Show(PersonIdArgs),
    Update(PersonUpdateArgs),
}

#[derive(Debug, Args)]
struct PersonAddArgs {
    #[arg(long, value_enum, default_value_t = ContactTypeArg::Individual)]
    contact_type: ContactTypeArg,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long, value_parser = parse_date_arg)]
    birth_date: Option<Date>,
    #[arg(long)]
    postal_code: Option<String>,
}

#[derive(Debug, Args)]
struct PersonIdArgs {
    #[arg(long)]
    id: PersonId,
}

#[derive(Debug, Args)]
struct PersonUpdateArgs {
    #[arg(long)]
    id: PersonId,
    #[arg(long)]
    first_name: Option<String>,
    #[arg(long)]
    last_name: Option<String>,
    #[arg(long, value_parser = parse_date_arg)]
    birth_date: Option<Date>,
}

#[derive(Debug, Subcommand)]
enum BpkCommand {
    Show(BpkShowArgs),
    Reset(BpkResetArgs),
    Query(BpkQueryArgs),
}

#[derive(Debug, Args)]
struct BpkShowArgs {
    #[arg(long)]
    person_id: PersonId,
}

#[derive(Debug, Args)]
struct BpkResetArgs {
    #[arg(long = "person-id", required = true)]
    person_ids: Vec<PersonId>,
}

#[derive(Debug, Args)]
struct BpkQueryArgs {
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    /// `YYYY-MM-DD`, `YYYYMMDD` or `YYYY-MM-DD HH:MM:SS`.
    #[arg(long)]
    birth_date: String,
    #[arg(long)]
    postal_code: Option<String>,
}

#[derive(Debug, Subcommand)]
enum LookupCommand {
    Run(LookupRunArgs),
}

#[derive(Debug, Args)]
struct LookupRunArgs {
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    person_id: Option<PersonId>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(long)]
    main: PersonId,
    #[arg(long = "other", required = true)]
    others: Vec<PersonId>,
}

#[derive(Debug, Subcommand)]
enum RunsCommand {
    List(RunsListArgs),
}

#[derive(Debug, Args)]
struct RunsListArgs {
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ContactTypeArg {
    Individual,
    Household,
    Organization,
}

impl ContactTypeArg {
    fn into_contact_type(self) -> ContactType {
        match self {
            Self::Individual => ContactType::Individual,
            Self::Household => ContactType::Household,
            Self::Organization => ContactType::Organization,
        }
    }
}

fn parse_date_arg(value: &str) -> Result<Date, BpkError> {
    parse_date(value)
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

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).context("failed to encode command output")?)
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_api(cli: &Cli) -> Result<BpkApi> {
    let api = BpkApi::new(cli.db.clone());
    match &cli.responses {
        Some(path) => {
            let replay = ReplayLookup::from_file(path)?;
            debug!(responses = replay.len(), path = %path.display(), "using replay lookup client");
            Ok(api.with_lookup(replay))
        }
        None => Ok(api),
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = build_api(&cli)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Config { command } => run_config(*command, &api),
        Command::Person { command } => run_person(*command, &api),
        Command::Bpk { command } => run_bpk(*command, &api),
        Command::Lookup { command } => run_lookup(*command, &api),
        Command::Merge(args) => run_merge(args, &api),
        Command::Runs { command } => run_runs(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &BpkApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_written": true,
                "out": args.out.display().to_string()
            }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_config(command: ConfigCommand, api: &BpkApi) -> Result<()> {
    match command {
        ConfigCommand::Show => emit(&api.config_show()?),
        ConfigCommand::Set(args) => emit(&api.config_set(ConfigUpdate {
            rate_limit: args.rate_limit,
            retry_interval_days: args.retry_interval_days,
        })?),
    }
}

fn run_person(command: PersonCommand, api: &BpkApi) -> Result<()> {
    match command {
        PersonCommand::Add(args) => emit(&api.add_person(&NewPerson {
            contact_type: args.contact_type.into_contact_type(),
            first_name: args.first_name,
            last_name: args.last_name,
            birth_date: args.birth_date,
            postal_code: args.postal_code,
        })?),
        PersonCommand::List => {
            let persons = api.list_persons()?;
            emit_json(serde_json::json!({ "persons": persons }))
        }
        PersonCommand::Show(args) => emit(&api.show_person(args.id)?),
        PersonCommand::Update(args) => emit(&api.update_person(
            args.id,
            &PersonUpdate {
                first_name: args.first_name,
                last_name: args.last_name,
                birth_date: args.birth_date,
            },
        )?),
    }
}

fn run_bpk(command: BpkCommand, api: &BpkApi) -> Result<()> {
    match command {
        BpkCommand::Show(args) => {
            let view = api.show_person(args.person_id)?;
            emit_json(serde_json::json!({
                "person_id": view.person.id,
                "bpk": view.bpk
            }))
        }
        BpkCommand::Reset(args) => {
            emit(&api.reset(&ResetRequest { person_ids: args.person_ids })?)
        }
        BpkCommand::Query(args) => emit(&api.query(&BpkQuery {
            first_name: args.first_name,
            last_name: args.last_name,
            birth_date: args.birth_date,
            postal_code: args.postal_code,
        })?),
    }
}

fn run_lookup(command: LookupCommand, api: &BpkApi) -> Result<()> {
    match command {
        LookupCommand::Run(args) => emit(&api.run_lookup_batch(BatchRequest {
            limit: args.limit,
            person_id: args.person_id,
        })?),
    }
}

fn run_merge(args: MergeArgs, api: &BpkApi) -> Result<()> {
    emit(&api.resolve_merge(&MergeRequest {
        main_person_id: args.main,
        other_person_ids: args.others,
    })?)
}

fn run_runs(command: RunsCommand, api: &BpkApi) -> Result<()> {
    match command {
        RunsCommand::List(args) => {
            let runs = api.list_runs(args.limit)?;
            emit_json(serde_json::json!({ "runs": runs }))
        }
    }
}
