//! Operator command surface for the inventory tag engine.
//!
//! Every command opens the database, runs migrations and calls one
//! [`InventoryService`] operation. Results are printed as pretty JSON on
//! stdout; logs and errors go to stderr.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use inventory_tags_core::{
    parse_date, parse_weight, Actor, EngineConfig, EntityKind, Role, SubtagInput, Tag, TagPatch,
    TagStatus,
};
use inventory_tags_store_sqlite::InventoryService;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tags")]
#[command(about = "Inventory tag lifecycle and fractioning CLI")]
pub struct Cli {
    #[arg(long, default_value = "./inventory_tags.sqlite3")]
    db: PathBuf,

    /// JSON file with engine settings; missing keys keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter directive, e.g. `debug` or `inventory_tags_store_sqlite=info`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        self.log_level.as_deref()
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Migrate,
    Range(RangeArgs),
    Show(IdArgs),
    Receive(ReceiveArgs),
    Edit(EditArgs),
    Split(SplitArgs),
    SuggestLetter(IdArgs),
    Archive(ArchiveArgs),
    Counts,
    Calibers,
    Audit(AuditArgs),
    History(RangeArgs),
}

#[derive(Debug, Args)]
pub struct ActorArgs {
    #[arg(long)]
    actor: String,
    #[arg(long, value_enum, default_value_t = RoleArg::Operator)]
    role: RoleArg,
}

impl ActorArgs {
    fn to_actor(&self) -> Actor {
        Actor {
            name: self.actor.clone(),
            role: self.role.into(),
        }
    }
}

#[derive(Debug, Args)]
pub struct RangeArgs {
    #[arg(long)]
    low: i64,
    #[arg(long)]
    high: i64,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct ReceiveArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    id: i64,
    #[arg(long)]
    weight: String,
    #[arg(long)]
    caliber: Option<String>,
    #[arg(long)]
    client: Option<String>,
    #[arg(long)]
    supplier: Option<String>,
    #[arg(long)]
    expiry: Option<String>,
}

#[derive(Debug, Args)]
pub struct EditArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    id: i64,
    /// `field=value`; repeat for several fields.
    #[arg(long = "set", required = true)]
    set: Vec<String>,
}

#[derive(Debug, Args)]
pub struct SplitArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long)]
    id: i64,
    #[arg(long)]
    letter: String,
    #[arg(long)]
    client: String,
    #[arg(long)]
    weight: String,
    #[arg(long, default_value = "reserved")]
    status: String,
    /// Parent tag fields saved before the subtag; status defaults to open.
    #[arg(long = "set")]
    set: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ArchiveArgs {
    #[command(flatten)]
    actor: ActorArgs,
    #[arg(long = "id", required = true)]
    ids: Vec<i64>,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    #[arg(long, value_enum)]
    kind: KindArg,
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RoleArg {
    Viewer,
    Operator,
}

impl From<RoleArg> for Role {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Viewer => Self::Viewer,
            RoleArg::Operator => Self::Operator,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Tag,
    Subtag,
    Order,
}

impl From<KindArg> for EntityKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Tag => Self::Tag,
            KindArg::Subtag => Self::Subtag,
            KindArg::Order => Self::Order,
        }
    }
}

/// Installs the stderr log subscriber. An explicit level wins over `RUST_LOG`;
/// without either only warnings are shown.
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(db = %cli.db.display(), command = ?cli.command, "running command");
    let mut service = InventoryService::open(&cli.db, config)?;
    run_command(cli.command, &cli.db, &mut service)
}

pub fn run_command(command: Command, db: &Path, service: &mut InventoryService) -> Result<()> {
    match command {
        Command::Migrate => print_json(&serde_json::json!({
            "migrated": true,
            "db": db.display().to_string(),
        })),
        Command::Range(args) => print_json(&service.load_range(args.low, args.high)?),
        Command::Show(args) => {
            let tag = service.tag(args.id)?;
            let subtags = service.subtags(args.id)?;
            let saldo = service.saldo(args.id)?;
            print_json(&serde_json::json!({
                "tag": tag,
                "subtags": subtags,
                "saldo": saldo,
            }))
        }
        Command::Receive(args) => {
            let tag = Tag {
                caliber: args.caliber,
                weight: parse_weight(&args.weight)?,
                client: args.client,
                supplier: args.supplier,
                expiry: args.expiry.as_deref().map(parse_date).transpose()?,
                ..Tag::empty(args.id)
            };
            let received = service.receive(&[tag], &args.actor.to_actor())?;
            print_json(&serde_json::json!({ "received": received }))
        }
        Command::Edit(args) => {
            let patch = TagPatch::from_fields(args.id, &parse_assignments(&args.set)?)?;
            print_json(&service.save_edits(&[patch], &args.actor.to_actor())?)
        }
        Command::Split(args) => {
            let mut parent = TagPatch::from_fields(args.id, &parse_assignments(&args.set)?)?;
            if parent.status.is_none() {
                parent.status = Some(TagStatus::Open);
            }
            let status = TagStatus::from_label(Some(&args.status))
                .ok_or_else(|| anyhow!("unknown subtag status: {}", args.status))?;
            let subtag = SubtagInput {
                tag_id: args.id,
                letter: args.letter,
                client: args.client,
                weight: parse_weight(&args.weight)?,
                status,
            };
            print_json(&service.split(&parent, &subtag, &args.actor.to_actor())?)
        }
        Command::SuggestLetter(args) => print_json(&serde_json::json!({
            "tag_id": args.id,
            "letter": service.suggest_letter(args.id)?,
        })),
        Command::Archive(args) => print_json(&service.archive(&args.ids, &args.actor.to_actor())?),
        Command::Counts => print_json(&service.global_counts()?),
        Command::Calibers => print_json(&service.caliber_options()?),
        Command::Audit(args) => print_json(&service.audit_trail(args.kind.into(), args.id)?),
        Command::History(args) => print_json(&service.history_range(args.low, args.high)?),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    Ok(EngineConfig::from_json(&value)?)
}

fn parse_assignments(raw: &[String]) -> Result<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    for item in raw {
        let (name, value) = item
            .split_once('=')
            .ok_or_else(|| anyhow!("expected field=value, got {item:?}"))?;
        if name.trim().is_empty() {
            return Err(anyhow!("field name MUST be provided in {item:?}"));
        }
        fields.insert(name.trim().to_string(), value.to_string());
    }
    Ok(fields)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
