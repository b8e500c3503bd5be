use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use featmgr_core::{
    BootFeatureConfigurationState, EnabledStateOptions, FeatureConfigurationOperation,
    FeatureConfigurationSection, FeatureConfigurationUpdate, FeatureEnabledState, FeatureManager,
    FeaturePriority, FeatureUsageReport, FeatureUsageSubscription, StoreLayout, VariantPayloadKind,
};
use featmgr_store_sqlite::{SqliteFeatureKernel, SqliteHive};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "FEATMGR_LOG";

type Manager = FeatureManager<SqliteFeatureKernel, SqliteHive>;

#[derive(Debug, Parser)]
#[command(name = "featmgr")]
#[command(about = "Feature configuration store CLI")]
struct Cli {
    /// Database holding the boot-store hive and the emulated kernel state.
    #[arg(long, global = true, default_value = "./featmgr.sqlite3")]
    db: PathBuf,

    /// JSON file overriding hive paths of the boot store.
    #[arg(long, global = true)]
    layout: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Query(QueryArgs),
    ChangeStamp,
    Set(SetArgs),
    Reset(ResetArgs),
    FullReset(FullResetArgs),
    Subs {
        #[command(subcommand)]
        command: SubsCommand,
    },
    NotifyUsage(NotifyUsageArgs),
    FixLkg,
    BootState {
        #[command(subcommand)]
        command: BootStateCommand,
    },
    Export(ExportArgs),
    Import(ImportArgs),
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long, value_delimiter = ',')]
    id: Vec<u32>,
    #[arg(long, value_enum, default_value_t = SectionArg::Runtime)]
    section: SectionArg,
    /// List boot overrides that are written but not yet loaded.
    #[arg(long, default_value_t = false)]
    pending: bool,
}

#[derive(Debug, Args)]
struct StoreArgs {
    #[arg(long, value_enum, default_value_t = StoreArg::Both)]
    store: StoreArg,
    /// Change stamp the caller last observed; zero skips the check.
    #[arg(long, default_value_t = 0)]
    stamp: u64,
}

#[derive(Debug, Args)]
struct SetArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    id: Vec<u32>,
    #[arg(long, default_value = "user", value_parser = parse_priority)]
    priority: FeaturePriority,
    #[arg(long, value_enum)]
    state: Option<StateArg>,
    #[arg(long, default_value_t = false)]
    experiment: bool,
    #[arg(long)]
    variant: Option<u32>,
    #[arg(long, value_enum, default_value_t = PayloadKindArg::None)]
    payload_kind: PayloadKindArg,
    #[arg(long, default_value_t = 0)]
    payload: u32,
    #[command(flatten)]
    target: StoreArgs,
}

#[derive(Debug, Args)]
struct ResetArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    id: Vec<u32>,
    #[arg(long, default_value = "user", value_parser = parse_priority)]
    priority: FeaturePriority,
    #[command(flatten)]
    target: StoreArgs,
}

#[derive(Debug, Args)]
struct FullResetArgs {
    #[arg(long, value_enum, default_value_t = StoreArg::Both)]
    store: StoreArg,
}

#[derive(Debug, Subcommand)]
enum SubsCommand {
    Query(SubsQueryArgs),
    Add(SubsArgs),
    Remove(SubsArgs),
}

#[derive(Debug, Args)]
struct SubsQueryArgs {
    #[arg(long, value_enum, default_value_t = SectionArg::Runtime)]
    section: SectionArg,
}

#[derive(Debug, Args)]
struct SubsArgs {
    #[arg(long, value_delimiter = ',', required = true)]
    id: Vec<u32>,
    #[arg(long, default_value_t = 0)]
    kind: u16,
    #[arg(long, default_value_t = 0)]
    options: u16,
    #[arg(long, default_value_t = 0)]
    target: u64,
    #[arg(long, value_enum, default_value_t = StoreArg::Both)]
    store: StoreArg,
}

#[derive(Debug, Args)]
struct NotifyUsageArgs {
    #[arg(long)]
    id: u32,
    #[arg(long)]
    kind: u16,
    #[arg(long, default_value_t = 0)]
    options: u16,
}

#[derive(Debug, Subcommand)]
enum BootStateCommand {
    Get,
    Set(BootStateSetArgs),
    /// Recreate the boot status data, returning the state to uninitialized.
    Init,
}

#[derive(Debug, Args)]
struct BootStateSetArgs {
    #[arg(long, value_enum)]
    state: BootStateArg,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SectionArg {
    Runtime,
    Boot,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreArg {
    Runtime,
    Boot,
    Both,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Default,
    Disabled,
    Enabled,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PayloadKindArg {
    None,
    Resident,
    External,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BootStateArg {
    Uninitialized,
    BootPending,
    LkgPending,
    RollbackPending,
    Committed,
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

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut manager = open_manager(&cli.db, cli.layout.as_deref())?;
    match cli.command {
        Command::Query(args) => run_query(&args, &manager),
        Command::ChangeStamp => {
            emit_json(serde_json::json!({ "change_stamp": manager.change_stamp()? }))
        }
        Command::Set(args) => run_set(&args, &mut manager),
        Command::Reset(args) => run_reset(&args, &mut manager),
        Command::FullReset(args) => run_full_reset(&args, &mut manager),
        Command::Subs { command } => run_subs(command, &mut manager),
        Command::NotifyUsage(args) => {
            let report = FeatureUsageReport {
                feature_id: args.id,
                reporting_kind: args.kind,
                reporting_options: args.options,
            };
            manager.notify_usage(&report)?;
            emit_json(serde_json::json!({ "notified": report }))
        }
        Command::FixLkg => emit_json(serde_json::json!({ "lkg_repair": manager.fix_lkg_store() })),
        Command::BootState { command } => run_boot_state(&command, &mut manager),
        Command::Export(args) => run_export(&args, &manager),
        Command::Import(args) => run_import(&args, &mut manager),
    }
}

fn open_manager(db: &Path, layout: Option<&Path>) -> Result<Manager> {
    let layout = match layout {
        Some(path) => {
            let body = fs::read_to_string(path)
                .with_context(|| format!("failed to read layout file {}", path.display()))?;
            StoreLayout::from_json_str(&body)
                .with_context(|| format!("invalid layout file {}", path.display()))?
        }
        None => StoreLayout::default(),
    };
    let kernel = SqliteFeatureKernel::open(db)?;
    let hive = SqliteHive::open(db)?;
    tracing::debug!(db = %db.display(), "opened feature stores");
    Ok(FeatureManager::new(kernel, hive, layout))
}

fn run_query(args: &QueryArgs, manager: &Manager) -> Result<()> {
    let section = args.section.into_section();
    if args.pending {
        let pending = manager.pending_boot_overrides()?;
        return emit_json(serde_json::json!({ "section": "boot", "pending": pending }));
    }

    if args.id.is_empty() {
        let (records, change_stamp) = manager.query_all(section)?;
        return emit_json(serde_json::json!({
            "section": section,
            "change_stamp": change_stamp,
            "records": records
        }));
    }

    let mut records = Vec::with_capacity(args.id.len());
    let mut missing = Vec::new();
    for feature_id in &args.id {
        match manager.query(*feature_id, section)? {
            Some(record) => records.push(record),
            None => missing.push(*feature_id),
        }
    }
    emit_json(serde_json::json!({
        "section": section,
        "records": records,
        "missing": missing
    }))
}

fn run_set(args: &SetArgs, manager: &mut Manager) -> Result<()> {
    let mut operation = FeatureConfigurationOperation::NONE;
    if args.state.is_some() {
        operation |= FeatureConfigurationOperation::FEATURE_STATE;
    }
    if args.variant.is_some() {
        operation |= FeatureConfigurationOperation::VARIANT_STATE;
    }
    if operation.is_empty() {
        return Err(anyhow!("set requires --state, --variant or both"));
    }

    let mut updates = Vec::with_capacity(args.id.len());
    for feature_id in &args.id {
        let mut update = FeatureConfigurationUpdate::new(*feature_id, args.priority);
        if let Some(state) = args.state {
            update.set_enabled_state(state.into_enabled_state())?;
            if args.experiment {
                update.set_enabled_state_options(EnabledStateOptions::WexpConfig);
            }
        }
        if let Some(variant) = args.variant {
            update.set_variant(variant)?;
            update.set_variant_payload_kind(args.payload_kind.into_payload_kind());
            update.set_variant_payload(args.payload);
        }
        update.set_operation(operation);
        updates.push(update);
    }
    apply_to_stores(&updates, &args.target, manager)
}

fn run_reset(args: &ResetArgs, manager: &mut Manager) -> Result<()> {
    let updates = args
        .id
        .iter()
        .map(|feature_id| FeatureConfigurationUpdate::reset(*feature_id, args.priority))
        .collect::<Vec<_>>();
    apply_to_stores(&updates, &args.target, manager)
}

fn apply_to_stores(
    updates: &[FeatureConfigurationUpdate],
    target: &StoreArgs,
    manager: &mut Manager,
) -> Result<()> {
    let mut previous = target.stamp;
    let mut reports = Vec::new();
    for section in target.store.sections() {
        let report = manager
            .apply(updates, section, &mut previous)
            .with_context(|| format!("failed to apply updates to the {} store", section.as_str()))?;
        reports.push(report);
    }
    emit_json(serde_json::json!({ "change_stamp": previous, "applied": reports }))
}

fn run_full_reset(args: &FullResetArgs, manager: &mut Manager) -> Result<()> {
    let mut reports = Vec::new();
    for section in args.store.sections() {
        reports.push(manager.full_reset(section)?);
    }
    emit_json(serde_json::json!({ "applied": reports }))
}

fn run_subs(command: SubsCommand, manager: &mut Manager) -> Result<()> {
    match command {
        SubsCommand::Query(args) => {
            let section = args.section.into_section();
            let subscriptions = manager.subscriptions(section)?;
            emit_json(serde_json::json!({
                "section": section,
                "subscriptions": subscriptions
            }))
        }
        SubsCommand::Add(args) => {
            let subscriptions = args.subscriptions();
            for section in args.store.sections() {
                manager.add_subscriptions(&subscriptions, section)?;
            }
            emit_json(serde_json::json!({ "added": subscriptions }))
        }
        SubsCommand::Remove(args) => {
            let subscriptions = args.subscriptions();
            for section in args.store.sections() {
                manager.remove_subscriptions(&subscriptions, section)?;
            }
            emit_json(serde_json::json!({ "removed": subscriptions }))
        }
    }
}

fn run_boot_state(command: &BootStateCommand, manager: &mut Manager) -> Result<()> {
    match command {
        BootStateCommand::Get => {
            emit_json(serde_json::json!({ "boot_state": manager.boot_state()? }))
        }
        BootStateCommand::Set(args) => {
            let state = args.state.into_boot_state();
            manager.set_boot_state(state)?;
            emit_json(serde_json::json!({ "boot_state": state }))
        }
        BootStateCommand::Init => {
            manager.initialize_boot_status_data_file()?;
            emit_json(serde_json::json!({
                "initialized": true,
                "boot_state": manager.boot_state()?,
            }))
        }
    }
}

fn run_export(args: &ExportArgs, manager: &Manager) -> Result<()> {
    let snapshot = manager.snapshot()?;
    let blob = snapshot.to_bytes()?;
    fs::write(&args.out, &blob)
        .with_context(|| format!("failed to write export file {}", args.out.display()))?;
    emit_json(serde_json::json!({
        "out": args.out,
        "bytes": blob.len(),
        "runtime_records": snapshot.runtime.len(),
        "boot_records": snapshot.boot.len()
    }))
}

fn run_import(args: &ImportArgs, manager: &mut Manager) -> Result<()> {
    let blob = fs::read(&args.input)
        .with_context(|| format!("failed to read import file {}", args.input.display()))?;
    let summary = manager.import(&blob)?;
    emit_json(serde_json::to_value(&summary).context("failed to serialize import summary")?)
}

fn parse_priority(value: &str) -> Result<FeaturePriority, String> {
    value.parse::<FeaturePriority>().map_err(|err| err.to_string())
}

impl SubsArgs {
    fn subscriptions(&self) -> Vec<FeatureUsageSubscription> {
        self.id
            .iter()
            .map(|feature_id| FeatureUsageSubscription {
                feature_id: *feature_id,
                reporting_kind: self.kind,
                reporting_options: self.options,
                reporting_target: self.target,
            })
            .collect()
    }
}

impl SectionArg {
    fn into_section(self) -> FeatureConfigurationSection {
        match self {
            Self::Runtime => FeatureConfigurationSection::Runtime,
            Self::Boot => FeatureConfigurationSection::Boot,
        }
    }
}

impl StoreArg {
    fn sections(self) -> Vec<FeatureConfigurationSection> {
        match self {
            Self::Runtime => vec![FeatureConfigurationSection::Runtime],
            Self::Boot => vec![FeatureConfigurationSection::Boot],
            Self::Both => {
                vec![FeatureConfigurationSection::Runtime, FeatureConfigurationSection::Boot]
            }
        }
    }
}

impl StateArg {
    fn into_enabled_state(self) -> FeatureEnabledState {
        match self {
            Self::Default => FeatureEnabledState::Default,
            Self::Disabled => FeatureEnabledState::Disabled,
            Self::Enabled => FeatureEnabledState::Enabled,
        }
    }
}

impl PayloadKindArg {
    fn into_payload_kind(self) -> VariantPayloadKind {
        match self {
            Self::None => VariantPayloadKind::None,
            Self::Resident => VariantPayloadKind::Resident,
            Self::External => VariantPayloadKind::External,
        }
    }
}

impl BootStateArg {
    fn into_boot_state(self) -> BootFeatureConfigurationState {
        match self {
            Self::Uninitialized => BootFeatureConfigurationState::Uninitialized,
            Self::BootPending => BootFeatureConfigurationState::BootPending,
            Self::LkgPending => BootFeatureConfigurationState::LkgPending,
            Self::RollbackPending => BootFeatureConfigurationState::RollbackPending,
            Self::Committed => BootFeatureConfigurationState::Committed,
        }
    }
}
