//! Cohort matching command surface over a shared survey record table.
//!
//! Every command is one synchronous render pass — load, assign, aggregate,
//! print — with no retries: a fatal stage error ends the pass and surfaces
//! on stderr with the stage that failed. An empty record table is a soft
//! stop, reported as a `cohort_status.v1` payload with exit code 0.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use survey_cohort_core::{
    assign_all, assign_one, distinct_cluster_ids, median_age_band, partition_by_cluster,
    percent_breakdown, trait_scores, Assignment, ClusterId, Field, Record, TraitScores,
};
use survey_cohort_store_flatfile::{
    export_cluster_csv, export_file_name, AppendOutcome, SessionState,
};
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "cohort")]
#[command(about = "Survey cohort matching and group statistics")]
pub struct Cli {
    /// Directory holding the record table, model artifact, and catalog.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    Stats {
        #[command(subcommand)]
        command: StatsCommand,
    },
    Store {
        #[command(subcommand)]
        command: StoreCommand,
    },
    /// Cluster ids detected over the full record table (model health check).
    Clusters,
    Export(ExportArgs),
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Match a profile against the trained clusters and compare its group
    /// with the full population.
    Match(MatchArgs),
    /// Persist a profile into the record table (dedup append).
    Save(ProfileArgs),
}

#[derive(Debug, Subcommand)]
pub enum StatsCommand {
    Show(StatsShowArgs),
    Breakdown(BreakdownArgs),
}

#[derive(Debug, Subcommand)]
pub enum StoreCommand {
    List,
}

#[derive(Debug, Args)]
pub struct ProfileArgs {
    #[arg(long)]
    age: String,
    #[arg(long)]
    edu_level: String,
    #[arg(long)]
    fav_animals: String,
    #[arg(long)]
    fav_place: String,
    #[arg(long)]
    gender: String,
}

#[derive(Debug, Args)]
pub struct MatchArgs {
    #[command(flatten)]
    profile: ProfileArgs,

    /// Also persist the profile before matching.
    #[arg(long)]
    save: bool,
}

#[derive(Debug, Args)]
pub struct StatsShowArgs {
    #[arg(long)]
    cluster: u32,
}

#[derive(Debug, Args)]
pub struct BreakdownArgs {
    #[arg(long)]
    field: String,
    #[arg(long)]
    cluster: Option<u32>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    cluster: u32,
    /// Target directory; defaults to the data directory.
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when resource loading, assignment, or output fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let mut session = SessionState::open(&cli.data_dir);
    match cli.command {
        Command::Profile { command } => run_profile(command, &mut session),
        Command::Stats { command } => run_stats(command, &mut session),
        Command::Store { command } => run_store(command, &mut session),
        Command::Clusters => run_clusters(&mut session),
        Command::Export(args) => run_export(args, &cli.data_dir, &mut session),
    }
}

#[derive(Debug, Serialize)]
struct StatusPayload {
    contract_version: &'static str,
    status: &'static str,
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct GroupVsAll<T> {
    group: T,
    everyone: T,
}

#[derive(Debug, Serialize)]
struct ComparativeStats {
    median_age: GroupVsAll<&'static str>,
    trait_scores: GroupVsAll<TraitScores>,
    gender: GroupVsAll<BTreeMap<String, f64>>,
    edu_level: GroupVsAll<BTreeMap<String, f64>>,
    fav_place: GroupVsAll<BTreeMap<String, f64>>,
}

#[derive(Debug, Serialize)]
struct MatchPayload {
    contract_version: &'static str,
    profile: Record,
    cluster: ClusterId,
    name: String,
    description: String,
    group_size: usize,
    total_records: usize,
    catalog_clusters: usize,
    detected_cluster_ids: Vec<ClusterId>,
    stats: ComparativeStats,
}

#[derive(Debug, Serialize)]
struct SavePayload {
    contract_version: &'static str,
    outcome: AppendOutcome,
    total_records: usize,
}

#[derive(Debug, Serialize)]
struct StatsPayload {
    contract_version: &'static str,
    cluster: ClusterId,
    name: String,
    description: String,
    group_size: usize,
    total_records: usize,
    stats: ComparativeStats,
}

#[derive(Debug, Serialize)]
struct BreakdownPayload {
    contract_version: &'static str,
    field: &'static str,
    cluster: Option<ClusterId>,
    records: usize,
    breakdown: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
struct RecordsPayload {
    contract_version: &'static str,
    total_records: usize,
    records: Vec<Record>,
}

#[derive(Debug, Serialize)]
struct ClustersPayload {
    contract_version: &'static str,
    total_records: usize,
    detected_cluster_ids: Vec<ClusterId>,
}

#[derive(Debug, Serialize)]
struct ExportPayload {
    contract_version: &'static str,
    cluster: ClusterId,
    path: String,
    rows: usize,
}

fn run_profile(command: ProfileCommand, session: &mut SessionState) -> Result<()> {
    match command {
        ProfileCommand::Match(args) => {
            let profile = parse_profile(&args.profile)?;
            if args.save {
                let outcome = session
                    .append_record(&profile)
                    .context("failed to save profile")?;
                info!("profile save outcome: {outcome:?}");
            }

            let records = session
                .records()
                .context("failed to load record table")?;
            if records.is_empty() {
                return print_empty_store();
            }

            let model = session
                .model()
                .context("failed to load clustering model")?;
            let catalog = session
                .catalog()
                .context("failed to load cluster catalog")?;

            let cluster =
                assign_one(model.as_ref(), profile).context("failed to assign profile")?;
            let assignments = assign_all(model.as_ref(), &records)
                .context("failed to assign record table")?;
            let group = partition_by_cluster(&assignments, cluster);
            let display = catalog.profile(cluster);

            let payload = MatchPayload {
                contract_version: "cohort_match.v1",
                profile,
                cluster,
                name: display.name,
                description: display.description,
                group_size: group.len(),
                total_records: records.len(),
                catalog_clusters: catalog.len(),
                detected_cluster_ids: distinct_cluster_ids(&assignments),
                stats: comparative_stats(&group, &records),
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        ProfileCommand::Save(args) => {
            let profile = parse_profile(&args)?;
            let outcome = session
                .append_record(&profile)
                .context("failed to save profile")?;
            let total = session
                .records()
                .context("failed to load record table")?
                .len();

            let payload = SavePayload {
                contract_version: "cohort_save.v1",
                outcome,
                total_records: total,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn run_stats(command: StatsCommand, session: &mut SessionState) -> Result<()> {
    match command {
        StatsCommand::Show(args) => {
            let records = session
                .records()
                .context("failed to load record table")?;
            if records.is_empty() {
                return print_empty_store();
            }

            let model = session
                .model()
                .context("failed to load clustering model")?;
            let catalog = session
                .catalog()
                .context("failed to load cluster catalog")?;

            let target = ClusterId(args.cluster);
            let assignments = assign_all(model.as_ref(), &records)
                .context("failed to assign record table")?;
            let group = partition_by_cluster(&assignments, target);
            let display = catalog.profile(target);

            let payload = StatsPayload {
                contract_version: "cohort_stats.v1",
                cluster: target,
                name: display.name,
                description: display.description,
                group_size: group.len(),
                total_records: records.len(),
                stats: comparative_stats(&group, &records),
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        StatsCommand::Breakdown(args) => {
            let field = Field::parse(&args.field).ok_or_else(|| {
                anyhow!(
                    "unknown field {:?}; expected one of {:?}",
                    args.field,
                    Field::ALL.map(Field::as_str)
                )
            })?;

            let records = session
                .records()
                .context("failed to load record table")?;
            if records.is_empty() {
                return print_empty_store();
            }

            let target = args.cluster.map(ClusterId);
            let subset = match target {
                Some(cluster) => {
                    let model = session
                        .model()
                        .context("failed to load clustering model")?;
                    let assignments = assign_all(model.as_ref(), &records)
                        .context("failed to assign record table")?;
                    partition_by_cluster(&assignments, cluster)
                }
                None => records.as_ref().clone(),
            };

            let payload = BreakdownPayload {
                contract_version: "cohort_breakdown.v1",
                field: field.as_str(),
                cluster: target,
                records: subset.len(),
                breakdown: percent_breakdown(&subset, field),
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn run_store(command: StoreCommand, session: &mut SessionState) -> Result<()> {
    match command {
        StoreCommand::List => {
            let records = session
                .records()
                .context("failed to load record table")?;

            let payload = RecordsPayload {
                contract_version: "cohort_records.v1",
                total_records: records.len(),
                records: records.as_ref().clone(),
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}

fn run_clusters(session: &mut SessionState) -> Result<()> {
    let records = session
        .records()
        .context("failed to load record table")?;
    if records.is_empty() {
        return print_empty_store();
    }

    let model = session
        .model()
        .context("failed to load clustering model")?;
    let assignments =
        assign_all(model.as_ref(), &records).context("failed to assign record table")?;

    let payload = ClustersPayload {
        contract_version: "cohort_clusters.v1",
        total_records: records.len(),
        detected_cluster_ids: distinct_cluster_ids(&assignments),
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn run_export(args: ExportArgs, data_dir: &Path, session: &mut SessionState) -> Result<()> {
    let records = session
        .records()
        .context("failed to load record table")?;
    if records.is_empty() {
        return print_empty_store();
    }

    let model = session
        .model()
        .context("failed to load clustering model")?;
    let assignments =
        assign_all(model.as_ref(), &records).context("failed to assign record table")?;

    let target = ClusterId(args.cluster);
    let rows = group_size(&assignments, target);
    let bytes = export_cluster_csv(&assignments, target);

    let directory = args.output.unwrap_or_else(|| data_dir.to_path_buf());
    let file_name = export_file_name(target, OffsetDateTime::now_utc())?;
    let path = directory.join(file_name);
    std::fs::write(&path, bytes)
        .with_context(|| format!("failed to write export to {}", path.display()))?;
    info!("exported {rows} rows for cluster {target}");

    let payload = ExportPayload {
        contract_version: "cohort_export.v1",
        cluster: target,
        path: path.display().to_string(),
        rows,
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn parse_profile(args: &ProfileArgs) -> Result<Record> {
    let record = Record::from_fields(
        &args.age,
        &args.edu_level,
        &args.fav_animals,
        &args.fav_place,
        &args.gender,
    )
    .context("invalid profile")?;
    Ok(record)
}

fn comparative_stats(group: &[Record], everyone: &[Record]) -> ComparativeStats {
    ComparativeStats {
        median_age: GroupVsAll {
            group: median_age_band(group).as_str(),
            everyone: median_age_band(everyone).as_str(),
        },
        trait_scores: GroupVsAll {
            group: trait_scores(group),
            everyone: trait_scores(everyone),
        },
        gender: breakdown_pair(group, everyone, Field::Gender),
        edu_level: breakdown_pair(group, everyone, Field::EduLevel),
        fav_place: breakdown_pair(group, everyone, Field::FavPlace),
    }
}

fn breakdown_pair(
    group: &[Record],
    everyone: &[Record],
    field: Field,
) -> GroupVsAll<BTreeMap<String, f64>> {
    GroupVsAll {
        group: percent_breakdown(group, field),
        everyone: percent_breakdown(everyone, field),
    }
}

fn group_size(assignments: &[Assignment], target: ClusterId) -> usize {
    assignments
        .iter()
        .filter(|assignment| assignment.cluster == target)
        .count()
}

fn print_empty_store() -> Result<()> {
    let payload = StatusPayload {
        contract_version: "cohort_status.v1",
        status: "empty_store",
        message: "record table is empty; save at least one profile to enable group statistics",
    };
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
