use station_rca::analysis::{AnalysisOutcome, AnalysisWorker, NoProgress, Progress, StationSelection};
use station_rca::config::AppConfig;
use station_rca::datasource::SqliteSource;
use station_rca::features::{collect_features_all, CoverageChecker};
use station_rca::observability;
use station_rca::report::ng_root_causes;
use station_rca::rule_document::RuleDocument;
use station_rca::rule_tree::{RuleNode, RuleParseOptions};
use station_rca::session::{auto_run, Session};
use station_rca::table::{read_csv, text_column, write_csv, PREDICTION_COLUMN};
use station_rca::troubleshooting::TroubleshootingGuide;
use station_rca::RcaError;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "station-rca")]
#[command(about = "Rule-based root cause analysis for production test stations")]
#[command(version)]
struct Args {
    /// Log filter (overrides RUST_LOG), e.g. "debug" or "station_rca=debug"
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Rule parsing switches shared by the commands that load rules directly.
#[derive(clap::Args, Clone, Copy, Default)]
struct ParseFlags {
    /// Reject malformed rule nodes instead of classifying them as Unknown
    #[arg(long)]
    strict: bool,

    /// Treat OK / NG keys as exact-match branch labels
    #[arg(long)]
    route_verdict_labels: bool,
}

impl ParseFlags {
    fn options(self) -> RuleParseOptions {
        RuleParseOptions {
            strict: self.strict,
            route_verdict_labels: self.route_verdict_labels,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the rows of a CSV station table
    Classify {
        /// Rules document (JSON)
        #[arg(short, long, default_value = "rules.json")]
        rules: PathBuf,

        /// Station whose rules apply
        #[arg(short, long)]
        station: String,

        /// Model of the station (default: first model declared)
        #[arg(short, long)]
        model: Option<String>,

        /// Station table as CSV
        #[arg(short, long)]
        input: PathBuf,

        /// Write the table with Prediction, Root_Cause and Match_Path columns here
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        parse: ParseFlags,
    },
    /// Automatic run: retrieve the configured window, analyze, write the report
    Run {
        /// Application config (JSON)
        #[arg(short, long, default_value = "app_config.json")]
        config: PathBuf,

        /// Rules document (JSON)
        #[arg(short, long, default_value = "rules.json")]
        rules: PathBuf,

        /// Troubleshooting document (JSON)
        #[arg(short, long, default_value = "troubleshootings.json")]
        troubleshooting: PathBuf,

        /// Save the run log here
        #[arg(long)]
        log_file: Option<PathBuf>,
    },
    /// List the features the rules reference, optionally checked against a table
    Features {
        /// Rules document (JSON)
        #[arg(short, long, default_value = "rules.json")]
        rules: PathBuf,

        /// Only this station
        #[arg(short, long)]
        station: Option<String>,

        /// Only this model
        #[arg(short, long)]
        model: Option<String>,

        /// CSV table whose columns should cover the features
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[command(flatten)]
        parse: ParseFlags,
    },
    /// Strictly parse every rule tree of a rules document
    Validate {
        /// Rules document (JSON)
        #[arg(short, long, default_value = "rules.json")]
        rules: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let args = Args::parse();
    let logs = observability::init(args.log_level.as_deref())?;

    match args.command {
        Commands::Classify { rules, station, model, input, output, parse } => {
            classify_table(rules, station, model, input, output, parse.options())
        }
        Commands::Run { config, rules, troubleshooting, log_file } => {
            let result = run_auto(config, rules, troubleshooting, logs.clone()).await;
            if let Err(e) = &result {
                error!("{}", e);
            }
            if let Some(path) = log_file {
                logs.save(&path)?;
                println!("Log saved to {}", path.display());
            }
            result
        }
        Commands::Features { rules, station, model, input, parse } => {
            list_features(rules, station, model, input, parse.options())
        }
        Commands::Validate { rules } => validate_rules(rules),
    }
}

fn classify_table(
    rules_path: PathBuf,
    station: String,
    model: Option<String>,
    input: PathBuf,
    output: Option<PathBuf>,
    options: RuleParseOptions,
) -> Result<()> {
    let rules = RuleDocument::load(&rules_path, options)?;
    let model = match model {
        Some(model) => model,
        None => rules
            .first_model(&station)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No models for station {} in {}", station, rules_path.display()))?,
    };
    if rules.active_rule(&station, &model).is_none() {
        return Err(anyhow!("No active rule tree for station {}, model {}", station, model));
    }

    let table = read_csv(&input)?;
    info!("Loaded {} rows from {}", table.height(), input.display());
    let mut tables = HashMap::new();
    tables.insert(station.clone(), table);

    let worker = AnalysisWorker::new(Arc::new(rules));
    let outcome = worker.run(&tables, &[StationSelection::new(station.as_str(), model.as_str())], &NoProgress)?;
    let mut analyzed = match outcome {
        AnalysisOutcome::Completed(analyzed) => analyzed,
        AnalysisOutcome::Canceled => return Err(RcaError::Canceled.into()),
    };
    let Some(result) = analyzed.pop() else {
        println!("No rows to classify in {}", input.display());
        return Ok(());
    };

    let verdicts = text_column(&result.frame, PREDICTION_COLUMN)?
        .into_iter()
        .flatten()
        .counts();
    println!("\n{} / {}: {} rows", station, model, result.frame.height());
    for (verdict, count) in verdicts.iter().sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0))) {
        println!("   {:<10} {}", verdict, count);
    }
    let causes = ng_root_causes(&result.frame)?;
    if !causes.is_empty() {
        println!("\nNG root causes:");
        for cause in causes {
            println!("   {:>5}  {}", cause.count, cause.cause);
        }
    }

    if let Some(path) = output {
        let mut frame = result.frame;
        write_csv(&mut frame, &path)?;
        println!("\nWrote {}", path.display());
    }
    Ok(())
}

async fn run_auto(
    config_path: PathBuf,
    rules_path: PathBuf,
    troubleshooting_path: PathBuf,
    logs: observability::LogBuffer,
) -> Result<()> {
    let mut config = AppConfig::load_or_default(&config_path);
    config.validate_run_settings()?;

    let rules = RuleDocument::load(&rules_path, config.parse_options())?;
    let troubleshooting = TroubleshootingGuide::load_or_empty(&troubleshooting_path);
    let source = SqliteSource::open(&config.database)?;

    let mut session = Session::new(rules, troubleshooting, logs);
    let progress = Arc::new(|p: Progress| {
        if p.total > 0 && p.done % 1000 == 0 {
            info!("Analyzed {}/{} rows ({}%)", p.done, p.total, p.percent());
        }
    });

    match auto_run(&mut session, &mut config, &config_path, &source, progress).await? {
        Some(path) => {
            println!("Report written to {}", path.display());
            Ok(())
        }
        None => Err(RcaError::Canceled.into()),
    }
}

fn list_features(
    rules_path: PathBuf,
    station: Option<String>,
    model: Option<String>,
    input: Option<PathBuf>,
    options: RuleParseOptions,
) -> Result<()> {
    let rules = RuleDocument::load(&rules_path, options)?;
    if let Some(station) = &station {
        if !rules.contains_station(station) {
            return Err(anyhow!("Station {} not found in {}", station, rules_path.display()));
        }
    }

    let features = collect_features_all(
        rules
            .stations()
            .filter(|s| station.as_deref().map_or(true, |wanted| s.name == wanted))
            .flat_map(|s| s.models.iter())
            .filter(|m| model.as_deref().map_or(true, |wanted| m.name == wanted))
            .map(|m| &m.raw_rules),
    );

    println!("{} features referenced:", features.len());
    for feature in &features {
        println!("   {}", feature);
    }

    if let Some(input) = input {
        let table = read_csv(&input)?;
        let columns = table.get_column_names();
        let coverage = CoverageChecker::default().check(&features, &columns);
        if coverage.is_complete() {
            println!("\nAll features present in {}", input.display());
        } else {
            println!("\nMissing from {}:", input.display());
            for missing in &coverage.missing {
                match &missing.suggestion {
                    Some(column) => println!(
                        "   {} (did you mean '{}'? similarity {:.2})",
                        missing.feature, column, missing.similarity
                    ),
                    None => println!("   {}", missing.feature),
                }
            }
        }
    }
    Ok(())
}

fn validate_rules(rules_path: PathBuf) -> Result<()> {
    let rules = RuleDocument::load(&rules_path, RuleParseOptions::strict())?;
    for station in rules.stations() {
        for model in &station.models {
            let nodes: usize = model.rules.iter().map(RuleNode::node_count).sum();
            let status = if model.active_rule().is_some() { "ok" } else { "no active tree" };
            println!("   {} / {}: {} nodes, {}", station.name, model.name, nodes, status);
        }
    }
    println!("{} is valid ({} stations)", rules_path.display(), rules.len());
    Ok(())
}
