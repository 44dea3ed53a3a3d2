//! churn-runner: headless batch runner for the churn feature and retention
//! policy pipeline.
//!
//! Usage:
//!   churn-runner features     --synthetic 200 --seed 7 --asof 2026-02-01 --db churn.db
//!   churn-runner training-set --synthetic 200 --seed 7 --asof 2026-03-31 --out train.json
//!   churn-runner score        --sources silver.json --asof 2026-02-01 --model data/models/reference_model.json

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Months, NaiveDate};
use churn_core::{
    config::PipelineConfig,
    features::registry::FeatureRegistry,
    label::LabelRow,
    pipeline::{self, FeatureRunSummary, RunControl},
    scoring::{LogisticScorer, ModelArtifact},
    sources::SourceSnapshot,
    store::{ChurnStore, CommitOutcome},
    synth::{self, SynthConfig, Synthetic},
    types::{Date, EntityId},
};
use std::env;

const DEFAULT_ASOF: &str = "2026-02-01";

struct Inputs {
    sources:   SourceSnapshot,
    universe:  Vec<EntityId>,
    synthetic: Option<Synthetic>,
}

#[derive(serde::Serialize)]
struct TrainingSetOut<'a> {
    schema_version: &'a str,
    horizon_days:   u32,
    columns:        &'a [String],
    entity_ids:     &'a [EntityId],
    splits:         Vec<&'static str>,
    outcomes:       &'a [u8],
    rows:           &'a [Vec<f64>],
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    log::debug!("churn-runner args: {:?}", &args[1..]);
    let Some(command) = args.get(1).filter(|a| !a.starts_with("--")).cloned() else {
        bail!("usage: churn-runner <features|training-set|score> [options]");
    };
    let data_dir = flag(&args, "--data-dir").unwrap_or("./data");
    let db = flag(&args, "--db").unwrap_or(":memory:");
    let default_asof: Date = DEFAULT_ASOF.parse()?;
    let asof: Date = parse_arg(&args, "--asof", default_asof);

    println!("churn-runner {command}");
    println!("  data_dir:  {data_dir}");
    println!("  db:        {db}");
    println!("  asof:      {asof}");
    println!();

    let cfg = PipelineConfig::load(data_dir)?;
    let store = ChurnStore::open(db)?;
    store.migrate()?;
    let control = RunControl::new();

    match command.as_str() {
        "features" => {
            let inputs = load_inputs(&args, asof)?;
            let summary = run_features(&store, &cfg, &inputs, asof, &control)?;
            if let Some(out) = flag(&args, "--out") {
                let rows = store.feature_rows(asof, &summary.key.schema_version)?;
                std::fs::write(out, serde_json::to_string_pretty(&rows)?)
                    .with_context(|| format!("writing {out}"))?;
                println!("  wrote {} rows to {out}", rows.len());
            }
        }
        "training-set" => {
            let inputs = load_inputs(&args, asof)?;
            // Monthly as-of dates ending at --asof.
            let months = parse_arg(&args, "--months", 6u32);
            let dates: Vec<Date> = (0..months).rev()
                .filter_map(|back| month_end_back(asof, back))
                .collect();
            for d in &dates {
                run_features(&store, &cfg, &inputs, *d, &control)?;
            }

            let labels = match (flag(&args, "--labels"), &inputs.synthetic) {
                (Some(path), _) => LabelRow::load_all(path)?,
                (None, Some(synthetic)) => {
                    synthetic.labels(&dates, cfg.labels.horizon_days.unwrap_or(90))
                }
                (None, None) => bail!("training-set needs --labels FILE or --synthetic N"),
            };
            let set = pipeline::build_training_set(&store, &cfg, &labels, &cfg.features.schema_version)?;
            let registry = FeatureRegistry::standard(&cfg.features);
            let matrix = set.model_matrix(&registry);

            println!("=== TRAINING SET ===");
            println!("  schema:             {}", set.schema_version);
            println!("  horizon_days:       {}", set.horizon_days);
            println!("  examples:           {}", set.examples.len());
            println!("  columns:            {}", matrix.columns.len());
            println!("  unmatched features: {}", set.report.unmatched_features);
            println!("  unmatched labels:   {}", set.report.unmatched_labels);
            println!("  invalid labels:     {}", set.report.invalid_outcome + set.report.invalid_effective);
            println!("  other horizon:      {}", set.report.other_horizon);
            println!("  purged:             {}", set.report.purged);
            for (split, n) in &set.report.per_split {
                println!("  {:<19} {n}", format!("{}:", split.as_str()));
            }

            if let Some(out) = flag(&args, "--out") {
                let payload = TrainingSetOut {
                    schema_version: &set.schema_version,
                    horizon_days:   set.horizon_days,
                    columns:        &matrix.columns,
                    entity_ids:     &matrix.entity_ids,
                    splits:         matrix.splits.iter().map(|s| s.as_str()).collect(),
                    outcomes:       &matrix.outcomes,
                    rows:           &matrix.rows,
                };
                std::fs::write(out, serde_json::to_string(&payload)?)
                    .with_context(|| format!("writing {out}"))?;
                println!("  wrote model matrix to {out}");
            }
        }
        "score" => {
            let run_date: Date = parse_arg(&args, "--run-date", asof);
            let model_path = flag(&args, "--model")
                .map(str::to_string)
                .unwrap_or_else(|| format!("{data_dir}/models/reference_model.json"));
            let artifact = ModelArtifact::load(&model_path)?;

            let schema_version = cfg.features.schema_version.clone();
            let mut rows = store.feature_rows(asof, &schema_version)?;
            if rows.is_empty() {
                let inputs = load_inputs(&args, asof)?;
                run_features(&store, &cfg, &inputs, asof, &control)?;
                rows = store.feature_rows(asof, &schema_version)?;
            }

            let scorer = LogisticScorer::new(artifact, FeatureRegistry::standard(&cfg.features));
            let run_id = pipeline::new_run_id();
            let summary = pipeline::run_scoring(&store, &cfg, &scorer, &rows, run_date, &run_id, &control)?;

            println!("=== SCORING SUMMARY ===");
            println!("  run_id:              {}", summary.run_id);
            println!("  model:               {}", summary.model_id);
            println!("  outcome:             {}", describe(&summary.outcome));
            println!("  records:             {}", summary.records.len());
            println!("  rejected scores:     {}", summary.rejected);
            println!("  guardrail overrides: {}", summary.overrides);
            println!("  default reasons:     {}", summary.default_reasons);
            for (tier, n) in &summary.per_tier {
                println!("  tier {:<14} {n}", tier.as_str());
            }
            for (action, n) in &summary.per_action {
                println!("  action {:<12} {n}", action.as_str());
            }

            if let Some(out) = flag(&args, "--out") {
                std::fs::write(out, serde_json::to_string_pretty(&summary.records)?)
                    .with_context(|| format!("writing {out}"))?;
                println!("  wrote {} recommendations to {out}", summary.records.len());
            }
        }
        other => bail!("unknown command '{other}' (expected features, training-set or score)"),
    }
    Ok(())
}

fn load_inputs(args: &[String], asof: Date) -> Result<Inputs> {
    if let Some(path) = flag(args, "--sources") {
        let sources = SourceSnapshot::load(path)?;
        let universe = sources.known_entities();
        return Ok(Inputs { sources, universe, synthetic: None });
    }
    let customers = parse_arg(args, "--synthetic", 0usize);
    if customers == 0 {
        bail!("pass --sources FILE or --synthetic N");
    }
    let seed = parse_arg(args, "--seed", 42u64);
    let synthetic = synth::generate(&SynthConfig::new(customers, seed, asof));
    let universe = (0..customers).map(synth::customer_id).collect();
    Ok(Inputs { sources: synthetic.sources.clone(), universe, synthetic: Some(synthetic) })
}

fn run_features(
    store: &ChurnStore,
    cfg: &PipelineConfig,
    inputs: &Inputs,
    asof: Date,
    control: &RunControl,
) -> Result<FeatureRunSummary> {
    let run_id = pipeline::new_run_id();
    let summary = pipeline::run_features(store, cfg, &inputs.sources, &inputs.universe, asof, &run_id, control)?;
    print_feature_summary(&summary);
    Ok(summary)
}

fn print_feature_summary(summary: &FeatureRunSummary) {
    let a = &summary.assembly;
    println!("=== FEATURE RUN {} ===", summary.key.period_date);
    println!("  run_id:          {}", summary.run_id);
    println!("  schema:          {}", summary.key.schema_version);
    println!("  universe:        {}", summary.key.universe_key);
    println!("  outcome:         {}", describe(&summary.outcome));
    println!("  rows:            {}", a.rows);
    println!("  default rows:    {}", a.default_rows);
    println!("  tie-breaks:      {}", a.tie_breaks);
    println!("  collisions:      {}", a.aggregation.collisions);
    println!("  negative values: {}", a.aggregation.negative_values);
    for r in summary.sources.iter().filter(|r| r.excluded() > 0) {
        println!(
            "  excluded {:<16} {} (malformed={}, future={}, invalid={})",
            r.source, r.excluded(), r.malformed, r.future, r.invalid
        );
    }
    println!();
}

fn describe(outcome: &CommitOutcome) -> String {
    match outcome {
        CommitOutcome::Completed { rows_written, rows_already_recorded } => {
            format!("completed (written={rows_written}, already recorded={rows_already_recorded})")
        }
        CommitOutcome::Duplicate { of_record_run_id } => {
            format!("superseded by {of_record_run_id}")
        }
    }
}

/// Last day of the month `back` months before `asof`'s month; `back == 0`
/// is `asof` itself.
fn month_end_back(asof: Date, back: u32) -> Option<Date> {
    if back == 0 {
        return Some(asof);
    }
    let first = NaiveDate::from_ymd_opt(asof.year(), asof.month(), 1)?;
    let target = first.checked_sub_months(Months::new(back))?;
    target.checked_add_months(Months::new(1))?.pred_opt()
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr + Copy>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse().ok())
        .unwrap_or(default)
}
