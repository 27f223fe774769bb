use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use labcalc_engine::{
    Analysis, CalculationWarning, EventSink, ExecutionEvent, ExecutionEventKind,
    MemoryReferenceFetcher, MemoryReferenceSource, Pad, PadKind, ParameterizedPipeline,
    PipelineExecutor, QueuedReferenceSource, RunConfig, calculate_sample, core_registry,
    drive_to_completion, execution_event_channel, load_pads_from_path, save_pads_to_path,
};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "labcalc")]
#[command(about = "Compile and run laboratory calculation pipelines")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Compile(CompileArgs),
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct CompileArgs {
    #[arg(long)]
    analysis: PathBuf,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    #[arg(long)]
    analysis: PathBuf,
    #[arg(long)]
    records: PathBuf,
    #[arg(long)]
    references: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = RunMode::Batch)]
    mode: RunMode,
    /// Record index for `single`; for `sample` and `full`, limits the run to
    /// one sample.
    #[arg(long)]
    target: Option<usize>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long = "no-stream-events", action = ArgAction::SetTrue)]
    no_stream_events: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    event_json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RunMode {
    Batch,
    Single,
    /// Aggregates samples whose replicates already carry a status.
    Sample,
    /// Recalculates each sample's replicates, then the sample.
    Full,
}

#[derive(Debug, Default)]
struct RunSummary {
    run_ids: Vec<String>,
    errors: Vec<String>,
    warnings: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Compile(args) => compile_command(args),
        Commands::Run(args) => run_command(args).await,
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::from(1)
        }
    }
}

fn compile_command(args: CompileArgs) -> Result<ExitCode, String> {
    let analysis = Analysis::load_from_path(&args.analysis).map_err(|e| e.to_string())?;
    let pipeline = ParameterizedPipeline::from_analysis(&analysis, &core_registry());

    if args.json {
        let report = json!({
            "analysis_id": pipeline.analysis_id(),
            "fingerprint": pipeline.fingerprint(),
            "required_input_columns": pipeline.required_input_columns(),
            "generated_output_columns": pipeline.generated_output_columns(),
            "output_formats": pipeline.compiled().output_column_to_format(),
            "errors": pipeline.errors(),
        });
        let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
        println!("{json}");
    } else {
        println!("analysis: {}", pipeline.analysis_id());
        println!("steps: {}", pipeline.step_count());
        println!(
            "required_input_columns: {}",
            pipeline.required_input_columns().join(", ")
        );
        println!(
            "generated_output_columns: {}",
            pipeline.generated_output_columns().join(", ")
        );
        for error in pipeline.errors() {
            println!("compile_error: {error}");
        }
    }

    if pipeline.has_blocking_errors() {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_command(args: RunArgs) -> Result<ExitCode, String> {
    let analysis = Analysis::load_from_path(&args.analysis).map_err(|e| e.to_string())?;
    let mut records = load_pads_from_path(&args.records).map_err(|e| e.to_string())?;
    let references = match args.references.as_deref() {
        Some(path) => MemoryReferenceSource::load_from_path(path).map_err(|e| e.to_string())?,
        None => MemoryReferenceSource::new(),
    };

    let pipeline = Arc::new(ParameterizedPipeline::from_analysis(
        &analysis,
        &core_registry(),
    ));
    for error in pipeline.errors() {
        tracing::warn!(analysis = pipeline.analysis_id(), "{error}");
    }

    let (events, event_task) = event_stream(!args.no_stream_events, args.event_json);
    let config = RunConfig {
        run_id: args.run_id.clone(),
        events,
        source: Arc::new(QueuedReferenceSource::new()),
        ..RunConfig::default()
    };
    let fetcher = MemoryReferenceFetcher::new(references);
    let mut summary = RunSummary::default();

    match args.mode {
        RunMode::Batch => {
            let executor =
                PipelineExecutor::batch(pipeline, records, config).map_err(|e| e.to_string())?;
            records = finish(executor, &fetcher, &mut summary).await?;
        }
        RunMode::Single => {
            let target = args
                .target
                .ok_or_else(|| "--target is required with --mode single".to_string())?;
            let executor = PipelineExecutor::single_record(pipeline, records, target, config)
                .map_err(|e| e.to_string())?;
            records = finish(executor, &fetcher, &mut summary).await?;
        }
        RunMode::Sample => {
            for index in sample_targets(&records, args.target) {
                let sample = records
                    .get(index)
                    .cloned()
                    .ok_or_else(|| format!("record {index} does not exist"))?;
                let executor = PipelineExecutor::sample(Arc::clone(&pipeline), sample, config.clone())
                    .map_err(|e| e.to_string())?;
                if let Some(sample) = finish(executor, &fetcher, &mut summary).await?.pop() {
                    records[index] = sample;
                }
            }
            drop(config);
        }
        RunMode::Full => {
            for index in sample_targets(&records, args.target) {
                let sample = records
                    .get(index)
                    .cloned()
                    .ok_or_else(|| format!("record {index} does not exist"))?;
                let outcome =
                    calculate_sample(Arc::clone(&pipeline), sample, config.clone(), &fetcher)
                        .await
                        .map_err(|e| e.to_string())?;
                summary.run_ids.extend(outcome.run_ids);
                summary
                    .errors
                    .extend(outcome.errors.iter().map(ToString::to_string));
                summary
                    .warnings
                    .extend(outcome.warnings.iter().map(format_warning));
                records[index] = outcome.sample;
            }
            drop(config);
        }
    }

    if let Some(task) = event_task {
        task.await.map_err(|error| error.to_string())?;
    }

    if let Some(path) = args.output.as_deref() {
        save_pads_to_path(&records, path).map_err(|e| e.to_string())?;
    }

    print_run_summary(&summary, &records);
    if summary.errors.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

async fn finish(
    mut executor: PipelineExecutor,
    fetcher: &MemoryReferenceFetcher,
    summary: &mut RunSummary,
) -> Result<Vec<Pad>, String> {
    drive_to_completion(&mut executor, fetcher)
        .await
        .map_err(|e| e.to_string())?;
    summary.run_ids.push(executor.run_id().to_string());
    summary
        .errors
        .extend(executor.errors().iter().map(ToString::to_string));
    summary
        .warnings
        .extend(executor.warnings().iter().map(format_warning));
    Ok(executor.into_records())
}

fn format_warning(warning: &CalculationWarning) -> String {
    format!(
        "record '{}' step {}: {}",
        warning.record_id, warning.step_position, warning.message
    )
}

fn sample_targets(records: &[Pad], target: Option<usize>) -> Vec<usize> {
    match target {
        Some(target) => vec![target],
        None => records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.kind == PadKind::Sample)
            .map(|(index, _)| index)
            .collect(),
    }
}

fn event_stream(
    stream_events: bool,
    event_json: bool,
) -> (EventSink, Option<tokio::task::JoinHandle<()>>) {
    if !stream_events {
        return (EventSink::default(), None);
    }

    let (tx, mut rx) = execution_event_channel();
    let task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event_json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(_) => print_event_text(&event),
                }
            } else {
                print_event_text(&event);
            }
        }
    });
    (EventSink::with_sender(tx), Some(task))
}

fn print_event_text(event: &ExecutionEvent) {
    println!(
        "[event seq={}] {} {}",
        event.sequence_no,
        event.timestamp,
        event_kind_label(&event.kind)
    );
}

fn event_kind_label(kind: &ExecutionEventKind) -> &'static str {
    match kind {
        ExecutionEventKind::RunStarted { .. } => "run_started",
        ExecutionEventKind::StepSkipped { .. } => "step_skipped",
        ExecutionEventKind::Suspended { .. } => "suspended",
        ExecutionEventKind::Resumed { .. } => "resumed",
        ExecutionEventKind::StepCompleted { .. } => "step_completed",
        ExecutionEventKind::StepFailed { .. } => "step_failed",
        ExecutionEventKind::RunFinished { .. } => "run_finished",
        ExecutionEventKind::RunInvalidated => "run_invalidated",
    }
}

fn print_run_summary(summary: &RunSummary, records: &[Pad]) {
    println!("run_id: {}", summary.run_ids.join(", "));
    for record in records {
        if let Some(status) = record.status() {
            println!("record {}: {}", record.id, status.as_str());
        }
        for child in record.children() {
            if let Some(status) = child.status() {
                println!("  child {}: {}", child.id, status.as_str());
            }
        }
    }
    for warning in &summary.warnings {
        println!("warning: {warning}");
    }
    for error in &summary.errors {
        println!("error: {error}");
    }
}
