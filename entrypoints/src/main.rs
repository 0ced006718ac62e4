use clap::Parser;
use flexpar_core::{FFModel, LossType, ModelArgs};

mod samples;

use samples::SampleModel;

#[derive(Parser, Debug)]
#[clap(author, version, about = "parallelization strategy search for sample models", long_about = None)]
struct Args {
    #[clap(flatten)]
    model: ModelArgs,
    #[clap(value_enum, default_value = "mlp", long, help = "sample model to compile")]
    sample: SampleModel,
    #[clap(value_enum, default_value = "sparse-categorical-cross-entropy", long)]
    loss: LossType,
    #[clap(long, help = "directory of the rolling log file, stderr when unset")]
    log_dir: Option<String>,
    #[clap(long, help = "also log to stderr when log_dir is set")]
    alsologtostderr: bool,
    #[clap(short, long)]
    verbose: bool,
}

fn run(args: &Args) -> anyhow::Result<FFModel> {
    let config = args.model.create_config()?;
    let comp_mode = config.comp_mode();
    let mut model = args.sample.build(config)?;
    model.compile(args.loss, comp_mode)?;
    if let Some(report) = model.search_report() {
        tracing::info!("search report:{}", serde_json::to_string(report)?);
    }
    Ok(model)
}

fn main() {
    let args = Args::parse();
    let _guard = common::init_tracing(args.log_dir.as_deref(), args.alsologtostderr, args.verbose);
    let mut reporter = match common::MetricsBuilder::new().install() {
        Ok(reporter) => Some(reporter),
        Err(e) => {
            tracing::warn!("metrics disabled:{}", e);
            None
        }
    };
    let result = run(&args);
    if let Some(reporter) = reporter.as_mut() {
        reporter.report();
    }
    match result {
        Ok(model) => {
            tracing::info!(
                "compiled {} into {} operators",
                args.sample,
                model.operators().len()
            );
        }
        Err(e) => {
            tracing::error!("failed to compile {}:{:?}", args.sample, e);
            std::process::exit(1);
        }
    }
}
