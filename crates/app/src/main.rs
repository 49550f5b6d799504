mod annotator;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let config = annotator::PipelineConfig::from_args(&args)?;

    annotator::telemetry::init_tracing(config.verbose);
    annotator::telemetry::init_metrics_recorder();

    annotator::run(config)
}
