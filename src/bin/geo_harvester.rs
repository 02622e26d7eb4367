use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;

use geo_harvester::cache::CacheStore;
use geo_harvester::config::{ConfigLoader, HarvestConfig, read_ids_file};
use geo_harvester::documents::{PmcDocumentSource, PmcHttpClient};
use geo_harvester::error::PipelineError;
use geo_harvester::geo::GeoHttpClient;
use geo_harvester::http::{HttpFetcher, RateLimits, RetryPolicy, build_client};
use geo_harvester::llm::client_for;
use geo_harvester::output::{JsonOutput, LogProgress, write_outputs};
use geo_harvester::pipeline::{Pipeline, ProgressSink};
use geo_harvester::pubmed::PubMedHttpClient;
use geo_harvester::sra::SraHttpClient;

#[derive(Parser)]
#[command(name = "geo-harvester")]
#[command(about = "Resolve GEO series into cross-referenced metadata and clinical fields")]
#[command(version, author)]
struct Cli {
    /// GEO series accessions (GSE...).
    accessions: Vec<String>,

    /// File with one accession per line, or a CSV with an `accession` column.
    #[arg(long)]
    ids_file: Option<Utf8PathBuf>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    out_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    cache_dir: Option<Utf8PathBuf>,

    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    workers: Option<u16>,

    #[arg(long)]
    enable_llm: bool,

    #[arg(long)]
    no_full_text: bool,

    /// Only print the JSON summary.
    #[arg(long)]
    quiet: bool,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<PipelineError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::ConfigRead(_)
        | PipelineError::ConfigParse(_)
        | PipelineError::ConfigInvalid(_)
        | PipelineError::InvalidAccession(_) => 2,
        PipelineError::TransientFetch { .. }
        | PipelineError::UpstreamStatus { .. }
        | PipelineError::Http { .. }
        | PipelineError::Provider { .. } => 3,
        _ => 1,
    }
}

fn apply_overrides(cli: &Cli, config: &mut HarvestConfig) {
    if let Some(out_dir) = &cli.out_dir {
        config.out_dir = out_dir.clone();
    }
    if let Some(cache_dir) = &cli.cache_dir {
        config.cache_dir = cache_dir.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = usize::from(workers);
    }
    if cli.enable_llm {
        config.llm.enabled = true;
    }
    if cli.no_full_text {
        config.fetch_full_text = false;
    }
}

fn collect_inputs(cli: &Cli, config: &HarvestConfig) -> miette::Result<Vec<String>> {
    let mut inputs = cli.accessions.clone();
    if let Some(path) = &cli.ids_file {
        inputs.extend(read_ids_file(path)?);
    }
    if inputs.is_empty() {
        inputs = config.accessions.clone();
    }
    if inputs.is_empty() {
        return Err(miette::Report::msg(
            "no accessions given (pass GSE ids, --ids-file, or `accessions` in the config)",
        ));
    }
    Ok(inputs)
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    apply_overrides(&cli, &mut config);
    let inputs = collect_inputs(&cli, &config)?;

    let cancel = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&cancel)).into_diagnostic()?;
    }

    let client = build_client(config.timeout_secs)?;
    let limits = RateLimits::from_config(&config);
    let retry = RetryPolicy::from_settings(&config.retry);
    let cache = Arc::new(CacheStore::new(config.cache_dir.clone()));
    tracing::info!("cache at {}", cache.root());

    let geo = GeoHttpClient::new(HttpFetcher::new(client.clone(), "geo", limits.geo.clone()));
    let sra = SraHttpClient::new(HttpFetcher::new(client.clone(), "sra", limits.sra.clone()));
    let pubmed = PubMedHttpClient::new(HttpFetcher::new(
        client.clone(),
        "pubmed",
        limits.pubmed.clone(),
    ));

    let mut pipeline =
        Pipeline::new(&config, cache.clone(), geo, sra, pubmed).with_cancel_flag(cancel.clone());
    if config.fetch_full_text {
        let pmc =
            PmcHttpClient::new(HttpFetcher::new(client.clone(), "pmc", limits.pubmed.clone()));
        pipeline = pipeline.with_documents(PmcDocumentSource::new(pmc, cache.clone(), retry));
    }
    if config.llm.enabled {
        let primary = client_for(&client, &config.llm.primary, &limits);
        let fallback = client_for(&client, &config.llm.fallback, &limits);
        match primary {
            Some(primary) => pipeline = pipeline.with_models(primary, fallback),
            None => tracing::warn!("primary model unavailable; model tiers disabled"),
        }
    }

    let sink: &dyn ProgressSink = if cli.quiet { &JsonOutput } else { &LogProgress };
    let report = pipeline.run(&inputs, sink)?;
    write_outputs(&config.out_dir, &report)?;
    JsonOutput::print_summary(&report.summary).into_diagnostic()?;

    if cancel.load(Ordering::SeqCst) {
        tracing::warn!("interrupted; rerun to resume from cache");
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}
