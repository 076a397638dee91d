use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tl_adapters::{GoogleNewsFeed, StatsSiteConfig, StatsSiteProfileLookup, StatsSiteSource};
use tl_pipeline::{Consolidator, CrawlConfig, CrawlOrchestrator, RunOutcome, TeamRankTable};
use tl_predict::{
    BacktestConfig, BacktestRunner, EnsembleScorer, HttpScoreModel, OpenAiChat, PredictConfig,
    TransferClassifier,
};
use tl_storage::{FsObjectStore, HttpClientConfig, HttpFetcher, ObjectStore};
use tl_web::{AppState, WebConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

#[derive(Debug, Parser)]
#[command(name = "tl-cli")]
#[command(about = "Transferlens command-line interface")]
struct Cli {
    /// Object-store root directory (falls back to TL_DATA_DIR, then ./data).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One bounded crawl run: at most one team, resumed from the checkpoint.
    Crawl {
        /// Reset the checkpoint to {0,0} instead of crawling.
        #[arg(long)]
        reset: bool,
    },
    /// Fold raw partitions into the combined dataset and archive them.
    Consolidate,
    /// Score one player by name.
    Predict { name: String },
    /// Replay archived partitions against the scorer.
    Backtest {
        #[arg(long, default_value_t = 0.6)]
        threshold: f64,
        /// Resume the archive sweep at this key.
        #[arg(long)]
        from_key: Option<String>,
    },
    /// Serve the prediction API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| std::env::var("TL_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./data"));
    let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(data_dir));
    let crawl_config = CrawlConfig::from_env();

    match cli.command {
        Commands::Crawl { reset } => {
            let http = site_fetcher()?;
            let source = Arc::new(StatsSiteSource::new(http, StatsSiteConfig::from_env()));
            let ranks = TeamRankTable::from_workspace_root(Path::new("."))?;
            let orchestrator = CrawlOrchestrator::new(source, store, ranks, crawl_config);

            if reset {
                orchestrator.reset().await?;
                println!("checkpoint reset to {{0,0}}");
                return Ok(());
            }

            match orchestrator.run_once().await? {
                RunOutcome::AllDone => println!("all teams done"),
                RunOutcome::TeamCompleted {
                    team_index,
                    team_name,
                    players_appended,
                } => println!(
                    "processed team #{team_index} {team_name}: {players_appended} players appended"
                ),
                RunOutcome::Failed {
                    team_index,
                    player_index,
                    reason,
                } => {
                    eprintln!("failed at team #{team_index} player #{player_index}: {reason}");
                    std::process::exit(1);
                }
            }
        }
        Commands::Consolidate => {
            let summary = Consolidator::new(store, crawl_config).run_once().await?;
            println!(
                "consolidated {} partitions ({} rows merged)",
                summary.partitions_processed, summary.rows_merged
            );
        }
        Commands::Predict { name } => {
            let config = PredictConfig::from_env();
            let scorer = build_scorer(&config, config.live_fusion_weight)?;
            let scored = scorer.score(&name).await?;
            println!(
                "{name}: transfer_chance={:.3} (base={:.3}, text={:.3})",
                scored.transfer_chance, scored.base_probability, scored.text_score
            );
        }
        Commands::Backtest {
            threshold,
            from_key,
        } => {
            let config = PredictConfig::from_env();
            let scorer = build_scorer(&config, config.backtest_fusion_weight)?;
            let runner = BacktestRunner::new(
                store,
                scorer,
                BacktestConfig {
                    archive_prefix: crawl_config.archive_prefix.clone(),
                    threshold,
                    from_key,
                },
            );
            let report = runner.run_once().await?;
            for file in &report.files {
                match file.accuracy() {
                    Some(accuracy) => println!(
                        "{}: accuracy {:.3} ({} scored, {} skipped)",
                        file.key, accuracy, file.rows_scored, file.rows_skipped
                    ),
                    None => println!("{}: no valid predictions", file.key),
                }
            }
        }
        Commands::Serve => {
            let config = PredictConfig::from_env();
            let scorer = build_scorer(&config, config.live_fusion_weight)?;
            tl_web::serve(AppState::new(Arc::new(scorer)), WebConfig::from_env()).await?;
        }
    }

    Ok(())
}

fn site_fetcher() -> Result<Arc<HttpFetcher>> {
    Ok(Arc::new(HttpFetcher::new(HttpClientConfig {
        user_agent: Some(USER_AGENT.to_string()),
        ..Default::default()
    })?))
}

/// One scorer wiring for both entry points; only the fusion weight differs
/// between the live path and the backtest path.
fn build_scorer(config: &PredictConfig, fusion_weight: f64) -> Result<EnsembleScorer> {
    let http = site_fetcher()?;
    let site = StatsSiteConfig::from_env();
    let profile = StatsSiteProfileLookup::new(http.clone(), site);
    let feed = GoogleNewsFeed::new(http);
    let model = HttpScoreModel::new(config)?;
    let chat = OpenAiChat::new(config)?;
    let classifier = TransferClassifier::new(Box::new(chat), config);
    Ok(EnsembleScorer::new(
        Box::new(profile),
        Box::new(model),
        Box::new(feed),
        classifier,
        fusion_weight,
        config.article_cap,
    ))
}
