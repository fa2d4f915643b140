//! Rotator - ad decision server
//!
//! Loads the serving snapshot, then answers direct, targeting and RTB
//! requests over HTTP.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rotator_backend::api::create_router;
use rotator_backend::auction::HttpBidder;
use rotator_backend::serving::{
    FileSnapshotSource, HttpSnapshotSource, InMemoryDomainLists, SnapshotCache, SnapshotSource,
};
use rotator_backend::telemetry::{spawn_forwarder, ChannelSink};
use rotator_backend::{DecisionEngine, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "rotator")]
#[command(about = "Ad traffic rotator: targeting, selection and RTB auctions")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "ROTATOR_LISTEN", default_value = "0.0.0.0:8081")]
    listen: SocketAddr,

    /// URL serving the snapshot blob
    #[arg(long, env = "ROTATOR_SNAPSHOT_URL")]
    snapshot_url: Option<String>,

    /// Local snapshot blob, used when no URL is given
    #[arg(long, env = "ROTATOR_SNAPSHOT_FILE")]
    snapshot_file: Option<PathBuf>,

    /// Domain lists as JSON: {"<list-id>": {"<domain>": "white"|"black"}}
    #[arg(long, env = "ROTATOR_DOMAIN_LISTS_FILE")]
    domain_lists_file: Option<PathBuf>,

    /// Base URL telemetry events are POSTed to, one path per topic
    #[arg(long, env = "ROTATOR_TELEMETRY_URL")]
    telemetry_url: Option<String>,

    /// Public host of this service, used in RTB session auction URLs
    #[arg(long, env = "ROTATOR_DOMAIN")]
    rotator_domain: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = EngineConfig::from_env();
    init_tracing();

    let args = Args::parse();
    if args.rotator_domain.is_some() {
        config.rotator_domain = args.rotator_domain.clone();
    }

    let source: Arc<dyn SnapshotSource> = match (&args.snapshot_url, &args.snapshot_file) {
        (Some(url), _) => Arc::new(HttpSnapshotSource::new(url.clone(), Duration::from_secs(10))?),
        (None, Some(path)) => Arc::new(FileSnapshotSource::new(path.clone())),
        (None, None) => bail!("Either --snapshot-url or --snapshot-file is required"),
    };
    info!(source = %source.describe(), ttl_secs = config.snapshot_ttl.as_secs(), "Snapshot source configured");

    let cache = Arc::new(SnapshotCache::with_ttl(source, config.snapshot_ttl));
    cache
        .ensure_fresh()
        .await
        .context("Initial snapshot load failed")?;

    let domain_lists = Arc::new(match &args.domain_lists_file {
        Some(path) => InMemoryDomainLists::load_file(path).await?,
        None => InMemoryDomainLists::new(),
    });
    info!(lists = domain_lists.list_count(), "Domain lists loaded");
    if let Some(path) = args.domain_lists_file.clone() {
        spawn_domain_list_reload(domain_lists.clone(), path, config.snapshot_ttl);
    }

    let (sink, events) = ChannelSink::new(config.telemetry_queue_capacity);
    let telemetry_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build telemetry HTTP client")?;
    spawn_forwarder(events, args.telemetry_url.clone(), telemetry_client);

    let bidder = HttpBidder::new(config.bid_timeout, config.openrtb_version.clone())?;
    let engine = Arc::new(DecisionEngine::new(
        cache,
        domain_lists,
        Arc::new(bidder),
        Arc::new(sink),
        config,
    ));

    let app = create_router(engine);
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    info!("Rotator listening on {}", args.listen);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("Server error")?;

    Ok(())
}

/// Re-reads the domain lists file on a fixed interval. A bad read keeps the current lists.
fn spawn_domain_list_reload(lists: Arc<InMemoryDomainLists>, path: PathBuf, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match InMemoryDomainLists::load_file(&path).await {
                Ok(fresh) => lists.replace(fresh),
                Err(e) => warn!(path = %path.display(), error = %format!("{:#}", e), "Domain list reload failed"),
            }
        }
    });
}

/// `ROTATOR_LOG_JSON=1` switches to JSON lines.
fn init_tracing() {
    let json = std::env::var("ROTATOR_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rotator_backend=info,rotator=info,tower_http=info".into()),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();
}
