use anyhow::Result;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use classifieds_monitor::api::{HttpListingFetcher, SearchParams};
use classifieds_monitor::core::{logging, Config, HealthChecker, MonitorMetrics};
use classifieds_monitor::listing::SearchResultNormalizer;
use classifieds_monitor::monitoring::{CycleReporter, HistoryDatabase};
use classifieds_monitor::notify::TelegramDispatcher;
use classifieds_monitor::scheduler::{PollPolicy, PollScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    logging::init_logging(&config.monitoring.log_level);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            tracing::error!("❌ Configuration: {}", problem);
        }
        anyhow::bail!("invalid configuration ({} problems)", problems.len());
    }

    tracing::info!("🚀 Classifieds monitor starting...");
    tracing::info!("Version: {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Search: {}", config.search.url);
    tracing::info!(
        "Pages: {}, interval: {}s, chats: {}",
        config.search.max_pages,
        config.scheduler.poll_interval_secs,
        config.telegram.chat_ids.len()
    );

    let database = Arc::new(HistoryDatabase::new(&config.database.path).await?);
    let reporter = CycleReporter::new(database.clone());
    match reporter.generate_summary().await {
        Ok(report) => tracing::info!("{}", reporter.format_summary(&report)),
        Err(e) => tracing::warn!("Could not build startup summary: {}", e),
    }

    let health = HealthChecker::new(config.scheduler.max_consecutive_failures);
    let metrics = MonitorMetrics::new()?;

    let fetcher = Arc::new(HttpListingFetcher::new(&config.search)?);
    let dispatcher = Arc::new(TelegramDispatcher::new(&config.telegram)?);

    tokio::spawn(start_health_server(
        health.clone(),
        metrics.clone(),
        config.monitoring.health_port,
    ));
    tracing::info!(
        "✅ Health endpoint running on port {}",
        config.monitoring.health_port
    );

    let site_origin = Url::parse(&config.search.url)?.origin().ascii_serialization();
    let mut scheduler = PollScheduler::new(
        fetcher.clone(),
        Arc::new(SearchResultNormalizer::new(&site_origin)),
        database.clone(),
        dispatcher,
        SearchParams::from_config(&config.search),
        PollPolicy::from_config(&config.scheduler),
        health,
    )
    .with_metrics(metrics);
    if config.search.fetch_details {
        scheduler = scheduler.with_detail_fetcher(fetcher);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("🛑 Shutdown requested, finishing current step...");
        let _ = shutdown_tx.send(true);
    });

    if config.monitoring.summary_interval_secs > 0 {
        let periodic = CycleReporter::new(database.clone());
        let period = Duration::from_secs(config.monitoring.summary_interval_secs);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            periodic.run_periodic(period, shutdown).await;
        });
    }

    let state = scheduler.run(shutdown_rx).await;

    match reporter.generate_summary().await {
        Ok(report) => tracing::info!("{}", reporter.format_summary(&report)),
        Err(e) => tracing::warn!("Could not build final summary: {}", e),
    }
    database.close().await;

    tracing::info!(
        "👋 Stopped after {} cycles ({} consecutive failures)",
        state.cycles_run,
        state.consecutive_failures
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

async fn start_health_server(health: HealthChecker, metrics: MonitorMetrics, port: u16) {
    use warp::Filter;

    let health_route = warp::path("health")
        .and(warp::any().map(move || health.clone()))
        .and_then(|checker: HealthChecker| async move {
            let status = checker.get_status().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&status))
        });

    let metrics_route = warp::path("metrics")
        .and(warp::any().map(move || metrics.clone()))
        .map(|metrics: MonitorMetrics| match metrics.render() {
            Ok(body) => warp::reply::with_status(body, warp::http::StatusCode::OK),
            Err(e) => warp::reply::with_status(
                format!("metrics unavailable: {}", e),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            ),
        });

    warp::serve(health_route.or(metrics_route))
        .run(([0, 0, 0, 0], port))
        .await;
}
