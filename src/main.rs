/// Sitehost server binary
use sitehost::{
    config::{LoggingConfig, ServerConfig},
    context::AppContext,
    error::SiteResult,
    jobs, server,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> SiteResult<()> {
    let config = ServerConfig::from_env()?;

    init_tracing(&config.logging);
    print_banner();

    let ctx = Arc::new(AppContext::new(config).await?);

    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    server::serve((*ctx).clone()).await?;

    Ok(())
}

/// Initialize logging
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_new(&logging.level)
        .unwrap_or_else(|_| EnvFilter::new("sitehost=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);

    if logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn print_banner() {
    println!(
        r#"
       _ _       _               _
   ___(_) |_ ___| |__   ___  ___| |_
  / __| | __/ _ \ '_ \ / _ \/ __| __|
  \__ \ | ||  __/ | | | (_) \__ \ |_
  |___/_|\__\___|_| |_|\___/|___/\__|

        Multi-tenant site host v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
