use std::process;
use std::sync::Arc;

use axum::{Router, middleware};
use sidekick_cache::{
    cache::{CacheConfig, CacheState, Store, response_cache_layer},
    config,
    infra::{
        error::InfraError,
        proxy::{OriginProxy, forward_to_origin},
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_startup_error(&error);
        process::exit(1);
    }
}

fn report_startup_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "startup error");
        return;
    }

    // Errors before telemetry is installed still need to reach stderr.
    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "startup error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (_cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    let origin_url = settings
        .origin
        .url
        .as_deref()
        .ok_or_else(|| InfraError::configuration("origin url is not configured"))?;
    let proxy = Arc::new(OriginProxy::new(origin_url)?);

    let store = Arc::new(Store::new(
        &settings.cache.loc,
        settings.cache.ttl,
        settings.cache.memory_max_size,
        settings.cache.memory_max_count,
    )?);
    let cache_state = CacheState {
        config: Arc::new(CacheConfig::from(&settings.cache)),
        store,
    };

    let app = Router::new()
        .fallback(forward_to_origin)
        .layer(middleware::from_fn_with_state(
            cache_state,
            response_cache_layer,
        ))
        .with_state(proxy);

    info!(
        listen = %settings.server.listen,
        origin = origin_url,
        cache_loc = %settings.cache.loc.display(),
        ttl = settings.cache.ttl,
        "serving"
    );

    let listener = tokio::net::TcpListener::bind(settings.server.listen)
        .await
        .map_err(InfraError::Io)?;
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|err| InfraError::server(err.to_string()))?;

    Ok(())
}
