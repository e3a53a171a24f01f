use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;

use bedrock_router::bedrock::BedrockService;
use bedrock_router::config::Config;
use bedrock_router::state::AppState;
use bedrock_router::store::{AwsRuntimeConfig, Store};
use bedrock_router::{server, util};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    util::init_tracing();

    let cfg = Config::load().context("failed to load config")?;
    tracing::info!(listen_addr = %cfg.listen_addr, "starting bedrock router");

    let store = Store::new(&cfg.db_path, cfg.log_queue_size)
        .await
        .context("failed to initialize store")?;

    store
        .seed_aws_config_if_empty(AwsRuntimeConfig {
            region: cfg.aws_region.clone(),
            access_key_id: cfg.aws_access_key_id.clone(),
            secret_access_key: cfg.aws_secret_access_key.clone(),
            session_token: cfg.aws_session_token.clone(),
            default_model_id: cfg.default_model_id.clone(),
        })
        .await
        .context("failed to seed aws config")?;
    store
        .seed_admin_token_if_empty("admin123")
        .await
        .context("failed to seed admin token")?;

    let proxy = BedrockService::new(
        None,
        &cfg.default_model_id,
        cfg.default_max_output_tokens,
        cfg.min_tool_max_output_tokens,
        cfg.force_tool_use,
    );

    let state = Arc::new(AppState::new(cfg.clone(), store, proxy));

    state
        .sync_auth_from_store()
        .await
        .context("failed to load clients from store")?;
    if let Err(err) = state.reload_aws_config().await {
        // The admin surface can fix credentials at runtime; requests answer
        // 503 until then.
        tracing::warn!(error = %err, "bedrock client not ready at boot");
    }
    state
        .reload_enabled_models()
        .await
        .context("failed to load enabled models")?;
    state
        .reload_admin_token()
        .await
        .context("failed to load admin token")?;
    state
        .reload_billing_state()
        .await
        .context("failed to load billing state")?;

    let listen_addr = normalize_listen_addr(&cfg.listen_addr);
    let app_state = web::Data::from(state.clone());

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(server::routes)
    })
    .bind(&listen_addr)
    .with_context(|| format!("failed to bind {listen_addr}"))?
    .run()
    .await
    .context("http server failed")?;

    tracing::info!("draining call-log queue");
    state.store.close().await;
    Ok(())
}

/// Accept Go-style ":8080" bind addresses alongside full "host:port" forms.
fn normalize_listen_addr(addr: &str) -> String {
    let addr = addr.trim();
    if let Some(port) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{port}");
    }
    addr.to_string()
}
