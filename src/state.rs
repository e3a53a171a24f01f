//! Hot-swappable runtime state and the reload paths that rebuild it from the
//! store: enabled models, AWS runtime config + model catalog, admin token,
//! billing totals and the auth registry.
//!
//! Readers copy snapshots out under short read locks; writers swap whole
//! values. Nothing here blocks on the database during request admission.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};

use crate::auth::Manager;
use crate::aws::{build_bedrock_clients, fetch_available_models, AwsConverseClient};
use crate::bedrock::BedrockService;
use crate::billing::BillingState;
use crate::config::Config;
use crate::store::{AwsRuntimeConfig, BillingConfig, Store};

#[derive(Default)]
struct ModelStateInner {
    enabled_model_ids: Vec<String>,
    enabled_set: HashSet<String>,
}

/// Admin-curated set of enabled models. An empty set enables everything.
#[derive(Default)]
pub struct ModelState {
    inner: RwLock<ModelStateInner>,
}

impl ModelState {
    pub fn replace(&self, model_ids: Vec<String>) {
        let normalized = normalize_model_ids(model_ids);
        let set: HashSet<String> = normalized.iter().cloned().collect();
        let mut inner = self.inner.write().expect("model state lock");
        inner.enabled_model_ids = normalized;
        inner.enabled_set = set;
    }

    pub fn list(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("model state lock")
            .enabled_model_ids
            .clone()
    }

    pub fn is_enabled(&self, model_id: &str) -> bool {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            return false;
        }
        let inner = self.inner.read().expect("model state lock");
        if inner.enabled_set.is_empty() {
            return true;
        }
        inner.enabled_set.contains(model_id)
    }
}

#[derive(Default)]
struct AwsStateInner {
    cfg: AwsRuntimeConfig,
    control_client: Option<aws_sdk_bedrock::Client>,
    available_models: Vec<String>,
}

/// Current AWS runtime configuration, the control-plane client used for
/// catalog refreshes, and the last fetched catalog.
#[derive(Default)]
pub struct AwsState {
    inner: RwLock<AwsStateInner>,
}

impl AwsState {
    pub fn set(
        &self,
        cfg: AwsRuntimeConfig,
        control_client: Option<aws_sdk_bedrock::Client>,
        available_models: Vec<String>,
    ) {
        let mut inner = self.inner.write().expect("aws state lock");
        inner.cfg = cfg;
        inner.control_client = control_client;
        inner.available_models = normalize_model_ids(available_models);
    }

    pub fn set_available_models(&self, available_models: Vec<String>) {
        self.inner.write().expect("aws state lock").available_models =
            normalize_model_ids(available_models);
    }

    pub fn config(&self) -> AwsRuntimeConfig {
        self.inner.read().expect("aws state lock").cfg.clone()
    }

    pub fn available_models(&self) -> Vec<String> {
        self.inner
            .read()
            .expect("aws state lock")
            .available_models
            .clone()
    }

    pub fn control_client(&self) -> Option<aws_sdk_bedrock::Client> {
        self.inner
            .read()
            .expect("aws state lock")
            .control_client
            .clone()
    }
}

#[derive(Default)]
pub struct AdminTokenState {
    token: RwLock<String>,
}

impl AdminTokenState {
    pub fn set(&self, token: &str) {
        *self.token.write().expect("admin token lock") = token.trim().to_string();
    }

    pub fn get(&self) -> String {
        self.token.read().expect("admin token lock").clone()
    }
}

/// Shared application state handed to every handler.
pub struct AppState {
    pub cfg: Config,
    pub auth: Manager,
    pub proxy: BedrockService,
    pub store: Store,
    pub billing: BillingState,
    pub models: ModelState,
    pub aws: AwsState,
    pub admin_token: AdminTokenState,
}

impl AppState {
    pub fn new(cfg: Config, store: Store, proxy: BedrockService) -> Self {
        let auth = Manager::new(cfg.global_max_concurrent);
        Self {
            auth,
            proxy,
            store,
            billing: BillingState::new(),
            models: ModelState::default(),
            aws: AwsState::default(),
            admin_token: AdminTokenState::default(),
            cfg,
        }
    }

    /// Catalog shown on `/v1/models`: enabled models, else the fetched
    /// catalog, else the default model alone.
    pub fn catalog_models(&self) -> Vec<String> {
        let enabled = self.models.list();
        if !enabled.is_empty() {
            return enabled;
        }

        let available = self.aws.available_models();
        if !available.is_empty() {
            return available;
        }

        let fallback = pick_default_model_id(&self.cfg.default_model_id, &self.aws.config().default_model_id);
        if fallback.is_empty() {
            return Vec::new();
        }
        vec![fallback]
    }

    /// Rebuild the Bedrock clients from persisted (or environment) AWS
    /// configuration and swap them into the driver.
    pub async fn reload_aws_config(&self) -> Result<()> {
        let persisted = self
            .store
            .get_aws_config()
            .await
            .context("load aws config")?;

        let mut runtime_cfg = persisted.unwrap_or_else(|| AwsRuntimeConfig {
            region: self.cfg.aws_region.clone(),
            access_key_id: self.cfg.aws_access_key_id.clone(),
            secret_access_key: self.cfg.aws_secret_access_key.clone(),
            session_token: self.cfg.aws_session_token.clone(),
            default_model_id: self.cfg.default_model_id.clone(),
        });
        runtime_cfg.default_model_id =
            pick_default_model_id(&self.cfg.default_model_id, &runtime_cfg.default_model_id);

        if runtime_cfg.region.trim().is_empty() {
            self.proxy.replace_client(None);
            self.proxy.set_default_model_id(&runtime_cfg.default_model_id);
            self.aws.set(runtime_cfg, None, Vec::new());
            return Ok(());
        }

        let (runtime_client, control_client) = build_bedrock_clients(&runtime_cfg)
            .await
            .context("initialize bedrock clients")?;

        self.proxy
            .replace_client(Some(Arc::new(AwsConverseClient::new(runtime_client))));
        self.proxy.set_default_model_id(&runtime_cfg.default_model_id);

        let available_models = match fetch_available_models(&control_client, &runtime_cfg.region).await
        {
            Ok(models) => {
                if !models.is_empty() {
                    self.store
                        .seed_enabled_models_if_empty(&models)
                        .await
                        .context("seed enabled models")?;
                }
                models
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to fetch available bedrock models");
                Vec::new()
            }
        };

        self.aws
            .set(runtime_cfg, Some(control_client), available_models);
        Ok(())
    }

    pub async fn reload_enabled_models(&self) -> Result<()> {
        let mut enabled = self
            .store
            .list_enabled_models()
            .await
            .context("list enabled models")?;

        if enabled.is_empty() {
            let available = self.aws.available_models();
            if !available.is_empty() {
                self.store
                    .seed_enabled_models_if_empty(&available)
                    .await
                    .context("seed enabled models")?;
                enabled = self
                    .store
                    .list_enabled_models()
                    .await
                    .context("list enabled models")?;
            }
        }

        self.models.replace(enabled);
        Ok(())
    }

    pub async fn reload_billing_state(&self) -> Result<()> {
        let cfg = self
            .store
            .get_billing_config()
            .await
            .context("load billing config")?
            .unwrap_or(BillingConfig::default());
        let pricing = self
            .store
            .list_model_pricing()
            .await
            .context("list model pricing")?;
        let usage = self
            .store
            .get_usage_by_model("1970-01-01", "9999-12-31", "")
            .await
            .context("load usage rows")?;

        self.billing.reload(cfg, &pricing, &usage);
        Ok(())
    }

    pub async fn reload_admin_token(&self) -> Result<()> {
        let token = match self
            .store
            .get_admin_token()
            .await
            .context("load admin token")?
        {
            Some(token) => token,
            None => {
                let token = "admin123".to_string();
                self.store
                    .upsert_admin_token(&token)
                    .await
                    .context("seed admin token")?;
                token
            }
        };
        self.admin_token.set(&token);
        Ok(())
    }

    pub async fn sync_auth_from_store(&self) -> Result<()> {
        let clients = self.store.list_clients().await.context("list clients")?;
        self.auth.replace_clients(clients)
    }
}

fn pick_default_model_id(fallback: &str, preferred: &str) -> String {
    let preferred = preferred.trim();
    if !preferred.is_empty() {
        return preferred.to_string();
    }
    fallback.trim().to_string()
}

/// Trim, drop empties, dedupe and sort.
pub fn normalize_model_ids(model_ids: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::with_capacity(model_ids.len());
    let mut out: Vec<String> = Vec::with_capacity(model_ids.len());
    for model_id in model_ids {
        let model_id = model_id.trim().to_string();
        if model_id.is_empty() || !seen.insert(model_id.clone()) {
            continue;
        }
        out.push(model_id);
    }
    out.sort();
    out
}
