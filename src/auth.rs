//! Client registry, per-client rate limiting and concurrency gating.
//!
//! Clients are loaded from the store at boot and swapped wholesale (or one
//! at a time) by admin operations. Lookup state lives behind a read-write
//! lock; the request path takes a short read lock and clones the `Arc`.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use actix_web::HttpRequest;
use anyhow::{anyhow, Result};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ClientConfig;

const DEFAULT_MAX_REQUESTS_PER_MINUTE: i64 = 1200;
const DEFAULT_MAX_CONCURRENT: i64 = 64;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing api key")]
    MissingKey,
    #[error("invalid api key")]
    InvalidKey,
    #[error("api key is disabled")]
    Disabled,
}

/// A registered API client with its runtime limiter state.
pub struct Client {
    pub id: String,
    pub name: String,
    pub api_key: String,
    pub max_requests_per_minute: i64,
    pub max_concurrent: i64,
    /// Lowercased model allow-list; empty permits all enabled models.
    pub allowed_models: BTreeSet<String>,
    pub disabled: bool,
    limiter: Mutex<TokenBucket>,
    sem: Arc<Semaphore>,
}

impl Client {
    fn build(mut cfg: ClientConfig) -> Result<Arc<Client>> {
        cfg.id = cfg.id.trim().to_string();
        cfg.api_key = cfg.api_key.trim().to_string();
        if cfg.id.is_empty() {
            return Err(anyhow!("client id is required"));
        }
        if cfg.api_key.is_empty() {
            return Err(anyhow!("client api key is required"));
        }

        let max_rpm = if cfg.max_requests_per_minute > 0 {
            cfg.max_requests_per_minute
        } else {
            DEFAULT_MAX_REQUESTS_PER_MINUTE
        };
        let max_concurrent = if cfg.max_concurrent > 0 {
            cfg.max_concurrent
        } else {
            DEFAULT_MAX_CONCURRENT
        };

        let name = {
            let name = cfg.name.trim();
            if name.is_empty() {
                cfg.id.clone()
            } else {
                name.to_string()
            }
        };

        let allowed_models: BTreeSet<String> = cfg
            .allowed_models
            .iter()
            .map(|model| model.trim().to_ascii_lowercase())
            .filter(|model| !model.is_empty())
            .collect();

        Ok(Arc::new(Client {
            id: cfg.id,
            name,
            api_key: cfg.api_key,
            max_requests_per_minute: max_rpm,
            max_concurrent,
            allowed_models,
            disabled: cfg.disabled,
            limiter: Mutex::new(TokenBucket::new(max_rpm)),
            sem: Arc::new(Semaphore::new(max_concurrent as usize)),
        }))
    }

    /// Non-blocking token-bucket check; returns false without consuming when
    /// the bucket is empty.
    pub fn allow_request(&self) -> bool {
        self.limiter.lock().expect("limiter lock").try_consume(1.0)
    }

    /// Empty allow-list permits everything; otherwise either the requested
    /// name or the resolved backend id must match, case-insensitively.
    pub fn is_model_allowed(&self, requested_model: &str, resolved_model_id: &str) -> bool {
        if self.allowed_models.is_empty() {
            return true;
        }
        let requested = requested_model.trim().to_ascii_lowercase();
        let resolved = resolved_model_id.trim().to_ascii_lowercase();
        self.allowed_models.contains(&requested) || self.allowed_models.contains(&resolved)
    }

    pub fn to_config(&self) -> ClientConfig {
        ClientConfig {
            id: self.id.clone(),
            name: self.name.clone(),
            api_key: self.api_key.clone(),
            max_requests_per_minute: self.max_requests_per_minute,
            max_concurrent: self.max_concurrent,
            allowed_models: self.allowed_models.iter().cloned().collect(),
            disabled: self.disabled,
        }
    }

    #[cfg(test)]
    fn available_permits(&self) -> usize {
        self.sem.available_permits()
    }
}

/// Held for the duration of one request; permits release on drop.
///
/// Release order is the reverse of acquisition: the per-client permit is
/// declared first, so it drops before the global one.
pub struct ConcurrencyPermit {
    _client: OwnedSemaphorePermit,
    _global: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct Registry {
    by_api_key: HashMap<String, Arc<Client>>,
    by_id: HashMap<String, Arc<Client>>,
}

pub struct Manager {
    registry: RwLock<Registry>,
    global_sem: Option<Arc<Semaphore>>,
}

impl Manager {
    pub fn new(global_max_concurrent: usize) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            global_sem: if global_max_concurrent > 0 {
                Some(Arc::new(Semaphore::new(global_max_concurrent)))
            } else {
                None
            },
        }
    }

    /// Extract the api key from the request and look the client up with a
    /// constant-time comparison over the key index.
    pub fn authenticate(&self, request: &HttpRequest) -> Result<Arc<Client>, AuthError> {
        let token = extract_token(request).ok_or(AuthError::MissingKey)?;

        let registry = self.registry.read().expect("registry lock");
        let mut matched: Option<Arc<Client>> = None;
        for (api_key, client) in registry.by_api_key.iter() {
            if ct_eq(api_key.as_bytes(), token.as_bytes()) {
                matched = Some(client.clone());
            }
        }
        drop(registry);

        let client = matched.ok_or(AuthError::InvalidKey)?;
        if client.disabled {
            return Err(AuthError::Disabled);
        }
        Ok(client)
    }

    /// Acquire the global semaphore (when configured), then the per-client
    /// one. Callers bound the wait with their request deadline; cancelling
    /// the future mid-acquire releases anything already held.
    pub async fn acquire(&self, client: &Arc<Client>) -> Result<ConcurrencyPermit> {
        let global = match &self.global_sem {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow!("global concurrency gate closed"))?,
            ),
            None => None,
        };
        let client_permit = client
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow!("client concurrency gate closed"))?;

        Ok(ConcurrencyPermit {
            _client: client_permit,
            _global: global,
        })
    }

    /// Replace the whole registry. Token-bucket and semaphore state resets
    /// for every client.
    pub fn replace_clients(&self, configs: Vec<ClientConfig>) -> Result<()> {
        let mut by_api_key = HashMap::with_capacity(configs.len());
        let mut by_id = HashMap::with_capacity(configs.len());

        for cfg in configs {
            let client = Client::build(cfg)?;
            if by_id.contains_key(&client.id) {
                return Err(anyhow!("duplicate client id: {}", client.id));
            }
            if by_api_key.contains_key(&client.api_key) {
                return Err(anyhow!("duplicate client api key"));
            }
            by_id.insert(client.id.clone(), client.clone());
            by_api_key.insert(client.api_key.clone(), client);
        }

        let mut registry = self.registry.write().expect("registry lock");
        registry.by_id = by_id;
        registry.by_api_key = by_api_key;
        Ok(())
    }

    pub fn upsert_client(&self, cfg: ClientConfig) -> Result<()> {
        let client = Client::build(cfg)?;

        let mut registry = self.registry.write().expect("registry lock");
        if let Some(existing) = registry.by_api_key.get(&client.api_key) {
            if existing.id != client.id {
                return Err(anyhow!("api key already in use"));
            }
        }
        let stale_key = registry.by_id.get(&client.id).and_then(|existing| {
            if existing.api_key != client.api_key {
                Some(existing.api_key.clone())
            } else {
                None
            }
        });
        if let Some(stale_key) = stale_key {
            registry.by_api_key.remove(&stale_key);
        }
        registry.by_id.insert(client.id.clone(), client.clone());
        registry.by_api_key.insert(client.api_key.clone(), client);
        Ok(())
    }

    pub fn delete_client(&self, client_id: &str) -> bool {
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return false;
        }

        let mut registry = self.registry.write().expect("registry lock");
        let Some(client) = registry.by_id.remove(client_id) else {
            return false;
        };
        registry.by_api_key.remove(&client.api_key);
        true
    }

    pub fn list_clients(&self) -> Vec<ClientConfig> {
        let registry = self.registry.read().expect("registry lock");
        let mut clients: Vec<ClientConfig> = registry
            .by_id
            .values()
            .map(|client| client.to_config())
            .collect();
        drop(registry);
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }
}

/// Bearer token from `Authorization`, else `x-api-key`, else `api-key`.
fn extract_token(request: &HttpRequest) -> Option<String> {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    if let Some(auth) = header("authorization") {
        const PREFIX: &str = "Bearer ";
        if auth.len() > PREFIX.len() && auth[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
            let token = auth[PREFIX.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(token) = header("x-api-key") {
        return Some(token);
    }
    header("api-key")
}

/// Constant-time equality for two byte slices.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for i in 0..a.len() {
        acc |= a[i] ^ b[i];
    }
    acc == 0
}

/// Request-rate token bucket: refill rate = rpm/60 per second, burst
/// capacity = max(1, min(rpm, rpm/5)). Starts full.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(max_requests_per_minute: i64) -> Self {
        let rpm = max_requests_per_minute.max(1);
        let capacity = rpm.min(rpm / 5).max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: rpm as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self, amount: f64) -> bool {
        self.refill();
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}
