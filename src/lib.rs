#![forbid(unsafe_code)]
#![doc = r#"
bedrock-router

OpenAI-compatible HTTP gateway in front of AWS Bedrock's Converse API.
Clients authenticate with opaque API keys and speak Chat Completions or the
Responses API; the gateway translates to Converse (including tool use),
streams the answer back in the matching OpenAI dialect, and records usage,
cost and call logs.

Modules
- `models`: OpenAI wire types for the Chat and Responses dialects.
- `conversion`: message hygiene and OpenAI → Converse translation.
- `bedrock`: Converse domain model, the `ConverseApi` seam and the driver.
- `aws`: AWS SDK client construction and the production `ConverseApi`.
- `auth`: API-key registry, token-bucket rate limiting, concurrency gates.
- `billing`: pricing map, running cost total and the global cost limit.
- `store`: SQLite persistence and the bounded call-log write queue.
- `state`: hot-swappable runtime state and store-backed reloads.
- `server`: actix-web public surface and the two SSE stream adapters.
"#]

pub mod auth;
pub mod aws;
pub mod bedrock;
pub mod billing;
pub mod config;
pub mod conversion;
pub mod error;
pub mod models;
pub mod server;
pub mod state;
pub mod store;
pub mod util;

pub use crate::auth::{AuthError, Client, ConcurrencyPermit, Manager};
pub use crate::bedrock::{
    BedrockService, ChatResult, ConverseApi, ConverseStreamSession, StreamDelta,
};
pub use crate::billing::BillingState;
pub use crate::config::{ClientConfig, Config};
pub use crate::error::ServiceError;
pub use crate::state::AppState;
pub use crate::store::{CallRecord, Store};
