use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// Environment files are resolved in order: an explicit path from ENV_FILE,
/// then `.env` next to the executable (so a double-clicked binary still finds
/// its config), then standard `.env` discovery in the working directory.
/// Existing process environment always wins over file values.
pub fn init_tracing() {
    let mut env_source: String = "none".into();

    if let Ok(path) = std::env::var("ENV_FILE") {
        let path = path.trim();
        if !path.is_empty()
            && std::path::Path::new(path).is_file()
            && dotenvy::from_filename(path).is_ok()
        {
            env_source = format!("{path} (ENV_FILE)");
        }
    }

    if env_source == "none" {
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                let candidate = dir.join(".env");
                if candidate.is_file() && dotenvy::from_filename(&candidate).is_ok() {
                    env_source = candidate.display().to_string();
                }
            }
        }
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("environment loaded from: {}", env_source);
}

/// Fresh request id used when the client did not supply `x-request-id`.
pub fn new_request_id() -> String {
    format!("req-{}", Uuid::new_v4())
}

/// Seconds since the Unix epoch.
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Truncate a string to at most `max_chars` code points.
///
/// Byte-length truncation would split multi-byte sequences, so previews are
/// capped on character boundaries.
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }
    match value.char_indices().nth(max_chars) {
        Some((byte_index, _)) => value[..byte_index].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_code_points() {
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
        assert_eq!(truncate_chars("héllo", 20), "héllo");
        assert_eq!(truncate_chars("héllo", 0), "");
        // Multi-byte characters are never split.
        assert_eq!(truncate_chars("日本語テキスト", 3), "日本語");
    }

    #[test]
    fn request_ids_are_prefixed_and_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req-"));
        assert_ne!(a, b);
    }
}
