use chrono::{DateTime, Utc};

pub fn build_host() -> &'static str {
    option_env!("TASKMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("TASKMASTER_BUILD_TIME").unwrap_or("unknown")
}

/// Render the raw build stamp (`epoch:<secs>` or RFC3339) as `YYYY-MM-DD HH:MM:SS` UTC.
pub fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(epoch) = raw.strip_prefix("epoch:") {
        return epoch
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| raw.to_string());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc).format("%Y-%m-%d %H:%M:%S").to_string();
    }
    raw.replace('T', " ").trim_end_matches('Z').to_string()
}

pub fn banner() -> String {
    format!(
        "taskmasterd {} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        format_build_time(build_time_raw())
    )
}
