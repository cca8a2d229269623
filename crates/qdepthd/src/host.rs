//! Hostname reported in status events.

/// The machine's hostname, or `None` if it cannot be read.
pub fn machine_name() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

/// Configured override, else the hostname, else `"unknown"`.
pub fn resolve(configured: Option<&str>) -> String {
    configured
        .map(str::to_string)
        .or_else(machine_name)
        .unwrap_or_else(|| "unknown".to_string())
}
