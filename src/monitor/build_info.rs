pub fn build_host() -> &'static str {
    option_env!("FDBMONITOR_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time() -> &'static str {
    option_env!("FDBMONITOR_BUILD_TIME").unwrap_or("unknown")
}

pub fn banner() -> String {
    format!(
        "FoundationDB Process Monitor v{} (built on {} at {})",
        env!("CARGO_PKG_VERSION"),
        build_host(),
        build_time()
    )
}
