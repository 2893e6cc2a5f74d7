use std::env;
use tracing_subscriber::{fmt, EnvFilter};

pub fn setup_logging() {
    // Check for a LOG_LEVEL environment variable, defaulting to INFO
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("multitenant_push_notifier={}", log_level))
            // Reduce noise from third-party libraries
            .add_directive("tower_http=warn".parse().unwrap())
            .add_directive("sqlx=warn".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("yup_oauth2=warn".parse().unwrap())
    });

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .init();

    tracing::info!("Logging initialized");
}
