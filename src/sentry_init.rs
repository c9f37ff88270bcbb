use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;
use tracing::info;

static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b")
        .expect("Invalid email regex pattern")
});
static PHONE_REGEX: Lazy<Regex> = Lazy::new(|| {
    // International (+31612345678) or grouped (555-123-4567); bare short numbers are left alone
    Regex::new(r"\+\d{7,15}\b|\(?\b\d{3}\)?[\s.-]?\d{3}[\s.-]\d{4}\b")
        .expect("Invalid phone regex pattern")
});
static UUID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("Invalid UUID regex pattern")
});
static JWT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"eyJ[A-Za-z0-9_-]+\.eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+")
        .expect("Invalid JWT regex pattern")
});

/// Start Sentry when `SENTRY_DSN` is set.
///
/// `SENTRY_ENVIRONMENT` (default "production"), `SENTRY_RELEASE` and
/// `SENTRY_TRACES_SAMPLE_RATE` (default 0.05) are read as well. Keep the
/// returned guard alive until shutdown so queued events are flushed.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => {
            info!("SENTRY_DSN not set, error reporting disabled");
            return None;
        }
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "production".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });
    let traces_sample_rate = env::var("SENTRY_TRACES_SAMPLE_RATE")
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .unwrap_or(0.05);

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            traces_sample_rate,
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    info!(
        "Sentry error reporting enabled (environment: {})",
        guard.options().environment.as_deref().unwrap_or("unknown")
    );

    Some(guard)
}

/// Strip customer details from outgoing events.
///
/// Ticket fields (names, emails, photo links) must never reach Sentry; only
/// error text with identifiers redacted and operational tags are sent.
fn before_send_filter(mut event: sentry::protocol::Event<'static>) -> Option<sentry::protocol::Event<'static>> {
    // Strip PII from error messages
    if let Some(message) = event.message.as_mut() {
        *message = strip_pii_from_message(message);
    }

    // Strip PII from exception messages
    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = strip_pii_from_message(value);
        }
    }

    // Strip PII from breadcrumbs
    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = strip_pii_from_message(message);
        }
    }

    event.tags.insert(
        "service_version".into(),
        env!("CARGO_PKG_VERSION").into(),
    );
    event.tags.insert(
        "platform".into(),
        std::env::consts::OS.into(),
    );
    event.tags.insert(
        "arch".into(),
        std::env::consts::ARCH.into(),
    );

    Some(event)
}

/// Strip personally identifiable information from messages
fn strip_pii_from_message(message: &str) -> String {
    let mut cleaned = message.to_string();

    cleaned = EMAIL_REGEX.replace_all(&cleaned, "[EMAIL_REDACTED]").to_string();

    cleaned = UUID_REGEX.replace_all(&cleaned, "[UUID_REDACTED]").to_string();

    cleaned = JWT_REGEX.replace_all(&cleaned, "[JWT_REDACTED]").to_string();

    // Runs after UUIDs so their digit groups are already gone
    cleaned = PHONE_REGEX.replace_all(&cleaned, "[PHONE_REDACTED]").to_string();

    cleaned
}

/// Report a background task that ran out of retries or hit a permanent error.
///
/// The tenant id is hashed before it leaves the process.
pub fn capture_task_failure(kind: &str, tenant: &str, attempts: u32, error: &str) {
    sentry::with_scope(
        |scope| {
            scope.set_tag("event_type", "task_failure");
            scope.set_tag("task_kind", kind);
            scope.set_tag("tenant_hash", format!("{:x}", md5::compute(tenant)));
            scope.set_extra("attempts", attempts.into());
        },
        || {
            sentry::capture_message(
                &format!("Queue task failed: {}", strip_pii_from_message(error)),
                sentry::Level::Error,
            );
        },
    );
}
