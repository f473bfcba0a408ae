//! Metrics recorded through the `metrics` facade
//!
//! Nothing is exported unless the application installs a recorder.

/// Label values
pub mod labels {
    /// Cleartext password authentication (IAM tokens arrive this way)
    pub const MECHANISM_CLEARTEXT: &str = "cleartext";
    /// SCRAM-SHA-256
    pub const MECHANISM_SCRAM: &str = "scram-sha-256";
    /// SCRAM-SHA-256-PLUS
    pub const MECHANISM_SCRAM_PLUS: &str = "scram-sha-256-plus";

    /// Password came from the static configuration
    pub const CREDENTIAL_STATIC: &str = "static";
    /// Password is a freshly issued token
    pub const CREDENTIAL_TOKEN: &str = "token";

    /// Query finished normally
    pub const STATUS_OK: &str = "ok";
    /// Query failed
    pub const STATUS_ERROR: &str = "error";
    /// Caller dropped the stream before it was exhausted
    pub const STATUS_ABANDONED: &str = "abandoned";
}

/// Counters
pub mod counters {
    use metrics::counter;

    /// New connection stored in the slot
    pub fn connection_opened(credential: &'static str) {
        counter!("rds_iam_conn_connections_opened_total", "credential" => credential).increment(1);
    }

    /// Existing connection passed the probe and was reused
    pub fn connection_reused() {
        counter!("rds_iam_conn_connections_reused_total").increment(1);
    }

    /// Existing connection failed the probe
    pub fn probe_failed() {
        counter!("rds_iam_conn_probe_failures_total").increment(1);
    }

    /// Refresh failed; `category` is [`crate::Error::category`] of the cause
    pub fn refresh_failed(category: &'static str) {
        counter!("rds_iam_conn_refresh_failures_total", "cause" => category).increment(1);
    }

    /// Token issued
    pub fn token_issued() {
        counter!("rds_iam_conn_tokens_issued_total").increment(1);
    }

    /// Token issuance failed
    pub fn token_failed(category: &'static str) {
        counter!("rds_iam_conn_token_failures_total", "cause" => category).increment(1);
    }

    /// Authentication started with `mechanism`
    pub fn auth_attempted(mechanism: &'static str) {
        counter!("rds_iam_conn_auth_attempts_total", "mechanism" => mechanism).increment(1);
    }

    /// Authentication rejected
    pub fn auth_failed(mechanism: &'static str, reason: &'static str) {
        counter!(
            "rds_iam_conn_auth_failures_total",
            "mechanism" => mechanism,
            "reason" => reason
        )
        .increment(1);
    }

    /// Query finished with `status`
    pub fn query_completed(status: &'static str) {
        counter!("rds_iam_conn_queries_total", "status" => status).increment(1);
    }

    /// Rows handed to the caller
    pub fn rows_streamed(count: u64) {
        counter!("rds_iam_conn_rows_streamed_total").increment(count);
    }
}

/// Histograms (milliseconds)
pub mod histograms {
    use metrics::histogram;

    /// TCP connect + TLS + startup + authentication
    pub fn connect_duration(millis: u64) {
        histogram!("rds_iam_conn_connect_duration_ms").record(millis as f64);
    }

    /// Token issuance
    pub fn token_duration(millis: u64) {
        histogram!("rds_iam_conn_token_duration_ms").record(millis as f64);
    }

    /// Query sent until row description received
    pub fn query_startup_duration(millis: u64) {
        histogram!("rds_iam_conn_query_startup_duration_ms").record(millis as f64);
    }
}
