use anyhow::Result;

// ============================================================================
// Configuration Constants
// ============================================================================

// Default ports
const DEFAULT_PORT: u16 = 8080;

// Token lifetimes
pub const PRE_AUTH_TOKEN_TTL_MINUTES: i64 = 15;
pub const POST_AUTH_TOKEN_TTL_MINUTES: i64 = 5;

// Event pipeline defaults
const DEFAULT_EVENT_CHANNEL: &str = "naglfar-events";
const DEFAULT_PUBLISH_TIMEOUT_MS: u64 = 2000;
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;
const DEFAULT_RECONNECT_BACKOFF_MIN_MS: u64 = 1000;
const DEFAULT_RECONNECT_BACKOFF_MAX_MS: u64 = 30_000;

// Detection defaults
const DEFAULT_DETECTION_WINDOW_MINUTES: i64 = 5;
const DEFAULT_FAILED_VALIDATION_THRESHOLD: u64 = 10;
const DEFAULT_REQUEST_FLOOD_THRESHOLD: u64 = 300;
const DEFAULT_ISSUANCE_THRESHOLD: u64 = 20;
const DEFAULT_DETECTION_SWEEP_INTERVAL_SECS: u64 = 300;

// Retention defaults
const DEFAULT_ARCHIVE_AFTER_DAYS: i64 = 30;
const DEFAULT_PURGE_AFTER_DAYS: i64 = 90;
const DEFAULT_RETENTION_SWEEP_INTERVAL_SECS: u64 = 3600;

// Tenant extraction
const DEFAULT_FALLBACK_TENANT: &str = "store-0";

// ============================================================================
// Configuration Structures
// ============================================================================

/// Redis broker configuration (event channel between gateway and worker)
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    /// Pub/sub channel the gateway publishes decision events to
    pub event_channel: String,
    /// Upper bound on how long a publish may block the request path
    pub publish_timeout_ms: u64,
}

/// Neo4j graph store configuration
#[derive(Clone, Debug)]
pub struct GraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Analytics consumer batching and reconnect configuration
#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Flush when the in-memory batch reaches this many events
    pub batch_size: usize,
    /// Flush at least this often regardless of batch size
    pub flush_interval_ms: u64,
    /// Initial reconnect backoff; doubles per attempt
    pub reconnect_backoff_min_ms: u64,
    /// Backoff cap
    pub reconnect_backoff_max_ms: u64,
}

/// Thresholds for the scheduled abuse detection sweep
#[derive(Clone, Debug)]
pub struct DetectionConfig {
    pub window_minutes: i64,
    pub failed_validation_threshold: u64,
    pub request_flood_threshold: u64,
    pub issuance_threshold: u64,
    pub sweep_interval_secs: u64,
    pub sweep_enabled: bool,
}

/// Event retention thresholds
#[derive(Clone, Debug)]
pub struct RetentionConfig {
    pub archive_after_days: i64,
    pub purge_after_days: i64,
    pub sweep_interval_secs: u64,
    pub sweep_enabled: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    /// Shared HMAC secret for post-auth token verification. Required.
    pub signature_key: String,
    /// External auth backend callers are redirected to
    pub auth_backend_url: String,
    /// Upstream the gateway forwards authorized traffic to (optional)
    pub upstream_url: Option<String>,
    /// Tenant attributed to requests whose path carries no tenant segment
    pub fallback_tenant: String,
    pub redis: RedisConfig,
    pub graph: GraphConfig,
    pub consumer: ConsumerConfig,
    pub detection: DetectionConfig,
    pub retention: RetentionConfig,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            bind_address: std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            signature_key: {
                // The shared secret is the one unrecoverable configuration
                // error: fail loudly at startup rather than degrade silently.
                let key = std::env::var("SIGNATURE_KEY")
                    .map_err(|_| anyhow::anyhow!("SIGNATURE_KEY must be set"))?;
                if key.len() < 16 {
                    anyhow::bail!(
                        "SIGNATURE_KEY must be at least 16 characters long. \
                         Generate one with: openssl rand -base64 32"
                    );
                }
                key
            },
            auth_backend_url: std::env::var("AUTH_BACKEND_URL")
                .unwrap_or_else(|_| "http://localhost:8001/api/v1/auth/".to_string()),
            upstream_url: std::env::var("UPSTREAM_URL").ok(),
            fallback_tenant: std::env::var("FALLBACK_TENANT")
                .unwrap_or_else(|_| DEFAULT_FALLBACK_TENANT.to_string()),
            redis: RedisConfig {
                url: std::env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                event_channel: std::env::var("EVENT_CHANNEL")
                    .unwrap_or_else(|_| DEFAULT_EVENT_CHANNEL.to_string()),
                publish_timeout_ms: std::env::var("PUBLISH_TIMEOUT_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_PUBLISH_TIMEOUT_MS),
            },
            graph: GraphConfig {
                uri: std::env::var("NEO4J_URI")
                    .unwrap_or_else(|_| "bolt://127.0.0.1:7687".to_string()),
                user: std::env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string()),
                password: std::env::var("NEO4J_PASSWORD").unwrap_or_default(),
            },
            consumer: ConsumerConfig {
                batch_size: std::env::var("BATCH_SIZE")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_BATCH_SIZE),
                flush_interval_ms: std::env::var("FLUSH_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
                reconnect_backoff_min_ms: std::env::var("RECONNECT_BACKOFF_MIN_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MIN_MS),
                reconnect_backoff_max_ms: std::env::var("RECONNECT_BACKOFF_MAX_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MAX_MS),
            },
            detection: DetectionConfig {
                window_minutes: std::env::var("DETECTION_WINDOW_MINUTES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_DETECTION_WINDOW_MINUTES),
                failed_validation_threshold: std::env::var("FAILED_VALIDATION_THRESHOLD")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_FAILED_VALIDATION_THRESHOLD),
                request_flood_threshold: std::env::var("REQUEST_FLOOD_THRESHOLD")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_REQUEST_FLOOD_THRESHOLD),
                issuance_threshold: std::env::var("ISSUANCE_THRESHOLD")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_ISSUANCE_THRESHOLD),
                sweep_interval_secs: std::env::var("DETECTION_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_DETECTION_SWEEP_INTERVAL_SECS),
                sweep_enabled: std::env::var("DETECTION_SWEEP_ENABLED")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
            },
            retention: RetentionConfig {
                archive_after_days: std::env::var("ARCHIVE_AFTER_DAYS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_ARCHIVE_AFTER_DAYS),
                purge_after_days: std::env::var("PURGE_AFTER_DAYS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_PURGE_AFTER_DAYS),
                sweep_interval_secs: std::env::var("RETENTION_SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DEFAULT_RETENTION_SWEEP_INTERVAL_SECS),
                sweep_enabled: std::env::var("RETENTION_SWEEP_ENABLED")
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or(true),
            },
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

impl Config {
    /// Test fixture: a fully populated configuration without env lookups.
    pub fn for_tests(signature_key: &str) -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            signature_key: signature_key.to_string(),
            auth_backend_url: "http://auth.test/api/v1/auth/".to_string(),
            upstream_url: None,
            fallback_tenant: DEFAULT_FALLBACK_TENANT.to_string(),
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
                event_channel: "naglfar-events-test".to_string(),
                publish_timeout_ms: 100,
            },
            graph: GraphConfig {
                uri: "bolt://127.0.0.1:7687".to_string(),
                user: "neo4j".to_string(),
                password: String::new(),
            },
            consumer: ConsumerConfig {
                batch_size: 50,
                flush_interval_ms: 5000,
                reconnect_backoff_min_ms: 10,
                reconnect_backoff_max_ms: 100,
            },
            detection: DetectionConfig {
                window_minutes: 5,
                failed_validation_threshold: 10,
                request_flood_threshold: 300,
                issuance_threshold: 20,
                sweep_interval_secs: 300,
                sweep_enabled: false,
            },
            retention: RetentionConfig {
                archive_after_days: 30,
                purge_after_days: 90,
                sweep_interval_secs: 3600,
                sweep_enabled: false,
            },
            rust_log: "info".to_string(),
        }
    }
}
