//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{PageCacheOptions, QueryCacheOptions};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "quire";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CONTENT_DATASET: &str = "production";
const DEFAULT_CONTENT_API_VERSION: &str = "2025-02-19";
const DEFAULT_CONTENT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STORE_CAPACITY: usize = 1000;
const DEFAULT_EVENTS_RECONNECT_SECS: u64 = 5;
const DEFAULT_EVENTS_CONSUME_INTERVAL_MS: u64 = 5000;
const DEFAULT_EVENTS_BATCH_LIMIT: usize = 100;
const DEFAULT_EVENTS_QUEUE_LIMIT: usize = 1000;
const DEFAULT_EXCLUDED_PAGE_PREFIXES: [&str; 2] = ["/api/cache", "/studio"];

/// Command-line arguments for the quire binary.
#[derive(Debug, Parser)]
#[command(name = "quire", version, about = "Quire edge cache server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUIRE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the quire HTTP service.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the content API base URL.
    #[arg(long = "content-api-url", value_name = "URL")]
    pub content_api_url: Option<String>,

    /// Override the content dataset.
    #[arg(long = "content-dataset", value_name = "NAME")]
    pub content_dataset: Option<String>,

    /// Toggle the cache store; off behaves like an environment without one.
    #[arg(
        long = "cache-store-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_store_enabled: Option<bool>,

    /// Toggle the push-event listener.
    #[arg(
        long = "events-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub events_enabled: Option<bool>,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub content: ContentSettings,
    pub cache: CacheSettings,
    pub events: EventsSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub api_url: Url,
    pub dataset: String,
    pub api_version: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub query_enabled: bool,
    pub page_enabled: bool,
    pub store_enabled: bool,
    pub query: QueryCacheOptions,
    pub page: PageCacheOptions,
    pub excluded_page_prefixes: Vec<String>,
    pub store_capacity: NonZeroUsize,
    pub auto_consume_interval: Duration,
    pub consume_batch_limit: NonZeroUsize,
    pub event_queue_limit: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct EventsSettings {
    pub enabled: bool,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("QUIRE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    content: RawContentSettings,
    cache: RawCacheSettings,
    events: RawEventsSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.content_api_url.as_ref() {
            self.content.api_url = Some(url.clone());
        }
        if let Some(dataset) = overrides.content_dataset.as_ref() {
            self.content.dataset = Some(dataset.clone());
        }
        if let Some(enabled) = overrides.cache_store_enabled {
            self.cache.store.enabled = Some(enabled);
        }
        if let Some(enabled) = overrides.events_enabled {
            self.events.enabled = Some(enabled);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            content,
            cache,
            events,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let content = build_content_settings(content)?;
        let cache = build_cache_settings(cache, &events)?;
        let events = build_events_settings(events)?;

        Ok(Self {
            server,
            logging,
            content,
            cache,
            events,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_content_settings(content: RawContentSettings) -> Result<ContentSettings, LoadError> {
    let raw_url = content
        .api_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("content.api_url", "must be set"))?;
    let api_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("content.api_url", format!("invalid URL: {err}")))?;
    if !matches!(api_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "content.api_url",
            "scheme must be http or https",
        ));
    }

    let dataset = non_blank(content.dataset, DEFAULT_CONTENT_DATASET);
    let api_version = non_blank(content.api_version, DEFAULT_CONTENT_API_VERSION);
    let api_version = api_version
        .strip_prefix('v')
        .map(str::to_string)
        .unwrap_or(api_version);

    let timeout_secs = content
        .request_timeout_seconds
        .unwrap_or(DEFAULT_CONTENT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "content.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ContentSettings {
        api_url,
        dataset,
        api_version,
        request_timeout: Duration::from_secs(timeout_secs),
    })
}

fn build_cache_settings(
    cache: RawCacheSettings,
    events: &RawEventsSettings,
) -> Result<CacheSettings, LoadError> {
    let query_defaults = QueryCacheOptions::default();
    let query = QueryCacheOptions {
        max_age: cache.query.max_age.unwrap_or(query_defaults.max_age),
        stale_while_revalidate: cache
            .query
            .stale_while_revalidate
            .unwrap_or(query_defaults.stale_while_revalidate),
        key_prefix: non_blank(cache.query.key_prefix, &query_defaults.key_prefix),
    };

    let page_defaults = PageCacheOptions::default();
    let page = PageCacheOptions {
        max_age: cache.page.max_age.unwrap_or(page_defaults.max_age),
        stale_while_revalidate: cache
            .page
            .stale_while_revalidate
            .unwrap_or(page_defaults.stale_while_revalidate),
        browser_max_age: cache
            .page
            .browser_max_age
            .unwrap_or(page_defaults.browser_max_age),
        disabled: false,
    };

    let excluded_page_prefixes = match cache.page.excluded_prefixes {
        Some(prefixes) => {
            for prefix in &prefixes {
                if !prefix.starts_with('/') {
                    return Err(LoadError::invalid(
                        "cache.page.excluded_prefixes",
                        format!("prefix `{prefix}` must start with `/`"),
                    ));
                }
            }
            prefixes
        }
        None => DEFAULT_EXCLUDED_PAGE_PREFIXES
            .iter()
            .map(|prefix| prefix.to_string())
            .collect(),
    };

    let store_capacity = non_zero_usize(
        cache.store.capacity.unwrap_or(DEFAULT_STORE_CAPACITY),
        "cache.store.capacity",
    )?;

    let interval_ms = events
        .consume_interval_ms
        .unwrap_or(DEFAULT_EVENTS_CONSUME_INTERVAL_MS);
    if interval_ms == 0 {
        return Err(LoadError::invalid(
            "events.consume_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(CacheSettings {
        query_enabled: cache.query.enabled.unwrap_or(true),
        page_enabled: cache.page.enabled.unwrap_or(true),
        store_enabled: cache.store.enabled.unwrap_or(true),
        query,
        page,
        excluded_page_prefixes,
        store_capacity,
        auto_consume_interval: Duration::from_millis(interval_ms),
        consume_batch_limit: non_zero_usize(
            events.batch_limit.unwrap_or(DEFAULT_EVENTS_BATCH_LIMIT),
            "events.batch_limit",
        )?,
        event_queue_limit: non_zero_usize(
            events.queue_limit.unwrap_or(DEFAULT_EVENTS_QUEUE_LIMIT),
            "events.queue_limit",
        )?,
    })
}

fn build_events_settings(events: RawEventsSettings) -> Result<EventsSettings, LoadError> {
    let reconnect_secs = events
        .reconnect_delay_seconds
        .unwrap_or(DEFAULT_EVENTS_RECONNECT_SECS);
    if reconnect_secs == 0 {
        return Err(LoadError::invalid(
            "events.reconnect_delay_seconds",
            "must be greater than zero",
        ));
    }

    Ok(EventsSettings {
        enabled: events.enabled.unwrap_or(true),
        reconnect_delay: Duration::from_secs(reconnect_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawContentSettings {
    api_url: Option<String>,
    dataset: Option<String>,
    api_version: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    query: RawQueryCacheSettings,
    page: RawPageCacheSettings,
    store: RawStoreSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueryCacheSettings {
    enabled: Option<bool>,
    max_age: Option<u64>,
    stale_while_revalidate: Option<u64>,
    key_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPageCacheSettings {
    enabled: Option<bool>,
    max_age: Option<u64>,
    stale_while_revalidate: Option<u64>,
    browser_max_age: Option<u64>,
    excluded_prefixes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    enabled: Option<bool>,
    capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawEventsSettings {
    enabled: Option<bool>,
    reconnect_delay_seconds: Option<u64>,
    consume_interval_ms: Option<u64>,
    batch_limit: Option<usize>,
    queue_limit: Option<usize>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_blank(value: Option<String>, default: &str) -> String {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    fn raw_with_content() -> RawSettings {
        let mut raw = RawSettings::default();
        raw.content.api_url = Some("https://abc123.api.example.com".to_string());
        raw
    }

    #[test]
    fn defaults_resolve() {
        let settings = Settings::from_raw(raw_with_content()).expect("valid settings");

        assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
        assert_eq!(settings.content.dataset, "production");
        assert_eq!(settings.content.api_version, DEFAULT_CONTENT_API_VERSION);
        assert!(settings.cache.store_enabled);
        assert_eq!(settings.cache.query.max_age, 60);
        assert_eq!(settings.cache.page.stale_while_revalidate, 300);
        assert_eq!(
            settings.cache.excluded_page_prefixes,
            vec!["/api/cache", "/studio"]
        );
        assert!(settings.events.enabled);
    }

    #[test]
    fn content_api_url_is_required() {
        let err = Settings::from_raw(RawSettings::default()).expect_err("missing url");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "content.api_url",
                ..
            }
        ));
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = raw_with_content();
        raw.server.port = Some(4000);
        raw.logging.level = Some("info".to_string());
        raw.cache.store.enabled = Some(true);

        let overrides = ServeOverrides {
            server_port: Some(4321),
            log_level: Some("debug".to_string()),
            cache_store_enabled: Some(false),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.server.addr.port(), 4321);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert!(!settings.cache.store_enabled);
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = raw_with_content();
        let overrides = ServeOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_serve_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn api_version_prefix_is_normalized() {
        let mut raw = raw_with_content();
        raw.content.api_version = Some("v2021-10-21".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert_eq!(settings.content.api_version, "2021-10-21");
    }

    #[test]
    fn zero_store_capacity_is_rejected() {
        let mut raw = raw_with_content();
        raw.cache.store.capacity = Some(0);
        let err = Settings::from_raw(raw).expect_err("zero capacity");
        assert!(err.to_string().contains("cache.store.capacity"));
    }

    #[test]
    fn excluded_prefixes_must_be_paths() {
        let mut raw = raw_with_content();
        raw.cache.page.excluded_prefixes = Some(vec!["api".to_string()]);
        assert!(Settings::from_raw(raw).is_err());
    }

    #[test]
    fn cache_settings_feed_cache_config() {
        let mut raw = raw_with_content();
        raw.cache.query.max_age = Some(15);
        raw.cache.query.key_prefix = Some("preview".to_string());
        raw.events.batch_limit = Some(7);
        let settings = Settings::from_raw(raw).expect("valid settings");

        let config = CacheConfig::from(&settings.cache);
        assert_eq!(config.query.max_age, 15);
        assert_eq!(config.query.key_prefix, "preview");
        assert_eq!(config.consume_batch_limit, 7);
        assert_eq!(config.auto_consume_interval_ms, DEFAULT_EVENTS_CONSUME_INTERVAL_MS);
    }

    #[test]
    fn default_to_serve_command() {
        let args = CliArgs::parse_from(["quire"]);
        assert!(args.command.is_none());

        let args = CliArgs::parse_from(["quire", "serve", "--server-port", "8080"]);
        match args.command {
            Some(Command::Serve(serve)) => assert_eq!(serve.overrides.server_port, Some(8080)),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
