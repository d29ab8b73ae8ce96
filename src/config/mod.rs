//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr, time::Duration};

use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use time::{Date, Month, format_description::well_known::Iso8601};
use tracing::level_filters::LevelFilter;
use url::Url;
use uuid::Uuid;

use crate::domain::types::TaskCategory;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "daybook";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_STALE_TIME_SECS: u64 = 300;
const DEFAULT_GC_DELAY_SECS: u64 = 300;
const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

/// Command-line arguments for the daybook binary.
#[derive(Debug, Parser)]
#[command(name = "daybook", version, about = "Daybook tasks, memos and profile client")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "DAYBOOK_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Query and change tasks.
    #[command(subcommand)]
    Tasks(TasksCommand),
    /// Query and change memos.
    #[command(subcommand)]
    Memos(MemosCommand),
    /// Show or update the signed-in user's profile.
    #[command(subcommand)]
    Profile(ProfileCommand),
}

impl Default for Command {
    fn default() -> Self {
        Self::Tasks(TasksCommand::List(TaskListArgs::default()))
    }
}

#[derive(Debug, Subcommand, Clone)]
pub enum TasksCommand {
    /// List tasks of a day (today by default), a month, or every open task.
    List(TaskListArgs),
    /// Show one task.
    Show { id: Uuid },
    /// Create a task for today.
    Add {
        title: String,
        #[arg(long, value_parser = parse_category)]
        category: Option<TaskCategory>,
    },
    /// Flip the completion state of a task.
    Toggle { id: Uuid },
    /// Rename a task.
    Rename { id: Uuid, title: String },
    /// Edit task fields.
    Edit(TaskEditArgs),
    /// Delete a task.
    Delete { id: Uuid },
}

#[derive(Debug, Args, Default, Clone)]
pub struct TaskListArgs {
    /// Day to list (YYYY-MM-DD).
    #[arg(long, value_parser = parse_date, conflicts_with_all = ["month", "uncompleted"])]
    pub date: Option<Date>,

    /// Month to list (YYYY-MM).
    #[arg(long, value_parser = parse_month, conflicts_with = "uncompleted")]
    pub month: Option<(i32, Month)>,

    /// List every task that is not completed yet.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub uncompleted: bool,
}

#[derive(Debug, Args, Clone)]
pub struct TaskEditArgs {
    pub id: Uuid,

    #[arg(long)]
    pub title: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    /// Remove the description.
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "description")]
    pub clear_description: bool,

    #[arg(long, value_parser = parse_category)]
    pub category: Option<TaskCategory>,

    /// Due date (YYYY-MM-DD).
    #[arg(long, value_parser = parse_date)]
    pub due: Option<Date>,

    /// Remove the due date.
    #[arg(long, action = clap::ArgAction::SetTrue, conflicts_with = "due")]
    pub clear_due: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum MemosCommand {
    /// List memos, newest first.
    List,
    /// Create a memo.
    Add { content: String },
    /// Replace the content of a memo.
    Edit { id: Uuid, content: String },
    /// Flip the pinned state of a memo.
    Pin { id: Uuid },
    /// Delete one or more memos.
    Delete {
        #[arg(required = true, num_args = 1..)]
        ids: Vec<Uuid>,
    },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ProfileCommand {
    /// Show the profile.
    Show,
    /// Update profile fields.
    Update(ProfileUpdateArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ProfileUpdateArgs {
    #[arg(long = "display-name")]
    pub display_name: Option<String>,

    #[arg(long = "theme-color")]
    pub theme_color: Option<String>,

    #[arg(long)]
    pub language: Option<String>,

    #[arg(long = "picture-url", value_hint = ValueHint::Url)]
    pub profile_picture_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct Overrides {
    /// Override the remote store base URL.
    #[arg(long = "remote-url", value_name = "URL", global = true)]
    pub remote_url: Option<String>,

    /// Override the remote store anonymous key.
    #[arg(long = "anon-key", value_name = "KEY", global = true)]
    pub anon_key: Option<String>,

    /// Override the per-request timeout.
    #[arg(long = "request-timeout-seconds", value_name = "SECONDS", global = true)]
    pub request_timeout_seconds: Option<u64>,

    /// Override the signed-in user id.
    #[arg(long = "user-id", value_name = "UUID", global = true)]
    pub user_id: Option<String>,

    /// Override the access token.
    #[arg(long = "access-token", value_name = "TOKEN", global = true)]
    pub access_token: Option<String>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the calendar timezone (IANA name).
    #[arg(long = "timezone", value_name = "TZ", global = true)]
    pub timezone: Option<String>,
}

fn parse_category(value: &str) -> Result<TaskCategory, String> {
    value.parse().map_err(|_| {
        let known: Vec<_> = TaskCategory::ALL.iter().map(|c| c.as_str()).collect();
        format!("unknown category `{value}` (expected one of {})", known.join(", "))
    })
}

fn parse_date(value: &str) -> Result<Date, String> {
    Date::parse(value, &Iso8601::DATE).map_err(|err| format!("invalid date `{value}`: {err}"))
}

fn parse_month(value: &str) -> Result<(i32, Month), String> {
    let invalid = || format!("invalid month `{value}` (expected YYYY-MM)");
    let (year, month) = value.split_once('-').ok_or_else(invalid)?;
    let year: i32 = year.parse().map_err(|_| invalid())?;
    let month: u8 = month.parse().map_err(|_| invalid())?;
    let month = Month::try_from(month).map_err(|_| invalid())?;
    Ok((year, month))
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub remote: RemoteSettings,
    pub auth: AuthSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub calendar: CalendarSettings,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub url: Option<Url>,
    pub anon_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Clone, Default)]
pub struct AuthSettings {
    pub user_id: Option<Uuid>,
    pub access_token: Option<String>,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("user_id", &self.user_id)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
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
pub struct CacheSettings {
    pub stale_time: Duration,
    pub gc_delay: Duration,
    pub gc_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CalendarSettings {
    pub timezone: Tz,
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

    builder = builder.add_source(Environment::with_prefix("DAYBOOK").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    remote: RawRemoteSettings,
    auth: RawAuthSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    calendar: RawCalendarSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(url) = overrides.remote_url.as_ref() {
            self.remote.url = Some(url.clone());
        }
        if let Some(key) = overrides.anon_key.as_ref() {
            self.remote.anon_key = Some(key.clone());
        }
        if let Some(seconds) = overrides.request_timeout_seconds {
            self.remote.request_timeout_seconds = Some(seconds);
        }
        if let Some(user_id) = overrides.user_id.as_ref() {
            self.auth.user_id = Some(user_id.clone());
        }
        if let Some(token) = overrides.access_token.as_ref() {
            self.auth.access_token = Some(token.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(timezone) = overrides.timezone.as_ref() {
            self.calendar.timezone = Some(timezone.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            remote,
            auth,
            logging,
            cache,
            calendar,
        } = raw;

        Ok(Self {
            remote: build_remote_settings(remote)?,
            auth: build_auth_settings(auth)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            calendar: build_calendar_settings(calendar)?,
        })
    }
}

fn build_remote_settings(remote: RawRemoteSettings) -> Result<RemoteSettings, LoadError> {
    let url = match non_blank(remote.url) {
        Some(value) => {
            let url = Url::parse(&value)
                .map_err(|err| LoadError::invalid("remote.url", format!("failed to parse: {err}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(LoadError::invalid(
                    "remote.url",
                    format!("unsupported scheme `{}`", url.scheme()),
                ));
            }
            Some(url)
        }
        None => None,
    };

    let timeout_secs = remote
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    let request_timeout = positive_seconds(timeout_secs, "remote.request_timeout_seconds")?;

    Ok(RemoteSettings {
        url,
        anon_key: non_blank(remote.anon_key),
        request_timeout,
    })
}

fn build_auth_settings(auth: RawAuthSettings) -> Result<AuthSettings, LoadError> {
    let user_id = non_blank(auth.user_id)
        .map(|value| {
            Uuid::parse_str(&value)
                .map_err(|err| LoadError::invalid("auth.user_id", format!("failed to parse: {err}")))
        })
        .transpose()?;

    Ok(AuthSettings {
        user_id,
        access_token: non_blank(auth.access_token),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::WARN,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let stale_time = Duration::from_secs(
        cache
            .stale_time_seconds
            .unwrap_or(DEFAULT_STALE_TIME_SECS),
    );
    let gc_delay = Duration::from_secs(cache.gc_delay_seconds.unwrap_or(DEFAULT_GC_DELAY_SECS));
    let gc_interval = positive_seconds(
        cache
            .gc_interval_seconds
            .unwrap_or(DEFAULT_GC_INTERVAL_SECS),
        "cache.gc_interval_seconds",
    )?;

    Ok(CacheSettings {
        stale_time,
        gc_delay,
        gc_interval,
    })
}

fn build_calendar_settings(calendar: RawCalendarSettings) -> Result<CalendarSettings, LoadError> {
    let timezone = match non_blank(calendar.timezone) {
        Some(name) => name.parse::<Tz>().map_err(|err| {
            LoadError::invalid("calendar.timezone", format!("unknown timezone `{name}`: {err}"))
        })?,
        None => Tz::UTC,
    };

    Ok(CalendarSettings { timezone })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteSettings {
    url: Option<String>,
    anon_key: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawAuthSettings {
    user_id: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    stale_time_seconds: Option<u64>,
    gc_delay_seconds: Option<u64>,
    gc_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCalendarSettings {
    timezone: Option<String>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn positive_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert!(settings.remote.url.is_none());
        assert_eq!(settings.remote.request_timeout, Duration::from_secs(10));
        assert_eq!(settings.cache.stale_time, Duration::from_secs(300));
        assert_eq!(settings.cache.gc_delay, Duration::from_secs(300));
        assert_eq!(settings.cache.gc_interval, Duration::from_secs(60));
        assert_eq!(settings.calendar.timezone, Tz::UTC);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.remote.url = Some("https://file.example".to_string());
        raw.logging.level = Some("info".to_string());

        let overrides = Overrides {
            remote_url: Some("https://cli.example".to_string()),
            log_level: Some("debug".to_string()),
            log_json: Some(true),
            timezone: Some("Asia/Shanghai".to_string()),
            ..Default::default()
        };

        raw.apply_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(
            settings.remote.url.as_ref().map(Url::as_str),
            Some("https://cli.example/")
        );
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert!(matches!(settings.logging.format, LogFormat::Json));
        assert_eq!(settings.calendar.timezone, chrono_tz::Asia::Shanghai);
    }

    #[test]
    fn invalid_values_name_their_key() {
        let mut raw = RawSettings::default();
        raw.calendar.timezone = Some("Mars/Olympus".to_string());
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { key: "calendar.timezone", .. }));

        let mut raw = RawSettings::default();
        raw.cache.gc_interval_seconds = Some(0);
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { key: "cache.gc_interval_seconds", .. }));

        let mut raw = RawSettings::default();
        raw.auth.user_id = Some("not-a-uuid".to_string());
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { key: "auth.user_id", .. }));

        let mut raw = RawSettings::default();
        raw.remote.url = Some("ftp://example".to_string());
        let err = Settings::from_raw(raw).unwrap_err();
        assert!(matches!(err, LoadError::Invalid { key: "remote.url", .. }));
    }

    #[test]
    fn blank_credentials_are_absent() {
        let mut raw = RawSettings::default();
        raw.auth.access_token = Some("   ".to_string());
        let settings = Settings::from_raw(raw).expect("valid settings");
        assert!(settings.auth.access_token.is_none());
    }

    #[test]
    fn auth_debug_hides_token() {
        let auth = AuthSettings {
            user_id: None,
            access_token: Some("secret".to_string()),
        };
        assert!(!format!("{auth:?}").contains("secret"));
    }

    #[test]
    fn default_to_listing_tasks() {
        let args = CliArgs::parse_from(["daybook"]);
        let command = args.command.unwrap_or_default();
        assert!(matches!(
            command,
            Command::Tasks(TasksCommand::List(TaskListArgs {
                date: None,
                month: None,
                uncompleted: false
            }))
        ));
    }

    #[test]
    fn parse_task_list_arguments() {
        let args = CliArgs::parse_from(["daybook", "tasks", "list", "--date", "2026-10-19"]);
        match args.command.expect("tasks command") {
            Command::Tasks(TasksCommand::List(list)) => {
                assert_eq!(list.date, Some(date!(2026 - 10 - 19)));
            }
            _ => panic!("wrong command parsed"),
        }

        let args = CliArgs::parse_from(["daybook", "tasks", "list", "--month", "2026-02"]);
        match args.command.expect("tasks command") {
            Command::Tasks(TasksCommand::List(list)) => {
                assert_eq!(list.month, Some((2026, Month::February)));
            }
            _ => panic!("wrong command parsed"),
        }

        assert!(
            CliArgs::try_parse_from(["daybook", "tasks", "list", "--month", "2026-13"]).is_err()
        );
    }

    #[test]
    fn global_overrides_follow_subcommands() {
        let args = CliArgs::parse_from([
            "daybook",
            "memos",
            "delete",
            "--remote-url",
            "https://override.example",
            "00000000-0000-0000-0000-000000000001",
            "00000000-0000-0000-0000-000000000002",
        ]);

        assert_eq!(
            args.overrides.remote_url.as_deref(),
            Some("https://override.example")
        );
        match args.command.expect("memos command") {
            Command::Memos(MemosCommand::Delete { ids }) => assert_eq!(ids.len(), 2),
            _ => panic!("wrong command parsed"),
        }
    }

    #[test]
    fn parse_task_add_category() {
        let args = CliArgs::parse_from(["daybook", "tasks", "add", "Buy milk", "--category", "work"]);
        match args.command.expect("tasks command") {
            Command::Tasks(TasksCommand::Add { title, category }) => {
                assert_eq!(title, "Buy milk");
                assert_eq!(category, Some(TaskCategory::Work));
            }
            _ => panic!("wrong command parsed"),
        }

        assert!(
            CliArgs::try_parse_from(["daybook", "tasks", "add", "x", "--category", "hobby"])
                .is_err()
        );
    }
}
