//! Service settings parsed from `quantum.kdl`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kdl::{KdlDocument, KdlNode};

use crate::{ConfigError, ConfigResult};

/// Name of the config file looked up in each search directory.
pub const CONFIG_FILE: &str = "quantum.kdl";

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "QUANTUM_MERGE_";

/// Largest accepted `scheduler.queue-capacity`.
pub const MAX_QUEUE_CAPACITY: usize = 1 << 20;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Deployment environment; `production` switches logging to JSON.
    pub env: String,
    pub log_level: String,
    pub scheduler: SchedulerSettings,
    pub server: ServerSettings,
    pub executor: Option<ExecutorSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub dequeue_timeout: Duration,
    pub poll_interval: Duration,
    pub speculation_depth: usize,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub listen: SocketAddr,
}

/// The `executor "shell" { ... }` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub kind: String,
    /// Command template; see [`crate::VariableContext`].
    pub command: String,
    pub timeout: Option<Duration>,
    pub env: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: "development".to_string(),
            log_level: "info".to_string(),
            scheduler: SchedulerSettings::default(),
            server: ServerSettings::default(),
            executor: None,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(5),
            dequeue_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            speculation_depth: 1,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

impl Settings {
    pub fn is_production(&self) -> bool {
        self.env.eq_ignore_ascii_case("production")
    }

    /// Check value ranges the parser cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.scheduler.workers == 0 {
            return Err(ConfigError::invalid("scheduler.workers", "must be at least 1"));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "scheduler.queue-capacity",
                "must be at least 1",
            ));
        }
        if self.scheduler.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::invalid(
                "scheduler.queue-capacity",
                format!("must be at most {}", MAX_QUEUE_CAPACITY),
            ));
        }
        if let Some(executor) = &self.executor {
            if executor.command.trim().is_empty() {
                return Err(ConfigError::invalid("executor.command", "must not be empty"));
            }
        }
        Ok(())
    }

    /// Apply `QUANTUM_MERGE_*` overrides. `lookup` receives the full variable name.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<()> {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(env) = var("ENV") {
            self.env = env;
        }
        if let Some(level) = var("LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(workers) = var("WORKERS") {
            self.scheduler.workers = workers.trim().parse().map_err(|_| {
                ConfigError::invalid(
                    format!("{}WORKERS", ENV_PREFIX),
                    format!("not a number: {}", workers),
                )
            })?;
        }
        if let Some(listen) = var("LISTEN") {
            self.server.listen = parse_listen(&listen, &format!("{}LISTEN", ENV_PREFIX))?;
        }
        Ok(())
    }
}

/// Parse settings from KDL text. Every node is optional.
pub fn parse_settings(kdl: &str) -> ConfigResult<Settings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut settings = Settings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "env" => settings.env = required_string(node, "env")?,
            "log-level" => settings.log_level = required_string(node, "log-level")?,
            "scheduler" => parse_scheduler(node, &mut settings.scheduler)?,
            "server" => parse_server(node, &mut settings.server)?,
            "executor" => {
                if settings.executor.is_some() {
                    return Err(ConfigError::Duplicate("executor".to_string()));
                }
                settings.executor = Some(parse_executor(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(settings)
}

fn parse_scheduler(node: &KdlNode, scheduler: &mut SchedulerSettings) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let name = child.name().value();
        let field = format!("scheduler.{}", name);
        match name {
            "workers" => scheduler.workers = count_arg(child, &field)?,
            "queue-capacity" => scheduler.queue_capacity = count_arg(child, &field)?,
            "speculation-depth" => scheduler.speculation_depth = count_arg(child, &field)?,
            "enqueue-timeout" => scheduler.enqueue_timeout = duration_arg(child, &field)?,
            "dequeue-timeout" => scheduler.dequeue_timeout = duration_arg(child, &field)?,
            "poll-interval" => scheduler.poll_interval = duration_arg(child, &field)?,
            "shutdown-grace" => scheduler.shutdown_grace = duration_arg(child, &field)?,
            _ => {}
        }
    }
    Ok(())
}

fn parse_server(node: &KdlNode, server: &mut ServerSettings) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        if child.name().value() == "listen" {
            let listen = required_string(child, "server.listen")?;
            server.listen = parse_listen(&listen, "server.listen")?;
        }
    }
    Ok(())
}

fn parse_executor(node: &KdlNode) -> ConfigResult<ExecutorSettings> {
    let kind = get_first_string_arg(node).unwrap_or_else(|| "shell".to_string());
    if kind != "shell" {
        return Err(ConfigError::invalid(
            "executor",
            format!("unknown executor type: {}", kind),
        ));
    }

    let mut command = None;
    let mut timeout = None;
    let mut env = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "command" => command = Some(required_string(child, "executor.command")?),
                "timeout" => timeout = Some(duration_arg(child, "executor.timeout")?),
                "env" => {
                    if let Some(vars) = child.children() {
                        for var in vars.nodes() {
                            let key = var.name().value().to_string();
                            if let Some(val) = get_first_string_arg(var) {
                                env.insert(key, val);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let command =
        command.ok_or_else(|| ConfigError::MissingField("executor.command".to_string()))?;

    Ok(ExecutorSettings {
        kind,
        command,
        timeout,
        env,
    })
}

/// Parse a duration such as `250ms`, `5s`, `30m` or `2h`. A bare number is seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match unit.trim() {
        "ms" => Some(Duration::from_millis(value)),
        "" | "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(value.checked_mul(3600)?)),
        _ => None,
    }
}

fn parse_listen(value: &str, field: &str) -> ConfigResult<SocketAddr> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(field, format!("{}: {}", value, e)))
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn required_string(node: &KdlNode, field: &str) -> ConfigResult<String> {
    get_first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

fn count_arg(node: &KdlNode, field: &str) -> ConfigResult<usize> {
    let value =
        get_first_int_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    usize::try_from(value)
        .map_err(|_| ConfigError::invalid(field, format!("expected a count, got {}", value)))
}

fn duration_arg(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    if let Some(secs) = get_first_int_arg(node) {
        return u64::try_from(secs)
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::invalid(field, format!("negative duration: {}", secs)));
    }
    let text = required_string(node, field)?;
    parse_duration(&text)
        .ok_or_else(|| ConfigError::invalid(field, format!("not a duration: {}", text)))
}

/// Settings together with the file they came from.
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: Settings,
    /// `None` when no config file was found and defaults were used.
    pub source: Option<PathBuf>,
}

/// Directories searched for [`CONFIG_FILE`], in order.
pub fn search_dirs(home: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs = vec![PathBuf::from(".")];
    if let Some(home) = home {
        dirs.push(home.join(".quantum-merge"));
    }
    dirs.push(PathBuf::from("/etc/quantum-merge"));
    dirs
}

/// First existing config file in `dirs`.
pub fn discover(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|path| path.is_file())
}

/// Load settings from `explicit` or the standard locations, then apply the
/// process environment and validate.
pub fn load(explicit: Option<&Path>) -> ConfigResult<LoadedSettings> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    load_from(explicit, &search_dirs(home.as_deref()), |name| {
        std::env::var(name).ok()
    })
}

fn load_from(
    explicit: Option<&Path>,
    dirs: &[PathBuf],
    lookup: impl Fn(&str) -> Option<String>,
) -> ConfigResult<LoadedSettings> {
    let source = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => discover(dirs),
    };

    let mut settings = match &source {
        Some(path) => parse_settings(&std::fs::read_to_string(path)?)?,
        None => Settings::default(),
    };
    settings.apply_env_overrides(lookup)?;
    settings.validate()?;

    Ok(LoadedSettings { settings, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            env "production"
            log-level "debug"

            scheduler {
                workers 8
                queue-capacity 250
                enqueue-timeout "2s"
                dequeue-timeout "500ms"
                poll-interval 3
                speculation-depth 2
                shutdown-grace "1m"
            }

            server {
                listen "127.0.0.1:9000"
            }

            executor "shell" {
                command "make ci PR=${pr.number}"
                timeout "30m"
                env {
                    CI "true"
                }
            }
        "#;

        let settings = parse_settings(kdl).unwrap();
        assert!(settings.is_production());
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.scheduler.workers, 8);
        assert_eq!(settings.scheduler.queue_capacity, 250);
        assert_eq!(settings.scheduler.enqueue_timeout, Duration::from_secs(2));
        assert_eq!(settings.scheduler.dequeue_timeout, Duration::from_millis(500));
        assert_eq!(settings.scheduler.poll_interval, Duration::from_secs(3));
        assert_eq!(settings.scheduler.speculation_depth, 2);
        assert_eq!(settings.scheduler.shutdown_grace, Duration::from_secs(60));
        assert_eq!(settings.server.listen, "127.0.0.1:9000".parse().unwrap());

        let executor = settings.executor.unwrap();
        assert_eq!(executor.kind, "shell");
        assert_eq!(executor.command, "make ci PR=${pr.number}");
        assert_eq!(executor.timeout, Some(Duration::from_secs(1800)));
        assert_eq!(executor.env.get("CI").map(String::as_str), Some("true"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = parse_settings("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.env, "development");
        assert_eq!(settings.server.listen.port(), 8090);
        assert!(settings.executor.is_none());
        settings.validate().unwrap();
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("5 m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("5d"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("-1s"), None);
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = parse_settings(r#"scheduler { workers -1 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { field, .. } if field == "scheduler.workers"));

        let err = parse_settings(r#"scheduler { poll-interval "soon" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = parse_settings(r#"server { listen "nowhere" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = parse_settings(r#"executor "docker" { command "x" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = parse_settings(r#"executor "shell" { timeout "5s" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(_)));

        let err = parse_settings("executor { command \"a\" }\nexecutor { command \"b\" }")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Duplicate(_)));
    }

    #[test]
    fn test_validate_ranges() {
        let settings = parse_settings(r#"scheduler { workers 0 }"#).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "scheduler.workers"
        ));

        let settings = parse_settings(r#"scheduler { queue-capacity 0 }"#).unwrap();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.scheduler.queue_capacity = MAX_QUEUE_CAPACITY;
        assert!(settings.validate().is_ok());
        settings.scheduler.queue_capacity = MAX_QUEUE_CAPACITY + 1;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "scheduler.queue-capacity"
        ));

        let settings = parse_settings(r#"scheduler { queue-capacity 4000000000 }"#).unwrap();
        assert!(settings.validate().is_err());

        let settings = parse_settings(r#"executor "shell" { command "  " }"#).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("QUANTUM_MERGE_ENV", "production"),
            ("QUANTUM_MERGE_LOG_LEVEL", "warn"),
            ("QUANTUM_MERGE_WORKERS", "12"),
            ("QUANTUM_MERGE_LISTEN", "127.0.0.1:7000"),
        ]);
        let mut settings = Settings::default();
        settings
            .apply_env_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert!(settings.is_production());
        assert_eq!(settings.log_level, "warn");
        assert_eq!(settings.scheduler.workers, 12);
        assert_eq!(settings.server.listen.port(), 7000);

        let err = Settings::default()
            .apply_env_overrides(|name| (name == "QUANTUM_MERGE_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_discovery_takes_first_hit() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join(CONFIG_FILE), "log-level \"trace\"").unwrap();

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(discover(&dirs), Some(second.path().join(CONFIG_FILE)));

        std::fs::write(first.path().join(CONFIG_FILE), "log-level \"debug\"").unwrap();
        let loaded = load_from(None, &dirs, no_env).unwrap();
        assert_eq!(loaded.settings.log_level, "debug");
        assert_eq!(loaded.source, Some(first.path().join(CONFIG_FILE)));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let empty = tempfile::tempdir().unwrap();
        let loaded = load_from(None, &[empty.path().to_path_buf()], no_env).unwrap();
        assert!(loaded.source.is_none());
        assert_eq!(loaded.settings, Settings::default());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.kdl");
        let err = load_from(Some(&missing), &[], no_env).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_search_dirs_order() {
        let dirs = search_dirs(Some(Path::new("/home/dev")));
        assert_eq!(
            dirs,
            vec![
                PathBuf::from("."),
                PathBuf::from("/home/dev/.quantum-merge"),
                PathBuf::from("/etc/quantum-merge"),
            ]
        );
        assert_eq!(search_dirs(None).len(), 2);
    }
}
