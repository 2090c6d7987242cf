use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;
use viewsync::schema::DEFAULT_CLIENTS_TABLE;

/// Process configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub task_id: String,
    pub workers: usize,
    pub cvr_db: PathBuf,
    pub replica_file: PathBuf,
    pub schema_file: Option<PathBuf>,
    pub debounce_ms: u64,
    pub replica_readers: usize,
    pub drain_timeout: Duration,
    pub auth_secret: String,
    pub clients_table: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset keys take their defaults;
    /// set but unparseable numbers are an error.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let number = |key: &str, default: u64| -> anyhow::Result<u64> {
            match get(key) {
                Some(v) => v
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a number, got `{v}`")),
                None => Ok(default),
            }
        };

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get() as u64)
            .unwrap_or(1);

        Ok(Config {
            listen_addr: get("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:4848".to_string()),
            task_id: get("VIEWSYNC_TASK_ID").unwrap_or_else(default_task_id),
            workers: number("VIEWSYNC_WORKERS", default_workers)?.max(1) as usize,
            cvr_db: PathBuf::from(get("VIEWSYNC_CVR_DB").unwrap_or_else(|| "data/cvr.redb".to_string())),
            replica_file: PathBuf::from(
                get("VIEWSYNC_REPLICA_FILE").unwrap_or_else(|| "data/replica.cbor".to_string()),
            ),
            schema_file: get("VIEWSYNC_SCHEMA_FILE")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            debounce_ms: number("SAVE_DEBOUNCE_MS", 2000)?,
            replica_readers: number("VIEWSYNC_REPLICA_READERS", 4)?.max(1) as usize,
            drain_timeout: Duration::from_millis(number("VIEWSYNC_DRAIN_TIMEOUT_MS", 5000)?),
            auth_secret: get("VIEWSYNC_AUTH_SECRET").unwrap_or_default(),
            clients_table: get("VIEWSYNC_CLIENTS_TABLE")
                .unwrap_or_else(|| DEFAULT_CLIENTS_TABLE.to_string()),
        })
    }
}

fn default_task_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "viewsync".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:4848");
        assert_eq!(config.cvr_db, PathBuf::from("data/cvr.redb"));
        assert_eq!(config.debounce_ms, 2000);
        assert_eq!(config.replica_readers, 4);
        assert_eq!(config.drain_timeout, Duration::from_millis(5000));
        assert_eq!(config.clients_table, DEFAULT_CLIENTS_TABLE);
        assert!(config.schema_file.is_none());
        assert!(config.workers >= 1);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("VIEWSYNC_WORKERS", "0"),
            ("VIEWSYNC_TASK_ID", "task-a"),
            ("VIEWSYNC_SCHEMA_FILE", "schema.json"),
            ("VIEWSYNC_AUTH_SECRET", "s3cret"),
        ]))
        .unwrap();
        assert_eq!(config.workers, 1);
        assert_eq!(config.task_id, "task-a");
        assert_eq!(config.schema_file, Some(PathBuf::from("schema.json")));
        assert_eq!(config.auth_secret, "s3cret");
    }

    #[test]
    fn test_bad_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("SAVE_DEBOUNCE_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("SAVE_DEBOUNCE_MS"));
    }
}
