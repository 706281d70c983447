use super::KeeperConfig;
use std::str::FromStr;

impl KeeperConfig {
    /// Applies `TOKENKEEPER_*` env vars over the current values.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup. Unparseable values are ignored
    /// and the previous value is kept.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        set_string(&lookup, "TOKENKEEPER_DB_PATH", &mut self.database.path);
        set_string(&lookup, "TOKENKEEPER_BIND", &mut self.server.bind);

        set_string(&lookup, "TOKENKEEPER_TOKEN_URL", &mut self.provider.token_url);
        set_string(&lookup, "TOKENKEEPER_REVOKE_URL", &mut self.provider.revoke_url);
        set_string(&lookup, "TOKENKEEPER_CLIENT_ID", &mut self.provider.client_id);
        set_string(&lookup, "TOKENKEEPER_CLIENT_SECRET", &mut self.provider.client_secret);
        set_string(&lookup, "TOKENKEEPER_REDIRECT_URI", &mut self.provider.redirect_uri);

        set_parsed(&lookup, "TOKENKEEPER_REFRESH_BUFFER_MINUTES", &mut self.refresh.buffer_minutes);
        set_parsed(&lookup, "TOKENKEEPER_FAILURE_THRESHOLD", &mut self.refresh.failure_threshold);
        set_parsed(&lookup, "TOKENKEEPER_REFRESH_TIMEOUT_SECONDS", &mut self.refresh.timeout_seconds);

        set_parsed(&lookup, "TOKENKEEPER_SCHEDULER_ENABLED", &mut self.scheduler.enabled);
        set_parsed(&lookup, "TOKENKEEPER_SCHEDULER_INTERVAL_MINUTES", &mut self.scheduler.interval_minutes);
        set_parsed(&lookup, "TOKENKEEPER_SCHEDULER_BATCH_SIZE", &mut self.scheduler.batch_size);
        set_parsed(&lookup, "TOKENKEEPER_SCHEDULER_MAX_CONCURRENT", &mut self.scheduler.max_concurrent);

        set_parsed(&lookup, "TOKENKEEPER_RECONCILE_ENABLED", &mut self.reconciliation.enabled);
        set_parsed(&lookup, "TOKENKEEPER_RECONCILE_INTERVAL_HOURS", &mut self.reconciliation.interval_hours);
        set_parsed(&lookup, "TOKENKEEPER_RECONCILE_REMEDIATE", &mut self.reconciliation.remediate_expired);
    }
}

fn set_string<F>(lookup: &F, key: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(key) {
        if !v.is_empty() {
            *target = v;
        }
    }
}

fn set_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(v) = lookup(key) {
        if let Ok(parsed) = v.parse::<T>() {
            *target = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TOKENKEEPER_DB_PATH", "/tmp/keeper.db"),
            ("TOKENKEEPER_CLIENT_SECRET", "shh"),
            ("TOKENKEEPER_SCHEDULER_MAX_CONCURRENT", "3"),
            ("TOKENKEEPER_RECONCILE_REMEDIATE", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = KeeperConfig::default();
        config.apply_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.database.path, "/tmp/keeper.db");
        assert_eq!(config.provider.client_secret, "shh");
        assert_eq!(config.scheduler.max_concurrent, 3);
        assert!(config.reconciliation.remediate_expired);
    }

    #[test]
    fn test_unparseable_values_keep_previous() {
        let mut config = KeeperConfig::default();
        config.apply_overrides(|k| match k {
            "TOKENKEEPER_SCHEDULER_BATCH_SIZE" => Some("lots".to_string()),
            "TOKENKEEPER_BIND" => Some(String::new()),
            _ => None,
        });

        assert_eq!(config.scheduler.batch_size, 50);
        assert_eq!(config.server.bind, "127.0.0.1:8095");
    }
}
