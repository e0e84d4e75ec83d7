use std::{str::FromStr, time::Duration};

use crate::error::{Error, Result};

/// Engine tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Posts per results page.
    pub page_size: usize,
    pub search_ttl: Duration,
    pub tag_counts_ttl: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
    /// Most entries evicted under one write lock.
    pub sweep_batch: usize,
    /// Histogram length when the caller does not ask for one.
    pub top_tags: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            search_ttl: Duration::from_secs(5),
            tag_counts_ttl: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(2),
            sweep_batch: 256,
            top_tags: 15,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `TAGBOORU_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `TAGBOORU_*` key. Values that do not parse are an error rather than
    /// silently ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(n) = parse(&lookup, "TAGBOORU_PAGE_SIZE")? {
            cfg.page_size = n;
        }
        if let Some(ms) = parse(&lookup, "TAGBOORU_SEARCH_TTL_MS")? {
            cfg.search_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TAGBOORU_TAG_COUNTS_TTL_MS")? {
            cfg.tag_counts_ttl = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "TAGBOORU_SWEEP_INTERVAL_MS")? {
            cfg.sweep_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "TAGBOORU_SWEEP_BATCH")? {
            cfg.sweep_batch = n;
        }
        if let Some(n) = parse(&lookup, "TAGBOORU_TOP_TAGS")? {
            cfg.top_tags = n;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Config("page size must be at least 1".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::Config(
                "sweep interval must be greater than zero".into(),
            ));
        }
        if self.sweep_batch == 0 {
            return Err(Error::Config("sweep batch must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key}: invalid value '{raw}'")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<EngineConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EngineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_overrides() {
        assert_eq!(from_pairs(&[]).unwrap(), EngineConfig::default());
    }

    #[test]
    fn overrides_apply() {
        let cfg = from_pairs(&[
            ("TAGBOORU_PAGE_SIZE", "50"),
            ("TAGBOORU_SEARCH_TTL_MS", "1500"),
            ("TAGBOORU_TOP_TAGS", " 3 "),
        ])
        .unwrap();
        assert_eq!(cfg.page_size, 50);
        assert_eq!(cfg.search_ttl, Duration::from_millis(1500));
        assert_eq!(cfg.top_tags, 3);
        assert_eq!(cfg.tag_counts_ttl, Duration::from_secs(10));
    }

    #[test]
    fn unparsable_value_is_config_error() {
        let err = from_pairs(&[("TAGBOORU_SWEEP_BATCH", "lots")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("TAGBOORU_SWEEP_BATCH"));
    }

    #[test]
    fn zero_page_size_rejected() {
        let err = from_pairs(&[("TAGBOORU_PAGE_SIZE", "0")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
