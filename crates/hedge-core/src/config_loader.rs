use crate::config::AppConfig;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads application configuration by merging a TOML file with the
    /// environment variables named in spec.md §6, the latter taking
    /// precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but cannot be parsed.
    pub fn load(path: &str) -> Result<AppConfig> {
        let config: AppConfig = Figment::from(figment::providers::Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("HEDGE_"))
            .extract()?;
        Ok(config)
    }
}
