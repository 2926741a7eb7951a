use std::{
    collections::{HashMap, hash_map::Iter},
    fmt::Display,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

/// Key/value settings of a single configuration section.
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value, failing if it's missing.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` if it's missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Interval expressed in whole seconds. Zero is rejected.
    pub fn seconds_with_default(
        &self,
        config_name: &str,
        default: Duration,
    ) -> Result<Duration, ConfigError> {
        match self.optional::<u64>(config_name)? {
            None => Ok(default),
            Some(0) => Err(ConfigError::InvalidValue {
                field: config_name.to_string(),
                value: "0".to_string(),
                err: "interval must be positive".to_string(),
            }),
            Some(secs) => Ok(Duration::from_secs(secs)),
        }
    }

    /// Return a comma separated list of values. Return empty vector if field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .filter(|item| !item.is_empty())
            .map(|item| parse(item.trim(), config_name))
            .collect()
    }

    pub fn iter(&self) -> Iter<'_, String, String> {
        self.inner.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ModuleConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            inner: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}
