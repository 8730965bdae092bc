use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Named log geometry stored in the CLI config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub name: String,
    pub device: Option<PathBuf>,
    pub pages: Option<u32>,
    pub block_size: Option<u32>,
    pub buffer_pages: Option<usize>,
    pub inline_base: Option<u64>,
}

#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
    profiles: BTreeMap<String, Profile>,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        let profiles = parse_profiles(&data)?;
        Ok(Self {
            path,
            data,
            profiles,
        })
    }

    pub fn default_profile_name(&self) -> Option<&str> {
        self.data
            .default_profile
            .as_deref()
            .filter(|name| self.profiles.contains_key(*name))
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
    }

    pub fn set_default_profile(&mut self, name: Option<&str>) -> Result<(), ConfigError> {
        match name {
            Some(name) if !self.profiles.contains_key(name) => {
                return Err(ConfigError::ProfileNotFound {
                    name: name.to_string(),
                })
            }
            Some(name) => self.data.default_profile = Some(name.to_string()),
            None => self.data.default_profile = None,
        }
        Ok(())
    }

    pub fn upsert_profile(&mut self, name: &str, update: ProfileUpdate) -> Result<(), ConfigError> {
        let entry = self.data.profiles.entry(name.to_string()).or_default();
        if let Some(device) = update.device {
            entry.device = Some(device);
        }
        if let Some(pages) = update.pages {
            entry.pages = Some(pages);
        }
        if let Some(block_size) = update.block_size {
            entry.block_size = Some(block_size);
        }
        if let Some(buffer_pages) = update.buffer_pages {
            entry.buffer_pages = Some(buffer_pages);
        }
        if let Some(base) = update.inline_base {
            entry.inline_base = Some(base);
        }
        self.profiles = parse_profiles(&self.data)?;
        Ok(())
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<(), ConfigError> {
        if self.data.profiles.remove(name).is_none() {
            return Err(ConfigError::ProfileNotFound {
                name: name.to_string(),
            });
        }
        if self.data.default_profile.as_deref() == Some(name) {
            self.data.default_profile = None;
        }
        self.profiles = parse_profiles(&self.data)?;
        Ok(())
    }

    pub fn persist(&self) -> Result<PathBuf, ConfigError> {
        let target = match &self.path {
            Some(path) => path.clone(),
            None => default_config_path().ok_or(ConfigError::NoConfigPath)?,
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let serialized = toml::to_string_pretty(&self.data)
            .map_err(|source| ConfigError::Serialize { source })?;
        fs::write(&target, serialized).map_err(|source| ConfigError::Write {
            path: target.clone(),
            source,
        })?;
        Ok(target)
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_profiles(data: &RawConfig) -> Result<BTreeMap<String, Profile>, ConfigError> {
    let mut profiles = BTreeMap::new();
    for (name, raw) in &data.profiles {
        profiles.insert(name.clone(), convert_profile(name, raw)?);
    }
    if let Some(default_name) = data.default_profile.as_ref() {
        if !profiles.contains_key(default_name) {
            return Err(ConfigError::ProfileNotFound {
                name: default_name.clone(),
            });
        }
    }
    Ok(profiles)
}

fn convert_profile(name: &str, raw: &RawProfile) -> Result<Profile, ConfigError> {
    if let Some(block_size) = raw.block_size {
        if !block_size.is_power_of_two() || !(512..=4096).contains(&block_size) {
            return Err(ConfigError::InvalidBlockSize {
                profile: name.to_string(),
                value: block_size,
            });
        }
    }
    Ok(Profile {
        name: name.to_string(),
        device: raw.device.clone(),
        pages: raw.pages,
        block_size: raw.block_size,
        buffer_pages: raw.buffer_pages,
        inline_base: raw.inline_base,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    profiles: BTreeMap<String, RawProfile>,
    #[serde(default)]
    default_profile: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawProfile {
    device: Option<PathBuf>,
    pages: Option<u32>,
    block_size: Option<u32>,
    buffer_pages: Option<usize>,
    inline_base: Option<u64>,
}

#[derive(Debug, Default)]
pub struct ProfileUpdate {
    pub device: Option<PathBuf>,
    pub pages: Option<u32>,
    pub block_size: Option<u32>,
    pub buffer_pages: Option<usize>,
    pub inline_base: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize CLI config: {source}")]
    Serialize { source: toml::ser::Error },
    #[error("failed to write CLI config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },
    #[error("profile '{profile}' block size {value} is not a power of two between 512 and 4096")]
    InvalidBlockSize { profile: String, value: u32 },
    #[error("no config directory found; pass --config or set JLOG_CONFIG")]
    NoConfigPath,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("jlog").join("cli.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn profiles_persist_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cli.toml");
        let mut config = CliConfig::load(Some(path.clone())).unwrap();
        config
            .upsert_profile(
                "small",
                ProfileUpdate {
                    pages: Some(64),
                    block_size: Some(1024),
                    ..ProfileUpdate::default()
                },
            )
            .unwrap();
        config.set_default_profile(Some("small")).unwrap();
        assert_eq!(config.persist().unwrap(), path);

        let reloaded = CliConfig::load(Some(path)).unwrap();
        assert_eq!(reloaded.default_profile_name(), Some("small"));
        let profile = reloaded.profile("small").unwrap();
        assert_eq!(profile.pages, Some(64));
        assert_eq!(profile.block_size, Some(1024));
    }

    #[test]
    fn unknown_default_is_rejected() {
        let mut config = CliConfig::default();
        assert!(matches!(
            config.set_default_profile(Some("missing")),
            Err(ConfigError::ProfileNotFound { .. })
        ));
    }

    #[test]
    fn bad_block_size_is_rejected() {
        let mut config = CliConfig::default();
        let err = config
            .upsert_profile(
                "odd",
                ProfileUpdate {
                    block_size: Some(3000),
                    ..ProfileUpdate::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBlockSize { value: 3000, .. }));
    }
}
