use serde_derive::Deserialize;
use serde_derive::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::{
    device::{DeviceAttributes, DeviceType},
    err::{DeviceError, Result},
};

/// Environment variable that overrides the configured device type.
pub const DEVICE_TYPE_ENV: &str = "QS_DEVICE_TYPE";

/// What a save does when the object already exists.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResavePolicy {
    /// Replace the stored object.
    #[default]
    Overwrite,
    /// Keep the device behaviour and append to it.
    Append,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Layout path prefix inside the container.
    pub prefix: String,
    /// Device url; the root directory for the filesystem device.
    pub host_name: String,
    pub user_name: String,
    pub password: String,
    pub storage_group: String,
    pub container: String,
    pub device_type: Option<String>,
    pub resave: ResavePolicy,
}

impl Config {
    pub fn device_attributes(&self) -> Result<DeviceAttributes> {
        let env = std::env::var(DEVICE_TYPE_ENV).ok();
        self.device_attributes_with(env.as_deref())
    }

    pub fn device_attributes_with(&self, env_override: Option<&str>) -> Result<DeviceAttributes> {
        Ok(DeviceAttributes {
            url: self.host_name.clone(),
            username: self.user_name.clone(),
            password: self.password.clone(),
            info: format!("qstore-{}", env!("CARGO_PKG_VERSION")),
            storage_group: self.storage_group.clone(),
            container: self.container.clone(),
            device_type: DeviceType::resolve(self.device_type.as_deref(), env_override)?,
        })
    }
}

/// Filesystem device rooted at `root`, storage group `SG1`, container `C1`.
pub fn test_config(root: impl AsRef<Path>) -> Config {
    Config {
        prefix: "repo".into(),
        host_name: root.as_ref().display().to_string(),
        storage_group: "SG1".into(),
        container: "C1".into(),
        device_type: Some(DeviceType::Filesystem.tag().into()),
        ..Config::default()
    }
}

pub fn load_config_from(file: impl AsRef<Path>) -> Result<Config> {
    let file = file.as_ref();
    let mut buf = String::new();
    File::open(file)
        .and_then(|mut f| f.read_to_string(&mut buf))
        .map_err(|e| DeviceError::Config(format!("read {}: {}", file.display(), e)))?;

    toml::from_str(&buf).map_err(|e| DeviceError::Config(format!("parse {}: {}", file.display(), e)))
}
