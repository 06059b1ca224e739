use std::{fmt::Display, str::FromStr};

use crate::{
    err::{DeviceError, Result},
    util::path,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Data,
    Key,
    Lock,
    Snapshot,
    Index,
    Config,
}

impl FileType {
    pub const ALL: [FileType; 6] = [
        FileType::Data,
        FileType::Key,
        FileType::Lock,
        FileType::Snapshot,
        FileType::Index,
        FileType::Config,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Data => "data",
            FileType::Key => "key",
            FileType::Lock => "lock",
            FileType::Snapshot => "snapshot",
            FileType::Index => "index",
            FileType::Config => "config",
        }
    }
}

impl Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = DeviceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        FileType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DeviceError::InvalidHandle(format!("unknown file type {}", s)))
    }
}

/// Names one object in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    pub file_type: FileType,
    pub name: String,
}

impl Handle {
    pub fn new(file_type: FileType, name: impl Into<String>) -> Self {
        Self {
            file_type,
            name: name.into(),
        }
    }

    pub fn config() -> Self {
        Self::new(FileType::Config, "")
    }

    pub fn valid(&self) -> Result<()> {
        if self.file_type != FileType::Config && self.name.is_empty() {
            return Err(DeviceError::InvalidHandle(format!(
                "{} handle without a name",
                self.file_type
            )));
        }
        if self.name.contains('/') {
            return Err(DeviceError::InvalidHandle(format!(
                "{} name {} contains a separator",
                self.file_type, self.name
            )));
        }
        Ok(())
    }
}

impl Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.file_type == FileType::Config {
            return f.write_str("<config>");
        }
        let short = self.name.get(..10).unwrap_or(&self.name);
        write!(f, "<{}/{}>", self.file_type, short)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Maps handles to device paths.
pub trait Layout: Send + Sync {
    fn filename(&self, h: &Handle) -> String;
    /// Directory holding objects of `t` and whether it is split into shard
    /// sub-directories.
    fn basedir(&self, t: FileType) -> (String, bool);
    fn paths(&self) -> Vec<String>;
}

/// Data objects are sharded by the first two characters of their id.
#[derive(Debug, Clone, Default)]
pub struct DefaultLayout {
    path: String,
}

impl DefaultLayout {
    pub fn new(path: &str) -> Self {
        Self {
            path: path::clean(path),
        }
    }

    fn dir_name(t: FileType) -> &'static str {
        match t {
            FileType::Data => "data",
            FileType::Key => "keys",
            FileType::Lock => "locks",
            FileType::Snapshot => "snapshots",
            FileType::Index => "index",
            FileType::Config => "",
        }
    }
}

impl Layout for DefaultLayout {
    fn filename(&self, h: &Handle) -> String {
        match h.file_type {
            FileType::Config => path::join([self.path.as_str(), "config"]),
            FileType::Data => {
                let shard = h.name.get(..2).unwrap_or(&h.name);
                path::join([self.path.as_str(), "data", shard, &h.name])
            }
            t => path::join([self.path.as_str(), Self::dir_name(t), &h.name]),
        }
    }

    fn basedir(&self, t: FileType) -> (String, bool) {
        (
            path::join([self.path.as_str(), Self::dir_name(t)]),
            t == FileType::Data,
        )
    }

    fn paths(&self) -> Vec<String> {
        FileType::ALL
            .into_iter()
            .filter(|t| *t != FileType::Config)
            .map(|t| self.basedir(t).0)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn filenames() {
        let layout = DefaultLayout::new("/repo/");
        assert_eq!(
            layout.filename(&Handle::new(FileType::Data, "0a1b2c3d")),
            "repo/data/0a/0a1b2c3d"
        );
        assert_eq!(
            layout.filename(&Handle::new(FileType::Snapshot, "ffee")),
            "repo/snapshots/ffee"
        );
        assert_eq!(layout.filename(&Handle::config()), "repo/config");

        let root = DefaultLayout::new("");
        assert_eq!(root.filename(&Handle::new(FileType::Key, "k1")), "keys/k1");
        assert_eq!(root.filename(&Handle::new(FileType::Data, "a")), "data/a/a");
    }

    #[test]
    pub fn basedirs() {
        let layout = DefaultLayout::new("repo");
        assert_eq!(layout.basedir(FileType::Data), ("repo/data".to_owned(), true));
        assert_eq!(layout.basedir(FileType::Lock), ("repo/locks".to_owned(), false));
        assert_eq!(
            layout.paths(),
            vec!["repo/data", "repo/keys", "repo/locks", "repo/snapshots", "repo/index"]
        );
    }

    #[test]
    pub fn handle_validation() {
        assert!(Handle::config().valid().is_ok());
        assert!(Handle::new(FileType::Index, "abc").valid().is_ok());
        assert_eq!(
            Handle::new(FileType::Data, "").valid().unwrap_err(),
            DeviceError::InvalidHandle(String::new())
        );
        assert!(Handle::new(FileType::Data, "../x").valid().is_err());
        assert_eq!("snapshot".parse::<FileType>().unwrap(), FileType::Snapshot);
        assert!("blob".parse::<FileType>().is_err());
        assert_eq!(
            Handle::new(FileType::Data, "0123456789abcdef").to_string(),
            "<data/0123456789>"
        );
    }
}
