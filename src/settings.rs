// src/settings.rs
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Channel, ChannelId, MAX_CHANNELS};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot write channel settings to {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("cannot encode channel settings: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The fixed set of eight channel slots.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelTable {
    channels: [Channel; MAX_CHANNELS],
}

#[derive(Serialize, Deserialize)]
struct StoredTable {
    channels: Vec<Channel>,
}

impl Default for ChannelTable {
    fn default() -> Self {
        let ids: Vec<ChannelId> = ChannelId::all().collect();
        Self {
            channels: std::array::from_fn(|i| Channel::new(ids[i])),
        }
    }
}

impl ChannelTable {
    /// Reads the table from JSON. Missing or unreadable files give the defaults;
    /// slots absent from the file keep their defaults too.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                log::warn!("cannot read {}: {e}; using default channels", path.display());
                return Self::default();
            }
        };
        match serde_json::from_str::<StoredTable>(&content) {
            Ok(stored) => {
                let mut table = Self::default();
                for mut channel in stored.channels {
                    if channel.color.is_empty() {
                        channel.color = table.get(channel.id).color.clone();
                    }
                    table.set(channel.id, channel);
                }
                table
            }
            Err(e) => {
                log::warn!("ignoring malformed {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = serde_json::to_string_pretty(&StoredTable {
            channels: self.channels.to_vec(),
        })?;
        fs::write(path, content).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn get(&self, id: ChannelId) -> &Channel {
        &self.channels[id.index()]
    }

    /// Stores `channel` in slot `id`; the slot decides the id.
    pub fn set(&mut self, id: ChannelId, mut channel: Channel) {
        channel.id = id;
        self.channels[id.index()] = channel;
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn enabled_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().filter(|c| c.enabled).map(|c| c.id)
    }
}

/// Process-wide channel configuration behind one lock.
///
/// Readers take a whole-table snapshot so factor and offset are never torn.
#[derive(Clone, Debug, Default)]
pub struct ChannelRegistry {
    table: Arc<RwLock<ChannelTable>>,
}

impl ChannelRegistry {
    pub fn new(table: ChannelTable) -> Self {
        Self {
            table: Arc::new(RwLock::new(table)),
        }
    }

    pub fn get_channel(&self, id: ChannelId) -> Channel {
        self.table.read().get(id).clone()
    }

    pub fn set_channel(&self, id: ChannelId, channel: Channel) {
        self.table.write().set(id, channel);
    }

    pub fn snapshot(&self) -> ChannelTable {
        self.table.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(i: usize) -> ChannelId {
        ChannelId::new(i).unwrap()
    }

    #[test]
    fn defaults_enable_the_first_three_channels() {
        let table = ChannelTable::default();
        let enabled: Vec<usize> = table.enabled_ids().map(|id| id.index()).collect();
        assert_eq!(enabled, vec![0, 1, 2]);
        assert_eq!(table.get(ch(4)).factor, 1.0);
        assert_eq!(table.get(ch(4)).offset, 0.0);
        assert_eq!(table.get(ch(7)).color, "#d35400");
    }

    #[test]
    fn save_then_load_keeps_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sensor_settings.json");
        let mut table = ChannelTable::default();
        let mut c5 = table.get(ch(5)).clone();
        c5.enabled = true;
        c5.factor = 2.5;
        c5.offset = -1.0;
        table.set(ch(5), c5);
        table.save(&path).unwrap();
        assert_eq!(ChannelTable::load(&path), table);
    }

    #[test]
    fn missing_or_broken_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert_eq!(ChannelTable::load(&missing), ChannelTable::default());
        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{ not json").unwrap();
        assert_eq!(ChannelTable::load(&broken), ChannelTable::default());
    }

    #[test]
    fn partial_files_only_override_listed_slots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        fs::write(&path, r#"{"channels":[{"id":6,"enabled":true,"factor":10.0}]}"#).unwrap();
        let table = ChannelTable::load(&path);
        assert!(table.get(ch(6)).enabled);
        assert_eq!(table.get(ch(6)).factor, 10.0);
        assert_eq!(table.get(ch(6)).color, "#2c3e50");
        assert_eq!(table.get(ch(0)), ChannelTable::default().get(ch(0)));
    }

    #[test]
    fn out_of_range_ids_are_rejected_as_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad-id.json");
        fs::write(&path, r#"{"channels":[{"id":9,"enabled":true}]}"#).unwrap();
        assert_eq!(ChannelTable::load(&path), ChannelTable::default());
    }

    #[test]
    fn registry_set_channel_forces_the_slot_id() {
        let registry = ChannelRegistry::default();
        let mut channel = registry.get_channel(ch(1));
        channel.id = ch(3);
        channel.factor = 4.0;
        registry.set_channel(ch(1), channel);
        assert_eq!(registry.get_channel(ch(1)).id, ch(1));
        assert_eq!(registry.get_channel(ch(1)).factor, 4.0);
        assert_eq!(registry.get_channel(ch(3)).factor, 1.0);
    }
}
