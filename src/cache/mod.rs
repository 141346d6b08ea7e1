use std::path::{Path, PathBuf};
use indexmap::IndexMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::CacheError;
use crate::link::Address;

/// One characteristic as remembered from a previous discovery walk. The uuid
/// is stored in full 128-bit hex form so reconstruction never has to guess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCharacteristic {
    pub uuid: String,
    pub handle: u16,
    pub properties: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportReference {
    pub id: u8,
    #[serde(rename = "type")]
    pub kind: u8,
}

/// Persisted discovery results for one remote. `report_descriptor` (hex) is
/// the only required field; the rest regenerates piecemeal when missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CacheEntry {
    #[serde(default)]
    pub report_descriptor: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub characteristics: Option<Vec<CachedCharacteristic>>,

    /// Keyed by stringified characteristic handle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_refs: Option<IndexMap<String, ReportReference>>,
}

impl CacheEntry {
    pub fn is_structurally_valid(&self) -> bool {
        parse_hex(&self.report_descriptor).map_or(false, |bytes| !bytes.is_empty())
    }

    pub fn report_descriptor_bytes(&self) -> Option<Vec<u8>> {
        parse_hex(&self.report_descriptor).filter(|bytes| !bytes.is_empty())
    }
}

/// Partial update; set fields overwrite, unset fields are preserved.
/// `report_refs` merges per handle so references learned on different runs
/// accumulate.
#[derive(Debug, Default)]
pub struct CacheUpdate {
    pub report_descriptor: Option<String>,
    pub device_name: Option<String>,
    pub characteristics: Option<Vec<CachedCharacteristic>>,
    pub report_refs: Option<IndexMap<String, ReportReference>>,
}

/// Persistent store of discovery results, one JSON file per remote address.
/// Any read or parse failure is a cache miss; callers always have the full
/// discovery path to regenerate an entry.
#[derive(Debug, Clone)]
pub struct AttributeCache {
    dir: PathBuf,
}

impl AttributeCache {
    pub fn new(dir: PathBuf) -> Self {
        AttributeCache { dir }
    }

    fn entry_path(&self, address: &Address) -> PathBuf {
        self.dir.join(format!("{}.json", address.cache_key()))
    }

    pub async fn load(&self, address: &Address) -> Option<CacheEntry> {
        let entry = self.load_lax(address).await?;
        if !entry.is_structurally_valid() {
            warn!("Cached entry for {} has no usable report descriptor, ignoring", address);
            return None;
        }
        Some(entry)
    }

    // Laxer read used by update(): keeps partial entries (no descriptor yet)
    // alive so their fields survive a merge.
    async fn load_lax(&self, address: &Address) -> Option<CacheEntry> {
        let path = self.entry_path(address);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read cache file {}: {}", path.display(), err);
                }
                return None;
            },
        };

        match serde_json::from_str::<CacheEntry>(&content) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!("Discarding corrupt cache entry for {}: {}", address, err);
                None
            },
        }
    }

    pub async fn save(&self, address: &Address, entry: &CacheEntry) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.entry_path(address);
        let content = serde_json::to_string_pretty(entry)?;

        // Atomic replace: a crash mid-write leaves either the old entry or
        // the new one, never a torn file.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;

        info!("Saved attribute cache for {}", address);
        Ok(())
    }

    pub async fn update(&self, address: &Address, update: CacheUpdate) -> Result<(), CacheError> {
        let mut entry = self.load_lax(address).await.unwrap_or_default();

        if let Some(report_descriptor) = update.report_descriptor {
            entry.report_descriptor = report_descriptor;
        }
        if let Some(device_name) = update.device_name {
            entry.device_name = Some(device_name);
        }
        if let Some(characteristics) = update.characteristics {
            entry.characteristics = Some(characteristics);
        }
        if let Some(report_refs) = update.report_refs {
            entry.report_refs.get_or_insert_with(IndexMap::new).extend(report_refs);
        }

        self.save(address, &entry).await
    }

    pub async fn clear(&self, address: Option<&Address>) -> Result<(), CacheError> {
        match address {
            Some(address) => {
                let path = self.entry_path(address);
                match fs::remove_file(&path).await {
                    Ok(()) => info!("Cleared attribute cache for {}", address),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                    Err(err) => return Err(err.into()),
                }
            },
            None => {
                for identity in self.list_known_identities().await {
                    fs::remove_file(self.entry_path(&identity)).await?;
                }
                info!("Cleared all attribute caches");
            },
        }
        Ok(())
    }

    pub async fn list_known_identities(&self) -> Vec<Address> {
        let mut identities = vec![];

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return identities,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(key) = json_stem(&entry.path()) {
                if let Ok(address) = Address::from_cache_key(key) {
                    identities.push(address);
                }
            }
        }

        identities
    }
}

fn json_stem(path: &Path) -> Option<&str> {
    if path.extension()?.to_str()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()
}

pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
