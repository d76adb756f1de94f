//! ディスクキャッシュ
//!
//! コンパイル済み実行ファイルをディスクに保存し、
//! プロセス間で再利用できるようにする。
//!
//! エントリごとに `<key>.bin`（実行ファイル）と `<key>.json`（メタデータ）を書く。
//! 書き込みは一時ファイルからのリネームで行うため、読み手が書きかけの
//! ファイルを見ることはない。

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::key::CacheKey;
use super::store::{CacheEntry, CacheStore};
use crate::error::CacheError;

/// キャッシュディレクトリを上書きする環境変数
pub const CACHE_DIR_ENV: &str = "HARP_COMPILATION_CACHE_DIR";

/// ディスクキャッシュのメタデータ
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DiskCacheMetadata {
    /// モジュールのシンボル名
    pub module_name: String,
    /// 記録されたコンパイル時間（秒）
    pub compile_time_secs: u64,
    /// 実行ファイルのバイト数（破損チェック用）
    pub size: u64,
    /// 書き込み時刻（UNIXエポックからのナノ秒）
    pub written_at_nanos: u64,
    /// 書き込んだクレートのバージョン
    pub version: String,
}

/// 一覧表示用のエントリ情報
#[derive(Debug, Clone, PartialEq)]
pub struct DiskEntryInfo {
    pub key: CacheKey,
    pub metadata: DiskCacheMetadata,
}

/// デフォルトのキャッシュディレクトリを取得
///
/// - `HARP_COMPILATION_CACHE_DIR`: カスタムキャッシュディレクトリ
/// - それ以外はシステム標準のキャッシュディレクトリ
pub fn default_cache_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|d| !d.is_empty()) {
        return Some(PathBuf::from(dir));
    }
    directories::ProjectDirs::from("", "", "harp").map(|dirs| dirs.cache_dir().join("compilation"))
}

/// 現在のクレートバージョン
pub fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// ファイルシステム上のキャッシュストア
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
    /// 保持する最大エントリ数（Noneなら無制限）
    max_entries: Option<usize>,
}

impl DiskStore {
    /// 指定ディレクトリにストアを開く（存在しなければ作成）
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        log::debug!("Opened disk cache at {}", root.display());
        Ok(Self {
            root,
            max_entries: None,
        })
    }

    /// デフォルトのディレクトリにストアを開く
    pub fn open_default() -> Result<Self, CacheError> {
        let root = default_cache_dir()
            .ok_or_else(|| CacheError::Store("could not determine a cache directory".to_string()))?;
        Self::open(root)
    }

    /// 最大エントリ数を設定（超えた分は古い順に削除）
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn paths(&self, key: &CacheKey) -> Result<(PathBuf, PathBuf), CacheError> {
        if !key.is_filename_safe() {
            return Err(CacheError::Store(format!("cache key '{}' is not a valid file name", key)));
        }
        Ok((
            self.root.join(format!("{}.bin", key)),
            self.root.join(format!("{}.json", key)),
        ))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
        let mut file = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&self.root)?;
        file.write_all(data)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| CacheError::Io(e.error))?;
        Ok(())
    }

    fn read_metadata(path: &Path) -> Result<Option<DiskCacheMetadata>, CacheError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 全エントリを列挙（書き込みの古い順）
    pub fn entries(&self) -> Result<Vec<DiskEntryInfo>, CacheError> {
        let mut entries = Vec::new();
        for dir_entry in std::fs::read_dir(&self.root)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Self::read_metadata(&path) {
                Ok(Some(metadata)) => entries.push(DiskEntryInfo {
                    key: CacheKey::from_raw(stem),
                    metadata,
                }),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("Skipping unreadable cache metadata {}: {}", path.display(), e)
                }
            }
        }
        entries.sort_by(|a, b| {
            a.metadata
                .written_at_nanos
                .cmp(&b.metadata.written_at_nanos)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(entries)
    }

    /// エントリを削除
    pub fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let (bin, meta) = self.paths(key)?;
        // メタデータを先に消し、読み手からエントリを見えなくする
        for path in [meta, bin] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// 全エントリを削除し、削除数を返す
    pub fn clear(&self) -> Result<usize, CacheError> {
        let entries = self.entries()?;
        for entry in &entries {
            self.remove(&entry.key)?;
        }
        Ok(entries.len())
    }

    /// 合計バイト数
    pub fn total_size(&self) -> Result<u64, CacheError> {
        Ok(self.entries()?.iter().map(|e| e.metadata.size).sum())
    }

    /// 古い順に削除して `max_entries` 以下にする。`keep` は削除しない
    fn evict_if_needed(&self, keep: &CacheKey) -> Result<(), CacheError> {
        let Some(max) = self.max_entries else {
            return Ok(());
        };
        let entries = self.entries()?;
        if entries.len() <= max {
            return Ok(());
        }
        let excess = entries.len() - max;
        let victims = entries.iter().filter(|e| &e.key != keep).take(excess);
        for entry in victims {
            log::debug!("Evicting cache entry {} ('{}')", entry.key, entry.metadata.module_name);
            self.remove(&entry.key)?;
        }
        Ok(())
    }
}

impl CacheStore for DiskStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let (bin, meta) = self.paths(key)?;

        let Some(metadata) = Self::read_metadata(&meta)? else {
            return Ok(None);
        };

        let executable = match std::fs::read(&bin) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CacheError::CorruptEntry {
                    key: key.to_string(),
                    reason: "executable file is missing".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if executable.len() as u64 != metadata.size {
            return Err(CacheError::CorruptEntry {
                key: key.to_string(),
                reason: format!("expected {} bytes, found {}", metadata.size, executable.len()),
            });
        }

        log::debug!("Disk cache hit: {} ('{}')", key, metadata.module_name);
        Ok(Some(CacheEntry {
            module_name: metadata.module_name,
            executable,
            compile_time_secs: metadata.compile_time_secs,
        }))
    }

    fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        let (bin, meta) = self.paths(key)?;
        let written_at_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        let metadata = DiskCacheMetadata {
            module_name: entry.module_name,
            compile_time_secs: entry.compile_time_secs,
            size: entry.executable.len() as u64,
            written_at_nanos,
            version: crate_version().to_string(),
        };

        // バイナリを先に書き、メタデータの出現をコミットとする
        self.write_atomic(&bin, &entry.executable)?;
        self.write_atomic(&meta, serde_json::to_string_pretty(&metadata)?.as_bytes())?;

        log::debug!(
            "Disk cache saved: {} ({} bytes, '{}')",
            key,
            metadata.size,
            metadata.module_name
        );

        self.evict_if_needed(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str, bytes: &[u8], secs: u64) -> CacheEntry {
        CacheEntry {
            module_name: name.to_string(),
            executable: bytes.to_vec(),
            compile_time_secs: secs,
        }
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::from_raw(s)
    }

    #[test]
    fn test_put_and_get() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();

        assert!(store.get(&key("v1-abc")).unwrap().is_none());
        store.put(&key("v1-abc"), entry("jit_f", b"\x00\x01binary", 9)).unwrap();

        let loaded = store.get(&key("v1-abc")).unwrap().unwrap();
        assert_eq!(loaded, entry("jit_f", b"\x00\x01binary", 9));
        assert!(dir.path().join("v1-abc.bin").exists());
        assert!(dir.path().join("v1-abc.json").exists());
    }

    #[test]
    fn test_metadata_serialization() {
        let metadata = DiskCacheMetadata {
            module_name: "jit_f".to_string(),
            compile_time_secs: 3,
            size: 128,
            written_at_nanos: 1_700_000_000_123_456_789,
            version: "0.1.0".to_string(),
        };
        let json = serde_json::to_string(&metadata).unwrap();
        let deserialized: DiskCacheMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, metadata);
    }

    #[test]
    fn test_missing_binary_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.put(&key("k1"), entry("m", b"abc", 1)).unwrap();
        std::fs::remove_file(dir.path().join("k1.bin")).unwrap();

        let result = store.get(&key("k1"));
        assert!(matches!(result, Err(CacheError::CorruptEntry { .. })));
    }

    #[test]
    fn test_truncated_binary_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.put(&key("k1"), entry("m", b"abcdef", 1)).unwrap();
        std::fs::write(dir.path().join("k1.bin"), b"abc").unwrap();

        assert!(matches!(store.get(&key("k1")), Err(CacheError::CorruptEntry { .. })));
    }

    #[test]
    fn test_garbage_metadata_is_error() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("k1.json"), "not json").unwrap();
        assert!(matches!(store.get(&key("k1")), Err(CacheError::Metadata(_))));
    }

    #[test]
    fn test_unsafe_key_rejected() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let result = store.put(&key("../escape"), entry("m", b"x", 1));
        assert!(matches!(result, Err(CacheError::Store(_))));
    }

    #[test]
    fn test_entries_remove_clear() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.put(&key("a"), entry("ma", b"1", 1)).unwrap();
        store.put(&key("b"), entry("mb", b"22", 2)).unwrap();

        let entries = store.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(store.total_size().unwrap(), 3);

        store.remove(&key("a")).unwrap();
        assert!(store.get(&key("a")).unwrap().is_none());
        // 存在しないエントリの削除はエラーにならない
        store.remove(&key("a")).unwrap();

        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.entries().unwrap().is_empty());
    }

    #[test]
    fn test_eviction_keeps_max_entries() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap().with_max_entries(2);
        for name in ["a", "b", "c"] {
            store.put(&key(name), entry(name, b"x", 1)).unwrap();
        }
        assert_eq!(store.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_eviction_removes_oldest_not_smallest_key() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap().with_max_entries(2);
        for name in ["c", "b", "a"] {
            store.put(&key(name), entry(name, b"x", 1)).unwrap();
        }

        let survivors: Vec<String> = store
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.key.as_str().to_string())
            .collect();
        assert_eq!(survivors, vec!["b", "a"]);
        assert_eq!(store.get(&key("a")).unwrap().unwrap().module_name, "a");
        assert!(store.get(&key("c")).unwrap().is_none());
    }

    #[test]
    fn test_eviction_never_removes_key_being_written() {
        let dir = TempDir::new().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        store.put(&key("b"), entry("b", b"x", 1)).unwrap();
        store.put(&key("c"), entry("c", b"x", 1)).unwrap();

        // 既存エントリを未来の時刻にし、次に書く "a" を最古にする
        let stamp = |name: &str| {
            let path = dir.path().join(format!("{}.json", name));
            let mut meta: DiskCacheMetadata =
                serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            meta.written_at_nanos = u64::MAX;
            std::fs::write(&path, serde_json::to_string(&meta).unwrap()).unwrap();
        };
        stamp("b");
        stamp("c");

        let store = store.with_max_entries(2);
        store.put(&key("a"), entry("a", b"x", 1)).unwrap();
        assert!(store.get(&key("a")).unwrap().is_some());
        assert!(store.get(&key("b")).unwrap().is_none());
        assert_eq!(store.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_default_cache_dir_env_override() {
        // SAFETY: テスト環境でのみ使用。並行テストでは競合の可能性あり。
        unsafe {
            std::env::set_var(CACHE_DIR_ENV, "/tmp/harp-cache-test");
        }
        assert_eq!(default_cache_dir(), Some(PathBuf::from("/tmp/harp-cache-test")));
        unsafe {
            std::env::remove_var(CACHE_DIR_ENV);
        }
    }
}
