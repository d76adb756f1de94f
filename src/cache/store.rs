//! キャッシュストア
//!
//! シリアライズ済み実行ファイルとコンパイル時間をキーごとに保存する。
//! 保存媒体は [`CacheStore`] の実装が決める。

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use ndarray::ArrayD;

use super::key::{CacheKey, CacheKeyDeriver, KeyScheme};
use crate::compiler::Backend;
use crate::device::Device;
use crate::error::CacheError;
use crate::module::IrModule;
use crate::options::CompileOptions;

/// キャッシュエントリ
///
/// 一度書き込まれたら変更されない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// モジュールのシンボル名（ログ用）
    pub module_name: String,
    /// シリアライズ済み実行ファイル
    pub executable: Vec<u8>,
    /// 記録されたコンパイル時間（秒、切り捨て）
    pub compile_time_secs: u64,
}

/// 永続キャッシュの保存先
///
/// 見つからない場合は `Ok(None)` を返す。エラーは呼び出し側で扱う。
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// 同じキーへの書き込みは後勝ち
    fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError>;
}

/// キャッシュの統計情報
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
    pub evictions: usize,
}

/// メモリ上のキャッシュストア
///
/// プロセス内でのみ有効。テストや組み込み用途向け。
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    stats: RwLock<CacheStats>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 統計を取得
    pub fn stats(&self) -> CacheStats {
        self.stats.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// 全エントリを削除
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.len();
        entries.clear();
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.evictions += removed;
        stats.entries = 0;
    }
}

impl CacheStore for InMemoryStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let found = entries.get(key).cloned();
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        Ok(found)
    }

    fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.clone(), entry);
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        stats.entries = entries.len();
        Ok(())
    }
}

/// 永続コンパイルキャッシュのハンドル
///
/// アプリケーションが [`CompilationCache::initialize`] でストアを設定するまでは
/// 未初期化で、オーケストレーターはキャッシュを一切使わない。
#[derive(Default)]
pub struct CompilationCache {
    store: RwLock<Option<Arc<dyn CacheStore>>>,
}

impl CompilationCache {
    /// 未初期化のハンドルを作成
    pub fn new() -> Self {
        Self::default()
    }

    /// ストアを設定済みのハンドルを作成
    pub fn with_store(store: Arc<dyn CacheStore>) -> Self {
        let cache = Self::new();
        cache.initialize(store);
        cache
    }

    /// ストアを設定（既存のストアは置き換える）
    pub fn initialize(&self, store: Arc<dyn CacheStore>) {
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = Some(store);
        log::debug!("Persistent compilation cache initialized");
    }

    /// ストアを外して未初期化に戻す
    pub fn reset(&self) {
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current_store(&self) -> Option<Arc<dyn CacheStore>> {
        self.store.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// キャッシュキーを計算
    pub fn get_cache_key<B: Backend + ?Sized>(
        &self,
        module: &dyn IrModule,
        devices: &ArrayD<Device>,
        options: &CompileOptions,
        backend: &B,
        use_original_scheme: bool,
    ) -> CacheKey {
        CacheKeyDeriver::new(KeyScheme::from_flag(use_original_scheme)).derive(
            module,
            devices,
            options,
            backend.platform().name(),
            &backend.platform_version(),
        )
    }

    /// 実行ファイルとコンパイル時間を取得
    ///
    /// 見つからない場合は `(None, None)`。
    pub fn get_executable_and_time<B: Backend + ?Sized>(
        &self,
        key: &CacheKey,
        options: &CompileOptions,
        backend: &B,
    ) -> Result<(Option<B::Executable>, Option<u64>), CacheError> {
        let Some(store) = self.current_store() else {
            return Ok((None, None));
        };
        let Some(entry) = store.get(key)? else {
            return Ok((None, None));
        };
        let executable = backend
            .deserialize_executable(&entry.executable, options)
            .map_err(CacheError::Deserialize)?;
        Ok((Some(executable), Some(entry.compile_time_secs)))
    }

    /// 実行ファイルとコンパイル時間を保存
    pub fn put_executable_and_time<B: Backend + ?Sized>(
        &self,
        key: &CacheKey,
        module_name: &str,
        executable: &B::Executable,
        backend: &B,
        compile_time_secs: u64,
    ) -> Result<(), CacheError> {
        let Some(store) = self.current_store() else {
            log::debug!("Persistent compilation cache not initialized; dropping '{}'", module_name);
            return Ok(());
        };
        let serialized = backend
            .serialize_executable(executable)
            .map_err(CacheError::Serialize)?;
        log::debug!(
            "Writing persistent cache entry {} for '{}' ({} bytes, {}s)",
            key,
            module_name,
            serialized.len(),
            compile_time_secs
        );
        store.put(
            key,
            CacheEntry {
                module_name: module_name.to_string(),
                executable: serialized,
                compile_time_secs,
            },
        )
    }
}

impl std::fmt::Debug for CompilationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilationCache")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompileInput;
    use crate::device::Platform;
    use crate::error::BoxError;
    use crate::module::TextModule;

    struct EchoBackend;

    impl Backend for EchoBackend {
        type Executable = Vec<u8>;

        fn platform(&self) -> Platform {
            Platform::Tpu
        }

        fn compile(
            &self,
            input: CompileInput<'_>,
            _options: &CompileOptions,
        ) -> Result<Vec<u8>, BoxError> {
            match input {
                CompileInput::Bytecode(bytes) => Ok(bytes),
                CompileInput::Module(m) => Ok(m.to_bytecode()),
            }
        }

        fn serialize_executable(&self, executable: &Vec<u8>) -> Result<Vec<u8>, BoxError> {
            Ok(executable.clone())
        }

        fn deserialize_executable(
            &self,
            bytes: &[u8],
            _options: &CompileOptions,
        ) -> Result<Vec<u8>, BoxError> {
            if bytes.is_empty() {
                return Err("empty executable".into());
            }
            Ok(bytes.to_vec())
        }
    }

    fn key(s: &str) -> CacheKey {
        CacheKey::from_raw(s)
    }

    #[test]
    fn test_in_memory_store_get_put() {
        let store = InMemoryStore::new();
        assert!(store.get(&key("a")).unwrap().is_none());

        let entry = CacheEntry {
            module_name: "m".to_string(),
            executable: vec![1, 2, 3],
            compile_time_secs: 4,
        };
        store.put(&key("a"), entry.clone()).unwrap();
        assert_eq!(store.get(&key("a")).unwrap(), Some(entry));
        assert!(store.contains(&key("a")));

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_in_memory_store_last_write_wins() {
        let store = InMemoryStore::new();
        for secs in [1, 2] {
            store
                .put(
                    &key("k"),
                    CacheEntry {
                        module_name: "m".to_string(),
                        executable: vec![secs as u8],
                        compile_time_secs: secs,
                    },
                )
                .unwrap();
        }
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key("k")).unwrap().unwrap().compile_time_secs, 2);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.stats().evictions, 1);
    }

    #[test]
    fn test_uninitialized_cache_is_inert() {
        let cache = CompilationCache::new();
        assert!(!cache.is_initialized());
        let options = CompileOptions::default();
        let (exe, time) = cache
            .get_executable_and_time(&key("k"), &options, &EchoBackend)
            .unwrap();
        assert!(exe.is_none() && time.is_none());
        cache
            .put_executable_and_time(&key("k"), "m", &vec![1], &EchoBackend, 3)
            .unwrap();
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let store = Arc::new(InMemoryStore::new());
        let cache = CompilationCache::with_store(store.clone());
        assert!(cache.is_initialized());

        let options = CompileOptions::default();
        let module = TextModule::new("jit_f", "module @jit_f {}");
        let devices = ndarray::array![Device::new(0, Platform::Tpu, "v4")].into_dyn();
        let k = cache.get_cache_key(&module, &devices, &options, &EchoBackend, false);

        assert_eq!(
            cache.get_executable_and_time(&k, &options, &EchoBackend).unwrap(),
            (None, None)
        );
        cache
            .put_executable_and_time(&k, "jit_f", &vec![7, 8], &EchoBackend, 12)
            .unwrap();
        assert_eq!(
            cache.get_executable_and_time(&k, &options, &EchoBackend).unwrap(),
            (Some(vec![7, 8]), Some(12))
        );
        assert_eq!(store.get(&k).unwrap().unwrap().module_name, "jit_f");

        cache.reset();
        assert!(!cache.is_initialized());
    }

    #[test]
    fn test_deserialize_failure_is_cache_error() {
        let store = Arc::new(InMemoryStore::new());
        store
            .put(
                &key("bad"),
                CacheEntry {
                    module_name: "m".to_string(),
                    executable: Vec::new(),
                    compile_time_secs: 1,
                },
            )
            .unwrap();
        let cache = CompilationCache::with_store(store);
        let result =
            cache.get_executable_and_time(&key("bad"), &CompileOptions::default(), &EchoBackend);
        assert!(matches!(result, Err(CacheError::Deserialize(_))));
    }
}
