//! 永続コンパイルキャッシュ
//!
//! コンパイル済み実行ファイルを (モジュール, デバイス, オプション, バックエンド)
//! のフィンガープリントで保存し、同一のリクエストに対してコンパイルをスキップする。

pub mod disk;
pub mod key;
pub mod store;

pub use disk::{DiskCacheMetadata, DiskEntryInfo, DiskStore, default_cache_dir};
pub use key::{CacheKey, CacheKeyDeriver, KeyScheme};
pub use store::{CacheEntry, CacheStats, CacheStore, CompilationCache, InMemoryStore};
