//! キャッシュキーの導出
//!
//! モジュール、デバイス、コンパイルオプション、バックエンドから
//! 決定的なフィンガープリントを計算する。

use std::fmt;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::device::Device;
use crate::module::IrModule;
use crate::options::{CompileOptions, DebugOptions, ExecutableBuildOptions};

/// キャッシュキー
///
/// スキームのタグとSHA-256ダイジェストの16進文字列からなる。
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// 既存の文字列からキーを作成（ディスクから読み戻す場合など）
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// ファイル名として安全か
    pub fn is_filename_safe(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

/// キー生成スキーム
///
/// スキームごとにキー空間は互いに素。スキームを切り替えると古いエントリは
/// 衝突せず単にミスする。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KeyScheme {
    /// 初期のスキーム（テキスト形式のモジュール、バックエンドバージョンなし）
    Original,
    /// 現行スキーム（バイトコード、バックエンドバージョンを含む）
    #[default]
    Current,
}

impl KeyScheme {
    pub fn from_flag(use_original: bool) -> Self {
        if use_original {
            KeyScheme::Original
        } else {
            KeyScheme::Current
        }
    }

    /// キーの接頭辞
    pub fn tag(self) -> &'static str {
        match self {
            KeyScheme::Original => "v0",
            KeyScheme::Current => "v1",
        }
    }

    fn domain(self) -> &'static [u8] {
        match self {
            KeyScheme::Original => b"harp-compile-cache/original",
            KeyScheme::Current => b"harp-compile-cache/current",
        }
    }
}

/// 長さ付きでフィールドを書き込むハッシャー
///
/// 隣接するフィールドの境界が曖昧にならないよう、各値の前にラベルと長さを入れる。
struct FieldHasher(Sha256);

impl FieldHasher {
    fn new(domain: &[u8]) -> Self {
        let mut hasher = Self(Sha256::new());
        hasher.bytes("domain", domain);
        hasher
    }

    fn bytes(&mut self, label: &str, data: &[u8]) {
        self.0.update((label.len() as u64).to_le_bytes());
        self.0.update(label.as_bytes());
        self.0.update((data.len() as u64).to_le_bytes());
        self.0.update(data);
    }

    fn str(&mut self, label: &str, value: &str) {
        self.bytes(label, value.as_bytes());
    }

    fn u64(&mut self, label: &str, value: u64) {
        self.bytes(label, &value.to_le_bytes());
    }

    fn i64(&mut self, label: &str, value: i64) {
        self.bytes(label, &value.to_le_bytes());
    }

    fn bool(&mut self, label: &str, value: bool) {
        self.bytes(label, &[value as u8]);
    }

    fn i64s(&mut self, label: &str, values: &[i64]) {
        self.u64(label, values.len() as u64);
        for v in values {
            self.i64(label, *v);
        }
    }

    fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// キャッシュキーを計算する
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheKeyDeriver {
    scheme: KeyScheme,
}

impl CacheKeyDeriver {
    pub fn new(scheme: KeyScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> KeyScheme {
        self.scheme
    }

    /// キーを導出
    ///
    /// `platform` と `platform_version` はバックエンドの識別子。
    /// 同じ入力からは常に同じキーが得られる。
    pub fn derive(
        &self,
        module: &dyn IrModule,
        devices: &ArrayD<Device>,
        options: &CompileOptions,
        platform: &str,
        platform_version: &str,
    ) -> CacheKey {
        let mut h = FieldHasher::new(self.scheme.domain());

        match self.scheme {
            KeyScheme::Original => h.str("module", &module.to_text()),
            KeyScheme::Current => h.bytes("module", &module.to_bytecode()),
        }

        hash_devices(&mut h, devices, self.scheme);
        hash_options(&mut h, options);

        h.str("platform", platform);
        if self.scheme == KeyScheme::Current {
            h.str("platform_version", platform_version);
        }

        let digest = h.finish();
        log::trace!("Derived {} cache key {} for '{}'", self.scheme.tag(), digest, module.name());
        CacheKey(format!("{}-{}", self.scheme.tag(), digest))
    }
}

fn hash_devices(h: &mut FieldHasher, devices: &ArrayD<Device>, scheme: KeyScheme) {
    h.u64("devices.ndim", devices.ndim() as u64);
    for dim in devices.shape() {
        h.u64("devices.dim", *dim as u64);
    }
    // 論理順（行優先）で走査する
    for device in devices.iter() {
        h.i64("device.id", device.id);
        if scheme == KeyScheme::Current {
            h.str("device.platform", device.platform.name());
            h.str("device.kind", &device.kind);
        }
    }
}

/// コード生成に影響するフィールドのみをハッシュする
///
/// `debug_options.dump_to` は情報目的のため含めない。
fn hash_options(h: &mut FieldHasher, options: &CompileOptions) {
    h.u64("num_replicas", options.num_replicas as u64);
    h.u64("num_partitions", options.num_partitions as u64);

    match &options.device_assignment {
        Some(assignment) => {
            h.bool("device_assignment.present", true);
            h.u64("device_assignment.replicas", assignment.replica_count() as u64);
            h.u64("device_assignment.partitions", assignment.computation_count() as u64);
            for id in assignment.as_array().iter() {
                h.i64("device_assignment.id", *id);
            }
        }
        None => h.bool("device_assignment.present", false),
    }

    h.u64("env_option_overrides", options.env_option_overrides.len() as u64);
    for (key, value) in &options.env_option_overrides {
        h.str("env.key", key);
        h.str("env.value", value);
    }

    h.i64("profile_version", options.profile_version);
    hash_build_options(h, &options.executable_build_options);
}

fn hash_build_options(h: &mut FieldHasher, build: &ExecutableBuildOptions) {
    h.bool("use_spmd_partitioning", build.use_spmd_partitioning);
    h.bool("use_auto_spmd_partitioning", build.use_auto_spmd_partitioning);
    h.i64s("auto_spmd_partitioning_mesh_shape", &build.auto_spmd_partitioning_mesh_shape);
    h.i64s("auto_spmd_partitioning_mesh_ids", &build.auto_spmd_partitioning_mesh_ids);
    h.bool("fdo_profile.present", build.fdo_profile.is_some());
    if let Some(profile) = &build.fdo_profile {
        h.bytes("fdo_profile", profile);
    }
    hash_debug_options(h, &build.debug_options);
}

fn hash_debug_options(h: &mut FieldHasher, debug: &DebugOptions) {
    h.u64("backend_optimization_level", debug.backend_optimization_level as u64);
    h.bool("llvm_disable_expensive_passes", debug.llvm_disable_expensive_passes);
    h.bool("test_all_input_layouts", debug.test_all_input_layouts);
    h.bool("cuda_data_dir.present", debug.cuda_data_dir.is_some());
    if let Some(dir) = &debug.cuda_data_dir {
        h.str("cuda_data_dir", &dir.to_string_lossy());
    }
}
