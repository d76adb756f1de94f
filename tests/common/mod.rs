//! Common test utilities for orchestrator integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use harp_compile_cache::cache::{CacheEntry, CacheKey, CacheStore, InMemoryStore};
use harp_compile_cache::compiler::{Backend, CompileInput, HostCallback};
use harp_compile_cache::device::{Device, Platform};
use harp_compile_cache::error::{BoxError, CacheError};
use harp_compile_cache::module::{IrModule, TextModule};
use harp_compile_cache::options::CompileOptions;
use harp_compile_cache::orchestrator::ManualClock;
use ndarray::{ArrayD, IxDyn};

const EXECUTABLE_MAGIC: &[u8] = b"EXE:";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeExecutable {
    pub payload: Vec<u8>,
}

/// Backend that records how often it compiled and advances a manual clock
/// by a fixed amount per compile
pub struct FakeBackend {
    pub platform: Platform,
    pub clock: Arc<ManualClock>,
    pub compile_duration: Duration,
    pub wall_delay: Duration,
    pub fail_compile: bool,
    compiles: AtomicUsize,
}

impl FakeBackend {
    pub fn new(platform: Platform, clock: Arc<ManualClock>) -> Self {
        Self {
            platform,
            clock,
            compile_duration: Duration::from_secs(5),
            wall_delay: Duration::ZERO,
            fail_compile: false,
            compiles: AtomicUsize::new(0),
        }
    }

    pub fn taking(mut self, compile_duration: Duration) -> Self {
        self.compile_duration = compile_duration;
        self
    }

    pub fn sleeping(mut self, wall_delay: Duration) -> Self {
        self.wall_delay = wall_delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail_compile = true;
        self
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl Backend for FakeBackend {
    type Executable = FakeExecutable;

    fn platform(&self) -> Platform {
        self.platform.clone()
    }

    fn platform_version(&self) -> String {
        "fake-1.0".to_string()
    }

    fn compile(
        &self,
        input: CompileInput<'_>,
        _options: &CompileOptions,
    ) -> Result<FakeExecutable, BoxError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if !self.wall_delay.is_zero() {
            std::thread::sleep(self.wall_delay);
        }
        self.clock.advance(self.compile_duration);
        if self.fail_compile {
            return Err("fake compiler rejected the module".into());
        }
        let payload = match input {
            CompileInput::Bytecode(bytes) => bytes,
            CompileInput::Module(module) => module.to_bytecode(),
        };
        Ok(FakeExecutable { payload })
    }

    fn compile_with_host_callbacks(
        &self,
        input: CompileInput<'_>,
        options: &CompileOptions,
        _host_callbacks: &[HostCallback],
    ) -> Result<FakeExecutable, BoxError> {
        self.compile(input, options)
    }

    fn serialize_executable(&self, executable: &FakeExecutable) -> Result<Vec<u8>, BoxError> {
        let mut bytes = EXECUTABLE_MAGIC.to_vec();
        bytes.extend_from_slice(&executable.payload);
        Ok(bytes)
    }

    fn deserialize_executable(
        &self,
        bytes: &[u8],
        _options: &CompileOptions,
    ) -> Result<FakeExecutable, BoxError> {
        match bytes.strip_prefix(EXECUTABLE_MAGIC) {
            Some(payload) => Ok(FakeExecutable {
                payload: payload.to_vec(),
            }),
            None => Err("not a fake executable".into()),
        }
    }
}

/// Store whose reads and/or writes always fail
#[derive(Debug, Default)]
pub struct FailingStore {
    pub fail_get: bool,
    pub fail_put: bool,
    puts: AtomicUsize,
}

impl FailingStore {
    pub fn reads() -> Self {
        Self {
            fail_get: true,
            ..Self::default()
        }
    }

    pub fn writes() -> Self {
        Self {
            fail_put: true,
            ..Self::default()
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl CacheStore for FailingStore {
    fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        if self.fail_get {
            return Err(CacheError::Store("disk on fire".to_string()));
        }
        Ok(None)
    }

    fn put(&self, _key: &CacheKey, _entry: CacheEntry) -> Result<(), CacheError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_put {
            return Err(CacheError::Store("disk full".to_string()));
        }
        Ok(())
    }
}

/// In-memory store whose reads take `read_delay` on the manual clock
pub struct SlowReadStore {
    inner: InMemoryStore,
    clock: Arc<ManualClock>,
    read_delay: Duration,
}

impl SlowReadStore {
    pub fn new(clock: Arc<ManualClock>, read_delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            clock,
            read_delay,
        }
    }
}

impl CacheStore for SlowReadStore {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.clock.advance(self.read_delay);
        self.inner.get(key)
    }

    fn put(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        self.inner.put(key, entry)
    }
}

pub fn module(name: &str) -> TextModule {
    TextModule::new(name, format!("module @{} {{\n  func.func @main() {{ return }}\n}}", name))
}

pub fn devices(platform: Platform, count: usize) -> ArrayD<Device> {
    let devices = (0..count)
        .map(|i| Device::new(i as i64, platform.clone(), "fake"))
        .collect();
    ArrayD::from_shape_vec(IxDyn(&[count]), devices).unwrap()
}

pub fn as_dyn(module: &TextModule) -> &dyn IrModule {
    module
}
