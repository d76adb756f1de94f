//! Compile-or-get-cached policy
//!
//! [`CompileOrchestrator::compile_or_get_cached`] decides per request whether
//! the persistent cache is consulted, serves hits, compiles on misses and
//! writes admitted results back.
//!
//! ```text
//! START -> eligible? --no--> COMPILE -> DONE
//!             |yes
//!           LOOKUP --hit--> DONE
//!             |miss
//!           COMPILE -> admit? --yes--> WRITE -> DONE
//!                         |no
//!                        DONE
//! ```
//!
//! Cache failures never block compilation unless
//! `raise_persistent_cache_errors` is set. Compiler and configuration errors
//! always reach the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use ndarray::ArrayD;

use crate::cache::{CacheKey, CompilationCache};
use crate::compiler::{Backend, HostCallback, backend_compile};
use crate::config::CompilerConfig;
use crate::device::{Device, Platform};
use crate::dump::IrDumper;
use crate::error::{Error, Result};
use crate::metrics::{self, MetricsSink, NoopMetrics};
use crate::module::IrModule;
use crate::options::CompileOptions;

/// Monotonic time source used for all latency measurements
pub trait MonotonicClock: Send + Sync {
    /// Time elapsed since an arbitrary fixed origin
    fn now(&self) -> Duration;
}

/// [`Instant`]-backed clock
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl MonotonicClock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl MonotonicClock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-request outcome counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Requests compiled without any cache interaction
    pub uncached: usize,
    pub hits: usize,
    pub misses: usize,
    pub read_errors: usize,
    pub writes: usize,
    pub write_errors: usize,
    pub skipped_host_callbacks: usize,
    pub skipped_below_threshold: usize,
}

/// In-process per-key locks
///
/// Requests sharing a cache key run lookup, compile and write one at a time,
/// so the second one hits instead of compiling again.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    fn with_lock<R>(&self, key: &CacheKey, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };

        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(key);
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Cache-aware front end of the compiler
pub struct CompileOrchestrator {
    config: CompilerConfig,
    cache: Arc<CompilationCache>,
    metrics: Arc<dyn MetricsSink>,
    clock: Arc<dyn MonotonicClock>,
    dumper: Option<IrDumper>,
    key_locks: KeyLocks,
    stats: Mutex<OrchestratorStats>,
}

impl CompileOrchestrator {
    /// Create an orchestrator; IR dumping follows `config.dump_ir_to`
    pub fn new(config: CompilerConfig, cache: Arc<CompilationCache>) -> Self {
        let dumper = config.dump_dir().map(IrDumper::new);
        Self {
            config,
            cache,
            metrics: Arc::new(NoopMetrics),
            clock: Arc::new(SystemClock::default()),
            dumper,
            key_locks: KeyLocks::default(),
            stats: Mutex::new(OrchestratorStats::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn MonotonicClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the dumper, e.g. to share a dump counter between orchestrators
    pub fn with_dumper(mut self, dumper: Option<IrDumper>) -> Self {
        self.dumper = dumper;
        self
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CompilationCache> {
        &self.cache
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut OrchestratorStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Platforms whose executables may be cached
    pub fn supported_platforms(&self) -> Vec<Platform> {
        let mut platforms = vec![Platform::Tpu, Platform::Gpu];
        if self.config.cpu_cache_enabled() {
            platforms.push(Platform::Cpu);
        }
        platforms
    }

    /// Whether a request for `platform` goes through the cache
    pub fn uses_compilation_cache(&self, platform: &Platform) -> bool {
        self.cache.is_initialized() && self.supported_platforms().contains(platform)
    }

    /// Return a cached executable or compile (and possibly cache) a new one
    pub fn compile_or_get_cached<B: Backend + ?Sized>(
        &self,
        backend: &B,
        module: &dyn IrModule,
        devices: &ArrayD<Device>,
        options: &CompileOptions,
        host_callbacks: &[HostCallback],
    ) -> Result<B::Executable> {
        let module_name = module.name();

        if let Some(dumper) = &self.dumper {
            if let Err(e) = dumper.dump(module_name, &module.to_text()) {
                log::warn!(
                    "Failed to dump IR for '{}' to {}: {}",
                    module_name,
                    dumper.dir().display(),
                    e
                );
            }
        }

        if !self.uses_compilation_cache(&backend.platform()) {
            self.update_stats(|s| s.uncached += 1);
            return backend_compile(backend, module, options, host_callbacks);
        }

        let key = self.cache.get_cache_key(
            module,
            devices,
            options,
            backend,
            self.config.use_original_compilation_cache_key_generation,
        );

        self.key_locks.with_lock(&key, || {
            self.lookup_or_compile(backend, module, &key, options, host_callbacks)
        })
    }

    fn lookup_or_compile<B: Backend + ?Sized>(
        &self,
        backend: &B,
        module: &dyn IrModule,
        key: &CacheKey,
        options: &CompileOptions,
        host_callbacks: &[HostCallback],
    ) -> Result<B::Executable> {
        let module_name = module.name();

        let retrieval_start = self.clock.now();
        let retrieved = self.cache_read(module_name, key, options, backend)?;
        let retrieval_secs = self.clock.now().saturating_sub(retrieval_start).as_secs_f64();

        if let (Some(executable), compile_time) = retrieved {
            let compile_time = compile_time.unwrap_or_default();
            log::info!("Persistent compilation cache hit for '{}'", module_name);
            self.update_stats(|s| s.hits += 1);
            self.metrics
                .record_event_duration_secs(metrics::CACHE_RETRIEVAL_TIME, retrieval_secs);
            self.metrics.record_event_duration_secs(
                metrics::COMPILE_TIME_SAVED,
                compile_time as f64 - retrieval_secs,
            );
            return Ok(executable);
        }

        self.update_stats(|s| s.misses += 1);
        let compile_start = self.clock.now();
        let executable = backend_compile(backend, module, options, host_callbacks)?;
        let compile_secs = self.clock.now().saturating_sub(compile_start).as_secs_f64();

        self.cache_write(key, compile_secs, module_name, backend, &executable, host_callbacks)?;
        Ok(executable)
    }

    fn cache_read<B: Backend + ?Sized>(
        &self,
        module_name: &str,
        key: &CacheKey,
        options: &CompileOptions,
        backend: &B,
    ) -> Result<(Option<B::Executable>, Option<u64>)> {
        match self.cache.get_executable_and_time(key, options, backend) {
            Ok(found) => Ok(found),
            Err(source) => {
                self.update_stats(|s| s.read_errors += 1);
                if self.config.raise_persistent_cache_errors {
                    return Err(Error::CacheRead {
                        module_name: module_name.to_string(),
                        source,
                    });
                }
                log::warn!(
                    "Error reading persistent compilation cache entry for '{}': {}",
                    module_name,
                    source
                );
                Ok((None, None))
            }
        }
    }

    fn cache_write<B: Backend + ?Sized>(
        &self,
        key: &CacheKey,
        compile_time_secs: f64,
        module_name: &str,
        backend: &B,
        executable: &B::Executable,
        host_callbacks: &[HostCallback],
    ) -> Result<()> {
        if !host_callbacks.is_empty() {
            log::info!(
                "Not writing persistent cache entry for '{}' because it uses host callbacks \
                 (e.g. from a debug print or breakpoint)",
                module_name
            );
            self.update_stats(|s| s.skipped_host_callbacks += 1);
            return Ok(());
        }

        let min_compile_time = self.config.persistent_cache_min_compile_time_secs;
        if min_compile_time > 0.0 {
            if compile_time_secs < min_compile_time {
                log::info!(
                    "Not writing persistent cache entry for '{}' because it took < {:.2} seconds \
                     to compile ({:.2}s)",
                    module_name,
                    min_compile_time,
                    compile_time_secs
                );
                self.update_stats(|s| s.skipped_below_threshold += 1);
                return Ok(());
            }
            log::info!(
                "'{}' took at least {:.2} seconds to compile ({:.2}s), writing persistent cache entry",
                module_name,
                min_compile_time,
                compile_time_secs
            );
        }

        // Whole seconds, truncated
        let recorded_secs = compile_time_secs as u64;
        match self
            .cache
            .put_executable_and_time(key, module_name, executable, backend, recorded_secs)
        {
            Ok(()) => {
                self.update_stats(|s| s.writes += 1);
                Ok(())
            }
            Err(source) => {
                self.update_stats(|s| s.write_errors += 1);
                if self.config.raise_persistent_cache_errors {
                    return Err(Error::CacheWrite {
                        module_name: module_name.to_string(),
                        source,
                    });
                }
                log::warn!(
                    "Error writing persistent compilation cache entry for '{}': {}",
                    module_name,
                    source
                );
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for CompileOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileOrchestrator")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("dumper", &self.dumper)
            .finish_non_exhaustive()
    }
}
