use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::bytecode::Function;
use crate::config::{CacheConfig, CompileOptions};

/// Bumped whenever the instruction encoding changes.
pub const CACHE_VERSION: &str = "vbs-vm-bytecode-v1";

struct CacheEntry {
    function: Arc<Function>,
    created: Instant,
}

/// Compiled programs keyed by a hash of their source and compile options.
///
/// Entries are published once and never mutated; callers share them through
/// `Arc` and may run them on any number of VMs.
pub struct BytecodeCache {
    config: CacheConfig,
    /// Insertion order doubles as age order for eviction.
    entries: RwLock<IndexMap<String, CacheEntry>>,
}

impl Default for BytecodeCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl BytecodeCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config: config.clamped(),
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// The process-wide cache, created with default settings on first use.
    pub fn global() -> &'static BytecodeCache {
        static CACHE: OnceLock<BytecodeCache> = OnceLock::new();
        CACHE.get_or_init(BytecodeCache::default)
    }

    pub fn key(source: &str, options: &CompileOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(CACHE_VERSION.as_bytes());
        hasher.update(b"\n");
        hasher.update(options.signature().as_bytes());
        hasher.update(b"\n");
        hasher.update(source.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns the cached program for `source`, running `compile` on a miss.
    /// Compile failures are returned as-is and never cached.
    pub fn get_or_compile<F, E>(
        &self,
        source: &str,
        options: &CompileOptions,
        compile: F,
    ) -> Result<Arc<Function>, E>
    where
        F: FnOnce(&str) -> Result<Function, E>,
    {
        if !self.config.enabled
            || source.is_empty()
            || source.len() > self.config.max_source_bytes
        {
            return compile(source).map(Arc::new);
        }
        let key = Self::key(source, options);
        if let Some(function) = self.lookup(&key) {
            debug!(key = %key, "bytecode cache hit");
            return Ok(function);
        }
        debug!(key = %key, bytes = source.len(), "bytecode cache miss");
        let function = Arc::new(compile(source)?);
        self.insert(key, Arc::clone(&function));
        Ok(function)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn ttl(&self) -> Option<Duration> {
        self.config.ttl_seconds.map(Duration::from_secs)
    }

    fn lookup(&self, key: &str) -> Option<Arc<Function>> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = entries.get(key)?;
        match self.ttl() {
            Some(ttl) if entry.created.elapsed() >= ttl => None,
            _ => Some(Arc::clone(&entry.function)),
        }
    }

    fn insert(&self, key: String, function: Arc<Function>) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // An expired entry is replaced, which also moves it to the back.
        entries.shift_remove(&key);
        while entries.len() >= self.config.max_entries {
            match entries.shift_remove_index(0) {
                Some((evicted, _)) => debug!(key = %evicted, "bytecode cache evict"),
                None => break,
            }
        }
        entries.insert(
            key,
            CacheEntry {
                function,
                created: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::sync::Arc;

    use vbs_parser::parse_program;

    use super::BytecodeCache;
    use crate::bytecode::Function;
    use crate::compiler::compile;
    use crate::config::{CacheConfig, CompileOptions};
    use crate::error::Error;

    fn compiler(count: &Cell<usize>) -> impl Fn(&str) -> Result<Function, Error> + '_ {
        move |source| {
            count.set(count.get() + 1);
            Ok(compile(&parse_program(source)?)?)
        }
    }

    #[test]
    fn second_lookup_is_a_hit() {
        let cache = BytecodeCache::default();
        let count = Cell::new(0);
        let options = CompileOptions::default();
        let first = cache
            .get_or_compile("x = 1", &options, compiler(&count))
            .expect("compile");
        let second = cache
            .get_or_compile("x = 1", &options, compiler(&count))
            .expect("compile");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(count.get(), 1);

        let other = CompileOptions {
            signature: "text".to_string(),
        };
        cache
            .get_or_compile("x = 1", &other, compiler(&count))
            .expect("compile");
        assert_eq!(count.get(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn key_depends_on_source_and_signature() {
        let options = CompileOptions::default();
        let key = BytecodeCache::key("x = 1", &options);
        assert_eq!(key.len(), 64);
        assert_eq!(key, BytecodeCache::key("x = 1", &options));
        assert_ne!(key, BytecodeCache::key("x = 2", &options));
        let explicit = CompileOptions {
            signature: "default".to_string(),
        };
        assert_eq!(key, BytecodeCache::key("x = 1", &explicit));
    }

    #[test]
    fn oversized_and_empty_sources_bypass() {
        let cache = BytecodeCache::new(CacheConfig {
            max_source_bytes: 8,
            ..CacheConfig::default()
        });
        let count = Cell::new(0);
        let options = CompileOptions::default();
        for _ in 0..2 {
            cache
                .get_or_compile("total = 1 + 2", &options, compiler(&count))
                .expect("compile");
            cache
                .get_or_compile("", &options, compiler(&count))
                .expect("compile");
        }
        assert_eq!(count.get(), 4);
        assert!(cache.is_empty());
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let cache = BytecodeCache::new(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        let count = Cell::new(0);
        let options = CompileOptions::default();
        for source in ["a = 1", "b = 2", "c = 3"] {
            cache
                .get_or_compile(source, &options, compiler(&count))
                .expect("compile");
        }
        assert_eq!(cache.len(), 2);
        cache
            .get_or_compile("c = 3", &options, compiler(&count))
            .expect("compile");
        assert_eq!(count.get(), 3);
        cache
            .get_or_compile("a = 1", &options, compiler(&count))
            .expect("compile");
        assert_eq!(count.get(), 4);
    }

    #[test]
    fn expired_entries_are_recompiled() {
        let cache = BytecodeCache::new(CacheConfig {
            ttl_seconds: Some(0),
            ..CacheConfig::default()
        });
        let count = Cell::new(0);
        let options = CompileOptions::default();
        for _ in 0..2 {
            cache
                .get_or_compile("x = 1", &options, compiler(&count))
                .expect("compile");
        }
        assert_eq!(count.get(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = BytecodeCache::default();
        let count = Cell::new(0);
        let options = CompileOptions::default();
        assert!(cache
            .get_or_compile("x = (", &options, compiler(&count))
            .is_err());
        assert!(cache.is_empty());
        cache.get_or_compile("x = 1", &options, compiler(&count)).expect("compile");
        cache.clear();
        assert!(cache.is_empty());
    }
}
