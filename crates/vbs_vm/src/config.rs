use serde::{Deserialize, Serialize};
use tracing::warn;

const MIN_STACK_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Operand stack depth.
    pub stack_size: usize,
    /// Nested call depth, including the top-level program.
    pub max_frames: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: 2048,
            max_frames: 1024,
        }
    }
}

impl VmConfig {
    pub(crate) fn clamped(mut self) -> Self {
        if self.stack_size < MIN_STACK_SIZE {
            warn!(
                requested = self.stack_size,
                used = MIN_STACK_SIZE,
                "stack_size below supported minimum"
            );
            self.stack_size = MIN_STACK_SIZE;
        }
        if self.max_frames == 0 {
            warn!(used = 1, "max_frames must be at least 1");
            self.max_frames = 1;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_entries: usize,
    /// Sources larger than this are compiled without being cached.
    pub max_source_bytes: usize,
    pub ttl_seconds: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 512,
            max_source_bytes: 4 * 1024 * 1024,
            ttl_seconds: None,
        }
    }
}

impl CacheConfig {
    pub(crate) fn clamped(mut self) -> Self {
        if self.enabled && self.max_entries == 0 {
            warn!(used = 1, "max_entries must be at least 1");
            self.max_entries = 1;
        }
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Distinguishes bytecode compiled under different host settings in the cache.
    pub signature: String,
}

impl CompileOptions {
    pub fn signature(&self) -> &str {
        if self.signature.is_empty() {
            "default"
        } else {
            &self.signature
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheConfig, CompileOptions, VmConfig};

    #[test]
    fn vm_limits_are_clamped() {
        let config = VmConfig {
            stack_size: 2,
            max_frames: 0,
        }
        .clamped();
        assert_eq!(config.stack_size, 16);
        assert_eq!(config.max_frames, 1);
        assert_eq!(VmConfig::default().clamped(), VmConfig::default());
    }

    #[test]
    fn cache_needs_room_for_one_entry() {
        let config = CacheConfig {
            max_entries: 0,
            ..CacheConfig::default()
        }
        .clamped();
        assert_eq!(config.max_entries, 1);
    }

    #[test]
    fn empty_signature_means_default() {
        assert_eq!(CompileOptions::default().signature(), "default");
        let options = CompileOptions {
            signature: "asp;utf8".to_string(),
        };
        assert_eq!(options.signature(), "asp;utf8");
    }
}
