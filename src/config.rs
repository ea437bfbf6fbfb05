//! Emitter configuration.
//!
//! Every policy switch that changes the emitted sequences lives here. The
//! configuration is handed to the `MacroAssembler` when it is created and
//! never changes during an emission pass.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::asm::WordWidth;

/// Stack alignment enforced before entering foreign code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum FrameAlignment {
    #[default]
    Eight,
    Sixteen,
}

impl FrameAlignment {
    pub fn bytes(self) -> i64 {
        match self {
            FrameAlignment::Eight => 8,
            FrameAlignment::Sixteen => 16,
        }
    }

    pub fn log2(self) -> u32 {
        match self {
            FrameAlignment::Eight => 3,
            FrameAlignment::Sixteen => 4,
        }
    }
}

impl TryFrom<u32> for FrameAlignment {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            8 => Ok(FrameAlignment::Eight),
            16 => Ok(FrameAlignment::Sixteen),
            other => Err(format!("unsupported frame alignment: {}", other)),
        }
    }
}

impl From<FrameAlignment> for u32 {
    fn from(value: FrameAlignment) -> Self {
        value.bytes() as u32
    }
}

/// Policy flags for one code generation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitterConfig {
    /// Target pointer width
    pub width: WordWidth,
    /// Emit the inline allocation fast path (otherwise always take the slow path)
    pub inline_new: bool,
    /// Emit increments of native statistics counters
    pub native_code_counters: bool,
    /// Incremental marking may be active while the emitted code runs
    pub incremental_marking: bool,
    /// Emit debug assertions, register poisoning and alignment checks
    pub debug_code: bool,
    /// Abort sequences stop immediately instead of calling the runtime
    pub trap_on_abort: bool,
    /// Stack alignment required by foreign code
    pub frame_alignment: FrameAlignment,
    /// Trace emitted operations to stderr
    pub trace: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            width: WordWidth::W64,
            inline_new: true,
            native_code_counters: true,
            incremental_marking: true,
            debug_code: false,
            trap_on_abort: false,
            frame_alignment: FrameAlignment::Eight,
            trace: false,
        }
    }
}

impl EmitterConfig {
    /// Parse a configuration from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| format!("invalid emitter config: {}", e))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_toml_str(&text)
    }

    pub fn with_width(mut self, width: WordWidth) -> Self {
        self.width = width;
        self
    }

    pub fn with_debug_code(mut self, debug_code: bool) -> Self {
        self.debug_code = debug_code;
        self
    }

    pub fn with_inline_new(mut self, inline_new: bool) -> Self {
        self.inline_new = inline_new;
        self
    }

    pub fn with_incremental_marking(mut self, incremental_marking: bool) -> Self {
        self.incremental_marking = incremental_marking;
        self
    }

    pub fn with_frame_alignment(mut self, frame_alignment: FrameAlignment) -> Self {
        self.frame_alignment = frame_alignment;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EmitterConfig::default();
        assert_eq!(config.width, WordWidth::W64);
        assert!(config.inline_new);
        assert!(!config.debug_code);
        assert_eq!(config.frame_alignment.bytes(), 8);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = EmitterConfig::from_toml_str(
            r#"
width = "w32"
debug_code = true
frame_alignment = 16
"#,
        )
        .unwrap();
        assert_eq!(config.width, WordWidth::W32);
        assert!(config.debug_code);
        assert_eq!(config.frame_alignment, FrameAlignment::Sixteen);
        // untouched keys keep their defaults
        assert!(config.inline_new);
        assert!(config.incremental_marking);
    }

    #[test]
    fn test_reject_bad_alignment() {
        let err = EmitterConfig::from_toml_str("frame_alignment = 12").unwrap_err();
        assert!(err.contains("frame alignment"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emit.toml");
        std::fs::write(&path, "inline_new = false\ntrace = true\n").unwrap();
        let config = EmitterConfig::load(&path).unwrap();
        assert!(!config.inline_new);
        assert!(config.trace);
    }
}
