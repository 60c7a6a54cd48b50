//! Runtime configuration for composition and change processing.
//!
//! The original system read these knobs from process environment settings;
//! here they are plain fields passed to each cache at construction, so tests
//! can vary them per instance.

/// Feature toggles for a composition cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Open sibling sublayers in parallel during stack construction.
    ///
    /// Only honored for caches whose document parsing is declared free of
    /// thread-unsafe side effects (USD mode).
    pub parallel_sublayer_prefetch: bool,

    /// Diff a muted layer against an empty document instead of blowing the
    /// whole layer stack.
    pub minimal_mute_changes: bool,

    /// Tolerate chained/ancestral relocation conflicts, and conform
    /// relocation sources to their most-relocated form, for non-USD stacks.
    pub legacy_relocates: bool,

    /// Scale sublayer offsets by the ratio of parent to sublayer
    /// time-codes-per-second.
    pub scale_offsets_by_tcps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            parallel_sublayer_prefetch: true,
            minimal_mute_changes: true,
            legacy_relocates: false,
            scale_offsets_by_tcps: true,
        }
    }
}

impl Config {
    /// Creates a builder starting from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Fluent builder for [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables or disables parallel sublayer prefetch.
    pub fn parallel_sublayer_prefetch(mut self, on: bool) -> Self {
        self.config.parallel_sublayer_prefetch = on;
        self
    }

    /// Enables or disables minimal mute/unmute change processing.
    pub fn minimal_mute_changes(mut self, on: bool) -> Self {
        self.config.minimal_mute_changes = on;
        self
    }

    /// Enables or disables legacy relocation-conflict tolerance.
    pub fn legacy_relocates(mut self, on: bool) -> Self {
        self.config.legacy_relocates = on;
        self
    }

    /// Enables or disables time-offset scaling by layer TCPS.
    pub fn scale_offsets_by_tcps(mut self, on: bool) -> Self {
        self.config.scale_offsets_by_tcps = on;
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> Config {
        self.config
    }
}
