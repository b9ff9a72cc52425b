//! Runtime configuration for the submission engine.
//!
//! Every fixed capacity the engine enforces lives here so that
//! long-running hosts can size pools for their workload.

use crate::{Error, Result};

/// Capacities, pool sizes and presentation settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererConfig {
    /// Initial surface width in pixels
    pub width: u32,
    /// Initial surface height in pixels
    pub height: u32,
    /// Maximum draws submitted between two `frame()` calls
    pub max_draws: usize,
    /// User descriptor-set slots per draw
    pub max_descriptor_slots: usize,
    /// Descriptors per slot
    pub max_bindings_per_set: usize,
    /// Descriptor sets allocatable from the backend pool
    pub max_descriptor_sets: usize,
    /// Pending buffer-to-buffer copies per frame
    pub max_buffer_copies: usize,
    /// Pending buffer-to-image copies per frame
    pub max_image_copies: usize,
    /// Size of the transient vertex ring in bytes
    pub transient_vertex_size: u64,
    /// Size of the transient index ring in bytes
    pub transient_index_size: u64,
    /// Size of the staging ring in bytes
    pub staging_size: u64,
    /// Alignment of every ring allocation
    pub transient_alignment: u64,
    /// Enable the Vulkan validation layers
    pub enable_validation: bool,
    /// Prefer FIFO presentation
    pub vsync: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            max_draws: 4096,
            max_descriptor_slots: 4,
            max_bindings_per_set: 8,
            max_descriptor_sets: 1024,
            max_buffer_copies: 256,
            max_image_copies: 64,
            transient_vertex_size: 4 * 1024 * 1024,
            transient_index_size: 1024 * 1024,
            staging_size: 8 * 1024 * 1024,
            transient_alignment: 256,
            enable_validation: cfg!(debug_assertions),
            vsync: true,
        }
    }
}

impl RendererConfig {
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_max_draws(mut self, max_draws: usize) -> Self {
        self.max_draws = max_draws;
        self
    }

    pub fn with_max_descriptor_sets(mut self, count: usize) -> Self {
        self.max_descriptor_sets = count;
        self
    }

    pub fn with_copy_limits(mut self, buffer_copies: usize, image_copies: usize) -> Self {
        self.max_buffer_copies = buffer_copies;
        self.max_image_copies = image_copies;
        self
    }

    pub fn with_transient_sizes(mut self, vertex: u64, index: u64, staging: u64) -> Self {
        self.transient_vertex_size = vertex;
        self.transient_index_size = index;
        self.staging_size = staging;
        self
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.transient_alignment = alignment;
        self
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    /// Build a configuration from defaults overridden by `FRAMEKIT_*` variables.
    ///
    /// Recognized: `FRAMEKIT_MAX_DRAWS`, `FRAMEKIT_MAX_DESCRIPTOR_SETS`,
    /// `FRAMEKIT_STAGING_SIZE`, `FRAMEKIT_TRANSIENT_VERTEX_SIZE`,
    /// `FRAMEKIT_TRANSIENT_INDEX_SIZE`, `FRAMEKIT_VALIDATION`, `FRAMEKIT_VSYNC`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("FRAMEKIT_MAX_DRAWS") {
            config.max_draws = parse_value("FRAMEKIT_MAX_DRAWS", &v)?;
        }
        if let Some(v) = lookup("FRAMEKIT_MAX_DESCRIPTOR_SETS") {
            config.max_descriptor_sets = parse_value("FRAMEKIT_MAX_DESCRIPTOR_SETS", &v)?;
        }
        if let Some(v) = lookup("FRAMEKIT_STAGING_SIZE") {
            config.staging_size = parse_value("FRAMEKIT_STAGING_SIZE", &v)?;
        }
        if let Some(v) = lookup("FRAMEKIT_TRANSIENT_VERTEX_SIZE") {
            config.transient_vertex_size = parse_value("FRAMEKIT_TRANSIENT_VERTEX_SIZE", &v)?;
        }
        if let Some(v) = lookup("FRAMEKIT_TRANSIENT_INDEX_SIZE") {
            config.transient_index_size = parse_value("FRAMEKIT_TRANSIENT_INDEX_SIZE", &v)?;
        }
        if let Some(v) = lookup("FRAMEKIT_VALIDATION") {
            config.enable_validation = parse_flag("FRAMEKIT_VALIDATION", &v)?;
        }
        if let Some(v) = lookup("FRAMEKIT_VSYNC") {
            config.vsync = parse_flag("FRAMEKIT_VSYNC", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("max_draws", self.max_draws),
            ("max_descriptor_slots", self.max_descriptor_slots),
            ("max_bindings_per_set", self.max_bindings_per_set),
            ("max_descriptor_sets", self.max_descriptor_sets),
            ("max_buffer_copies", self.max_buffer_copies),
            ("max_image_copies", self.max_image_copies),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }

        if !self.transient_alignment.is_power_of_two() {
            return Err(Error::Config(format!(
                "transient_alignment must be a power of two, got {}",
                self.transient_alignment
            )));
        }

        let pools = [
            ("transient_vertex_size", self.transient_vertex_size),
            ("transient_index_size", self.transient_index_size),
            ("staging_size", self.staging_size),
        ];
        for (name, size) in pools {
            if size == 0 || !size.is_multiple_of(self.transient_alignment) {
                return Err(Error::Config(format!(
                    "{name} ({size}) must be a non-zero multiple of {}",
                    self.transient_alignment
                )));
            }
        }

        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "invalid extent {}x{}",
                self.width, self.height
            )));
        }

        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse '{value}'")))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got '{value}'"))),
    }
}
