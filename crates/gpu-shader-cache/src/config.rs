//! Cache configuration and the host device capability description.

use std::path::PathBuf;

pub const SHADER_CACHE_ENV: &str = "GPU_SHADER_CACHE";
pub const SHADER_CACHE_DIR_ENV: &str = "GPU_SHADER_CACHE_DIR";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderCacheConfig {
    /// Enables the persistent disk cache. The in-memory cache is always active.
    pub enabled: bool,
    /// Directory holding the cache files for the running title.
    pub path: Option<PathBuf>,
    /// Keep programs whose host link failed instead of evicting and retrying them.
    pub retain_failed_programs: bool,
}

impl ShaderCacheConfig {
    pub fn new(enabled: bool, path: Option<PathBuf>) -> Self {
        Self {
            enabled,
            path,
            retain_failed_programs: false,
        }
    }

    /// Reads `GPU_SHADER_CACHE` and `GPU_SHADER_CACHE_DIR`.
    pub fn from_env() -> Self {
        let enabled = std::env::var(SHADER_CACHE_ENV)
            .map(|raw| is_truthy(&raw))
            .unwrap_or(false);
        let path = std::env::var_os(SHADER_CACHE_DIR_ENV)
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from);
        Self::new(enabled, path)
    }

    /// The disk cache only runs when it is enabled and has somewhere to live.
    pub fn disk_cache_path(&self) -> Option<&PathBuf> {
        if self.enabled {
            self.path.as_ref()
        } else {
            None
        }
    }
}

fn is_truthy(raw: &str) -> bool {
    let v = raw.trim();
    v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetApi {
    OpenGl,
    Vulkan,
}

impl TargetApi {
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenGl => "opengl",
            Self::Vulkan => "vulkan",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TargetLanguage {
    Glsl = 0,
    Spirv = 1,
}

impl TargetLanguage {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Glsl),
            1 => Some(Self::Spirv),
            _ => None,
        }
    }
}

/// What the host graphics device can do natively.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCapabilities {
    pub api: TargetApi,
    pub vendor_name: String,
    pub supports_spirv: bool,
    pub supports_vertex_store_and_atomics: bool,
    pub supports_geometry_shader: bool,
    pub supports_transform_feedback: bool,
    pub supports_scaled_vertex_formats: bool,
    pub supports_layer_vertex_tessellation: bool,
    pub needs_fragment_output_specialization: bool,

    pub maximum_uniform_buffers_per_stage: u32,
    pub maximum_storage_buffers_per_stage: u32,
    pub maximum_textures_per_stage: u32,
    pub maximum_images_per_stage: u32,

    pub uniform_buffer_set_index: u32,
    pub storage_buffer_set_index: u32,
    pub texture_set_index: u32,
    pub image_set_index: u32,
}

impl HostCapabilities {
    pub fn vulkan(vendor_name: impl Into<String>) -> Self {
        Self {
            api: TargetApi::Vulkan,
            vendor_name: vendor_name.into(),
            supports_spirv: true,
            supports_vertex_store_and_atomics: true,
            supports_geometry_shader: true,
            supports_transform_feedback: true,
            supports_scaled_vertex_formats: true,
            supports_layer_vertex_tessellation: true,
            needs_fragment_output_specialization: false,
            maximum_uniform_buffers_per_stage: 18,
            maximum_storage_buffers_per_stage: 16,
            maximum_textures_per_stage: 64,
            maximum_images_per_stage: 16,
            uniform_buffer_set_index: 0,
            storage_buffer_set_index: 1,
            texture_set_index: 2,
            image_set_index: 3,
        }
    }

    pub fn opengl(vendor_name: impl Into<String>) -> Self {
        Self {
            api: TargetApi::OpenGl,
            supports_spirv: false,
            uniform_buffer_set_index: 0,
            storage_buffer_set_index: 0,
            texture_set_index: 0,
            image_set_index: 0,
            ..Self::vulkan(vendor_name)
        }
    }

    pub fn target_language(&self) -> TargetLanguage {
        if self.api == TargetApi::Vulkan && self.supports_spirv {
            TargetLanguage::Spirv
        } else {
            TargetLanguage::Glsl
        }
    }

    /// Whether any vertex pipeline stage might end up emulated with compute.
    pub fn may_convert_vtg_to_compute(&self) -> bool {
        !self.supports_vertex_store_and_atomics || !self.supports_geometry_shader
    }

    /// Name used for the host binary cache files, e.g. `vulkan_nvidia`.
    pub fn host_cache_file_name(&self) -> String {
        let vendor: String = self
            .vendor_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", self.api.name(), vendor)
    }
}
