//! Interface to the guest bytecode translator.

use bitflags::bitflags;
use thiserror::Error;

use crate::accessor::GpuAccessor;
use crate::config::{TargetApi, TargetLanguage};
use crate::program::{ShaderProgram, ShaderStage};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TranslationFlags: u8 {
        /// The vertex stage is split in two halves (A and B).
        const VERTEX_A = 1 << 0;
        const COMPUTE = 1 << 1;
        const DEBUG_MODE = 1 << 2;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslationOptions {
    pub target_language: TargetLanguage,
    pub target_api: TargetApi,
    pub flags: TranslationFlags,
}

impl TranslationOptions {
    pub fn new(target_language: TargetLanguage, target_api: TargetApi, flags: TranslationFlags) -> Self {
        Self {
            target_language,
            target_api,
            flags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TranslationError {
    pub message: String,
}

impl TranslationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Facts about a decoded stage that steer how the cache translates it.
pub trait DecodedShader {
    fn stage(&self) -> ShaderStage;

    /// Size in bytes of the guest code that was decoded.
    fn size(&self) -> usize;

    /// Bytes of constant buffer 1 the shader reads as literal data.
    fn cb1_data_size(&self) -> usize;

    /// Whether the shader performs storage writes or atomics.
    fn has_store(&self) -> bool;

    fn layer_output_written(&self) -> bool;

    fn uses_draw_parameters(&self) -> bool;
}

/// Turns guest bytecode into host shader programs.
///
/// Every engine fact the translator consults goes through the [`GpuAccessor`]
/// so that it is recorded in the program's specialization state.
pub trait ShaderTranslator {
    type Context: DecodedShader;

    fn decode(
        &self,
        accessor: &mut dyn GpuAccessor,
        options: TranslationOptions,
        gpu_va: u64,
    ) -> Result<Self::Context, TranslationError>;

    /// Translates `context`, merged with `vertex_a` when the vertex stage is split.
    /// With `as_compute` the stage is retargeted to a compute dispatch.
    fn translate(
        &self,
        accessor: &mut dyn GpuAccessor,
        context: &Self::Context,
        vertex_a: Option<&Self::Context>,
        as_compute: bool,
    ) -> Result<ShaderProgram, TranslationError>;

    /// Lets `context` drop outputs `next` never reads.
    fn link_next_stage(&self, _context: &mut Self::Context, _next: &Self::Context) {}

    /// Native vertex shader that feeds rasterization from the buffers a
    /// compute-emulated vertex pipeline wrote.
    fn vertex_passthrough_for_compute(
        &self,
        accessor: &mut dyn GpuAccessor,
        context: &Self::Context,
    ) -> Result<ShaderProgram, TranslationError>;

    /// Geometry shader forwarding the layer output of the previous stage.
    fn geometry_passthrough(
        &self,
        accessor: &mut dyn GpuAccessor,
        previous: &Self::Context,
    ) -> Result<ShaderProgram, TranslationError>;
}
