//! Interface to the host graphics device.

use crate::config::HostCapabilities;
use crate::program::ShaderSource;
use crate::shader_info::ShaderInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgramLinkStatus {
    Incomplete,
    Success,
    Failure,
}

/// A program handle owned by the host backend.
pub trait HostProgram {
    /// Polls the link state. With `blocking`, waits until the link concluded.
    fn check_link_status(&self, blocking: bool) -> ProgramLinkStatus;

    /// Host binary suitable for [`Renderer::load_program_binary`].
    fn binary(&self) -> Vec<u8>;
}

pub trait Renderer {
    type Program: HostProgram + Send + Sync;

    fn capabilities(&self) -> &HostCapabilities;

    fn create_program(&self, sources: &[ShaderSource], info: &ShaderInfo) -> Self::Program;

    fn load_program_binary(
        &self,
        binary: &[u8],
        has_fragment_shader: bool,
        info: &ShaderInfo,
    ) -> Self::Program;
}
