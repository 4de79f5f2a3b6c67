//! Linked resource layout of a program, handed to the host before linking.

use bitflags::bitflags;

use crate::config::HostCapabilities;
use crate::engine_state::{ProgramPipelineState, TextureTarget};
use crate::program::{BufferUsageFlags, ShaderProgramInfo, ShaderStage, TextureUsageFlags};
use crate::resources::ResourceReservations;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ResourceStages: u8 {
        const COMPUTE = 1 << 0;
        const VERTEX = 1 << 1;
        const TESS_CONTROL = 1 << 2;
        const TESS_EVALUATION = 1 << 3;
        const GEOMETRY = 1 << 4;
        const FRAGMENT = 1 << 5;
    }
}

impl ResourceStages {
    const ALL_GRAPHICS: ResourceStages = ResourceStages::VERTEX
        .union(ResourceStages::TESS_CONTROL)
        .union(ResourceStages::TESS_EVALUATION)
        .union(ResourceStages::GEOMETRY)
        .union(ResourceStages::FRAGMENT);

    pub fn from_stage(stage: ShaderStage) -> Self {
        match stage {
            ShaderStage::Compute => Self::COMPUTE,
            ShaderStage::Vertex => Self::VERTEX,
            ShaderStage::TessellationControl => Self::TESS_CONTROL,
            ShaderStage::TessellationEvaluation => Self::TESS_EVALUATION,
            ShaderStage::Geometry => Self::GEOMETRY,
            ShaderStage::Fragment => Self::FRAGMENT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    UniformBuffer,
    StorageBuffer,
    TextureAndSampler,
    Image,
    BufferTexture,
    BufferImage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub binding: u32,
    pub count: u32,
    pub ty: ResourceType,
    pub stages: ResourceStages,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceUsage {
    pub binding: u32,
    pub array_length: u32,
    pub ty: ResourceType,
    pub stages: ResourceStages,
    pub write: bool,
}

/// Descriptors and usages grouped by descriptor set index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceLayout {
    pub sets: Vec<Vec<ResourceDescriptor>>,
    pub usages: Vec<Vec<ResourceUsage>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderInfo {
    pub resource_layout: ResourceLayout,
    pub fragment_output_map: i32,
    pub pipeline_state: Option<ProgramPipelineState>,
    pub from_cache: bool,
}

pub struct ShaderInfoBuilder<'a> {
    caps: &'a HostCapabilities,
    descriptors: Vec<Vec<ResourceDescriptor>>,
    usages: Vec<Vec<ResourceUsage>>,
    fragment_output_map: i32,
}

impl<'a> ShaderInfoBuilder<'a> {
    pub fn new(
        caps: &'a HostCapabilities,
        tf_enabled: bool,
        vertex_as_compute: bool,
        compute_only: bool,
    ) -> Self {
        let mut builder = Self {
            caps,
            descriptors: Vec::new(),
            usages: Vec::new(),
            fragment_output_map: -1,
        };

        let stages = if compute_only {
            ResourceStages::COMPUTE
        } else if vertex_as_compute {
            ResourceStages::COMPUTE | ResourceStages::VERTEX
        } else {
            ResourceStages::ALL_GRAPHICS
        };
        let reservations = ResourceReservations::for_stages(caps, tf_enabled, vertex_as_compute);
        builder.populate_reserved(
            stages,
            ResourceType::UniformBuffer,
            caps.uniform_buffer_set_index,
            reservations.reserved_constant_buffers,
            false,
        );
        builder.populate_reserved(
            stages,
            ResourceType::StorageBuffer,
            caps.storage_buffer_set_index,
            reservations.reserved_storage_buffers,
            true,
        );
        builder.populate_reserved(
            stages,
            ResourceType::BufferTexture,
            caps.texture_set_index,
            reservations.reserved_textures,
            false,
        );
        builder.populate_reserved(
            stages,
            ResourceType::BufferImage,
            caps.image_set_index,
            reservations.reserved_images,
            true,
        );
        builder
    }

    fn populate_reserved(
        &mut self,
        stages: ResourceStages,
        ty: ResourceType,
        set: u32,
        count: u32,
        write: bool,
    ) {
        for binding in 0..count {
            self.add_descriptor(stages, ty, set, binding, 1);
            self.add_usage(stages, ty, set, binding, 1, write);
        }
    }

    fn ensure_set(&mut self, set: u32) {
        let len = set as usize + 1;
        if self.descriptors.len() < len {
            self.descriptors.resize_with(len, Vec::new);
            self.usages.resize_with(len, Vec::new);
        }
    }

    fn add_descriptor(
        &mut self,
        stages: ResourceStages,
        ty: ResourceType,
        set: u32,
        binding: u32,
        count: u32,
    ) {
        self.ensure_set(set);
        let list = &mut self.descriptors[set as usize];
        match list.iter_mut().find(|d| d.binding == binding && d.ty == ty) {
            Some(existing) => {
                existing.stages |= stages;
                existing.count = existing.count.max(count);
            }
            None => list.push(ResourceDescriptor {
                binding,
                count,
                ty,
                stages,
            }),
        }
    }

    fn add_usage(
        &mut self,
        stages: ResourceStages,
        ty: ResourceType,
        set: u32,
        binding: u32,
        array_length: u32,
        write: bool,
    ) {
        self.ensure_set(set);
        self.usages[set as usize].push(ResourceUsage {
            binding,
            array_length,
            ty,
            stages,
            write,
        });
    }

    pub fn add_stage_info(&mut self, info: &ShaderProgramInfo, vertex_as_compute: bool) {
        if info.stage == ShaderStage::Fragment {
            self.fragment_output_map = info.fragment_output_map;
        }

        let stages = if vertex_as_compute {
            ResourceStages::COMPUTE
        } else {
            ResourceStages::from_stage(info.stage)
        };

        for desc in &info.cbuffers {
            self.add_descriptor(stages, ResourceType::UniformBuffer, desc.set, desc.binding, 1);
            self.add_usage(stages, ResourceType::UniformBuffer, desc.set, desc.binding, 1, false);
        }

        for desc in &info.sbuffers {
            let write = desc.flags.contains(BufferUsageFlags::WRITE);
            self.add_descriptor(stages, ResourceType::StorageBuffer, desc.set, desc.binding, 1);
            self.add_usage(stages, ResourceType::StorageBuffer, desc.set, desc.binding, 1, write);
        }

        for tex in &info.textures {
            let ty = if tex.target == TextureTarget::TextureBuffer {
                ResourceType::BufferTexture
            } else {
                ResourceType::TextureAndSampler
            };
            let count = tex.array_length.max(1);
            self.add_descriptor(stages, ty, tex.set, tex.binding, count);
            self.add_usage(stages, ty, tex.set, tex.binding, count, false);
        }

        for image in &info.images {
            let ty = if image.target == TextureTarget::TextureBuffer {
                ResourceType::BufferImage
            } else {
                ResourceType::Image
            };
            let write = image.flags.contains(TextureUsageFlags::IMAGE_STORE);
            let count = image.array_length.max(1);
            self.add_descriptor(stages, ty, image.set, image.binding, count);
            self.add_usage(stages, ty, image.set, image.binding, count, write);
        }
    }

    pub fn build(mut self, pipeline: Option<ProgramPipelineState>, from_cache: bool) -> ShaderInfo {
        // Every set the host knows about must exist, even when empty.
        let max_set = [
            self.caps.uniform_buffer_set_index,
            self.caps.storage_buffer_set_index,
            self.caps.texture_set_index,
            self.caps.image_set_index,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        self.ensure_set(max_set);

        for set in &mut self.descriptors {
            set.sort_by_key(|d| d.binding);
        }
        ShaderInfo {
            resource_layout: ResourceLayout {
                sets: self.descriptors,
                usages: self.usages,
            },
            fragment_output_map: self.fragment_output_map,
            pipeline_state: pipeline,
            from_cache,
        }
    }

    pub fn build_for_compute(
        caps: &HostCapabilities,
        info: &ShaderProgramInfo,
        from_cache: bool,
    ) -> ShaderInfo {
        let mut builder = ShaderInfoBuilder::new(caps, false, false, true);
        builder.add_stage_info(info, false);
        builder.build(None, from_cache)
    }

    pub fn build_for_vertex_as_compute(
        caps: &HostCapabilities,
        info: &ShaderProgramInfo,
        tf_enabled: bool,
    ) -> ShaderInfo {
        let mut builder = ShaderInfoBuilder::new(caps, tf_enabled, true, false);
        builder.add_stage_info(info, true);
        builder.build(None, false)
    }

    /// Rebuilds the layout of a program loaded from the disk cache.
    pub fn build_for_cache<'i>(
        caps: &HostCapabilities,
        infos: impl IntoIterator<Item = &'i ShaderProgramInfo>,
        pipeline: Option<ProgramPipelineState>,
        tf_enabled: bool,
    ) -> ShaderInfo {
        let infos: Vec<&ShaderProgramInfo> = infos.into_iter().collect();
        let compute_only = infos.iter().any(|i| i.stage == ShaderStage::Compute);
        let mut builder = ShaderInfoBuilder::new(caps, tf_enabled, false, compute_only);
        for info in infos {
            builder.add_stage_info(info, false);
        }
        builder.build(pipeline, true)
    }
}
