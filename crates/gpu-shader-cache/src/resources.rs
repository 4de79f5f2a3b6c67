//! Host descriptor set and binding assignment for translated shaders.
//!
//! Flat APIs get one counter per resource kind shared by every stage. Explicit
//! binding APIs give each stage a fixed range per resource kind; array
//! resources are placed past all static ranges.

use tracing::error;

use crate::config::{HostCapabilities, TargetApi};
use crate::engine_state::{TOTAL_TRANSFORM_FEEDBACK_BUFFERS, TOTAL_VERTEX_ATTRIBS};
use crate::program::GRAPHICS_STAGES;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct SetBindingPair {
    pub set: u32,
    pub binding: u32,
}

impl SetBindingPair {
    pub fn new(set: u32, binding: u32) -> Self {
        Self { set, binding }
    }
}

/// Allocation state shared by all stages of one program.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    pub uniform_buffers: u32,
    pub storage_buffers: u32,
    pub textures: u32,
    pub images: u32,
    stage_textures: [u32; GRAPHICS_STAGES],
    stage_images: [u32; GRAPHICS_STAGES],
    texture_arrays: u32,
    image_arrays: u32,
}

/// Bindings kept for buffers the emulator itself binds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceReservations {
    pub reserved_constant_buffers: u32,
    pub reserved_storage_buffers: u32,
    pub reserved_textures: u32,
    pub reserved_images: u32,

    pub support_buffer_binding: u32,
    pub vertex_info_constant_buffer_binding: Option<u32>,
    pub tfe_storage_buffer_base: Option<u32>,
    pub vertex_output_storage_buffer_binding: Option<u32>,
    pub geometry_vertex_output_storage_buffer_binding: Option<u32>,
    pub geometry_index_output_storage_buffer_binding: Option<u32>,
    pub vertex_buffer_texture_base: Option<u32>,
}

impl ResourceReservations {
    pub fn new(tf_emulated: bool, vertex_as_compute: bool) -> Self {
        let mut r = Self {
            reserved_constant_buffers: 1,
            support_buffer_binding: 0,
            ..Self::default()
        };

        if vertex_as_compute {
            r.vertex_info_constant_buffer_binding = Some(r.reserved_constant_buffers);
            r.reserved_constant_buffers += 1;
        }

        if tf_emulated {
            r.tfe_storage_buffer_base = Some(r.reserved_storage_buffers);
            r.reserved_storage_buffers += TOTAL_TRANSFORM_FEEDBACK_BUFFERS as u32;
        }

        if vertex_as_compute {
            let base = r.reserved_storage_buffers;
            r.vertex_output_storage_buffer_binding = Some(base);
            r.geometry_vertex_output_storage_buffer_binding = Some(base + 1);
            r.geometry_index_output_storage_buffer_binding = Some(base + 2);
            r.reserved_storage_buffers += 3;

            r.vertex_buffer_texture_base = Some(r.reserved_textures);
            r.reserved_textures += TOTAL_VERTEX_ATTRIBS as u32;
        }

        r
    }

    /// Transform feedback is emulated with storage buffers when the host lacks it.
    pub fn for_stages(caps: &HostCapabilities, tf_enabled: bool, vertex_as_compute: bool) -> Self {
        Self::new(tf_enabled && !caps.supports_transform_feedback, vertex_as_compute)
    }
}

/// Position of a stage's binding range in the explicit binding layout.
///
/// Fragment, geometry and the tessellation stages come before vertex so the
/// stages most games use keep low binding numbers on hosts with small limits.
pub fn binding_stage_slot(stage_index: usize) -> u32 {
    match stage_index {
        4 => 1,
        3 => 2,
        1 => 3,
        2 => 4,
        _ => 0,
    }
}

fn dynamic_base_index(max_per_stage: u32) -> u32 {
    max_per_stage * GRAPHICS_STAGES as u32
}

/// Binding allocator for one stage during translation.
pub struct BindingAllocator<'a> {
    caps: &'a HostCapabilities,
    counts: &'a mut ResourceCounts,
    reservations: ResourceReservations,
    stage_index: usize,
}

impl<'a> BindingAllocator<'a> {
    pub fn new(
        caps: &'a HostCapabilities,
        counts: &'a mut ResourceCounts,
        reservations: ResourceReservations,
        stage_index: usize,
    ) -> Self {
        Self {
            caps,
            counts,
            reservations,
            stage_index: stage_index.min(GRAPHICS_STAGES - 1),
        }
    }

    fn explicit(&self) -> bool {
        self.caps.api == TargetApi::Vulkan
    }

    fn binding_from_index(&self, index: u32, max_per_stage: u32, resource_name: &str) -> u32 {
        if index >= max_per_stage {
            error!(
                resource = resource_name,
                index,
                max_per_stage,
                stage_index = self.stage_index,
                "shader resource index exceeds the per-stage host limit"
            );
        }
        binding_stage_slot(self.stage_index) * max_per_stage + index
    }

    pub fn create_constant_buffer_binding(&mut self, index: u32) -> SetBindingPair {
        let binding = if self.explicit() {
            self.binding_from_index(
                index,
                self.caps.maximum_uniform_buffers_per_stage,
                "uniform buffer",
            )
        } else {
            let binding = self.counts.uniform_buffers;
            self.counts.uniform_buffers += 1;
            binding
        };
        SetBindingPair::new(
            self.caps.uniform_buffer_set_index,
            binding + self.reservations.reserved_constant_buffers,
        )
    }

    pub fn create_storage_buffer_binding(&mut self, index: u32) -> SetBindingPair {
        let binding = if self.explicit() {
            self.binding_from_index(
                index,
                self.caps.maximum_storage_buffers_per_stage,
                "storage buffer",
            )
        } else {
            let binding = self.counts.storage_buffers;
            self.counts.storage_buffers += 1;
            binding
        };
        SetBindingPair::new(
            self.caps.storage_buffer_set_index,
            binding + self.reservations.reserved_storage_buffers,
        )
    }

    pub fn create_texture_binding(&mut self, count: u32, is_buffer: bool) -> SetBindingPair {
        let max = self.caps.maximum_textures_per_stage;
        let binding = if self.explicit() {
            if count == 1 {
                let mut index = self.counts.stage_textures[self.stage_index];
                self.counts.stage_textures[self.stage_index] += 1;
                if is_buffer {
                    index += max;
                }
                self.binding_from_index(index, max * 2, "texture")
            } else {
                let binding = dynamic_base_index(max) * 2 + self.counts.texture_arrays;
                self.counts.texture_arrays += count;
                binding
            }
        } else {
            let binding = self.counts.textures;
            self.counts.textures += count.max(1);
            binding
        };
        SetBindingPair::new(
            self.caps.texture_set_index,
            binding + self.reservations.reserved_textures,
        )
    }

    pub fn create_image_binding(&mut self, count: u32, is_buffer: bool) -> SetBindingPair {
        let max = self.caps.maximum_images_per_stage;
        let binding = if self.explicit() {
            if count == 1 {
                let mut index = self.counts.stage_images[self.stage_index];
                self.counts.stage_images[self.stage_index] += 1;
                if is_buffer {
                    index += max;
                }
                self.binding_from_index(index, max * 2, "image")
            } else {
                let binding = dynamic_base_index(max) * 2 + self.counts.image_arrays;
                self.counts.image_arrays += count;
                binding
            }
        } else {
            let binding = self.counts.images;
            self.counts.images += count.max(1);
            binding
        };
        SetBindingPair::new(
            self.caps.image_set_index,
            binding + self.reservations.reserved_images,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_slot_table() {
        let slots: Vec<u32> = (0..5).map(binding_stage_slot).collect();
        assert_eq!(slots, vec![0, 3, 4, 2, 1]);
    }

    #[test]
    fn explicit_api_uses_per_stage_ranges() {
        let caps = HostCapabilities::vulkan("test");
        let mut counts = ResourceCounts::default();
        let reservations = ResourceReservations::new(false, false);

        let fragment = BindingAllocator::new(&caps, &mut counts, reservations, 4)
            .create_constant_buffer_binding(2);
        assert_eq!(fragment, SetBindingPair::new(0, 18 + 2 + 1));

        let vertex = BindingAllocator::new(&caps, &mut counts, reservations, 0)
            .create_constant_buffer_binding(2);
        assert_eq!(vertex, SetBindingPair::new(0, 2 + 1));

        let geometry_sb = BindingAllocator::new(&caps, &mut counts, reservations, 3)
            .create_storage_buffer_binding(0);
        assert_eq!(geometry_sb, SetBindingPair::new(1, 2 * 16));
    }

    #[test]
    fn explicit_textures_split_buffer_and_arrays() {
        let caps = HostCapabilities::vulkan("test");
        let mut counts = ResourceCounts::default();
        let reservations = ResourceReservations::default();
        let mut alloc = BindingAllocator::new(&caps, &mut counts, reservations, 4);

        assert_eq!(alloc.create_texture_binding(1, false).binding, 128);
        assert_eq!(alloc.create_texture_binding(1, true).binding, 128 + 64 + 1);
        // Arrays live past every static range and never overlap each other.
        let first = alloc.create_texture_binding(8, false).binding;
        let second = alloc.create_texture_binding(4, false).binding;
        assert_eq!(first, 64 * 5 * 2);
        assert_eq!(second, first + 8);
        assert_eq!(alloc.create_texture_binding(1, false).binding, 128 + 2);
    }

    #[test]
    fn flat_api_shares_counters_across_stages() {
        let caps = HostCapabilities::opengl("test");
        let mut counts = ResourceCounts::default();
        let reservations = ResourceReservations::new(true, false);

        let a = BindingAllocator::new(&caps, &mut counts, reservations, 0)
            .create_storage_buffer_binding(5);
        let b = BindingAllocator::new(&caps, &mut counts, reservations, 4)
            .create_storage_buffer_binding(0);
        assert_eq!(a.binding, 4);
        assert_eq!(b.binding, 5);

        let mut alloc = BindingAllocator::new(&caps, &mut counts, reservations, 4);
        assert_eq!(alloc.create_texture_binding(3, false).binding, 0);
        assert_eq!(alloc.create_texture_binding(1, false).binding, 3);
    }

    #[test]
    fn reservations_for_vertex_as_compute() {
        let r = ResourceReservations::new(true, true);
        assert_eq!(r.reserved_constant_buffers, 2);
        assert_eq!(r.vertex_info_constant_buffer_binding, Some(1));
        assert_eq!(r.tfe_storage_buffer_base, Some(0));
        assert_eq!(r.vertex_output_storage_buffer_binding, Some(4));
        assert_eq!(r.reserved_storage_buffers, 7);
        assert_eq!(r.reserved_textures, 32);

        let caps = HostCapabilities::vulkan("test");
        assert_eq!(
            ResourceReservations::for_stages(&caps, true, false).reserved_storage_buffers,
            0
        );
    }
}
