//! Content-addressed program tables.
//!
//! Each graphics stage (and compute) has its own [`IdCache`] handing out
//! stage-local code identities. A program is keyed by the identities of all
//! its stages and holds a short list of variants that differ only in
//! specialization.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::hash_table::{DataAccessor, PartitionedHashTable};
use crate::memory::ShaderCodeAccessor;
use crate::program::{CachedShaderProgram, ShaderAddresses, GRAPHICS_STAGE_SLOTS};
use crate::channel::GpuChannel;

/// Hands out monotonically increasing ids for distinct byte sequences. Id 0 is
/// never assigned; it stands for an absent stage.
pub struct IdCache {
    table: PartitionedHashTable<u32>,
    next_id: u32,
}

impl Default for IdCache {
    fn default() -> Self {
        Self {
            table: PartitionedHashTable::new(),
            next_id: 1,
        }
    }
}

impl IdCache {
    pub fn add(&mut self, data: Arc<[u8]>) -> u32 {
        let id = self.next_id;
        let existing = self.table.get_or_add(data, id);
        if existing == id {
            self.next_id += 1;
        }
        existing
    }

    pub fn find_exact(&self, data: &[u8]) -> Option<u32> {
        self.table.find_exact(data)
    }

    pub fn try_find(&self, accessor: &mut dyn DataAccessor) -> Option<(u32, Arc<[u8]>)> {
        self.table.try_find(accessor)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// Variants of one program, scanned in insertion order.
pub struct ShaderSpecializationList<P> {
    entries: Vec<Arc<CachedShaderProgram<P>>>,
}

impl<P> Default for ShaderSpecializationList<P> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<P> ShaderSpecializationList<P> {
    /// Adds a variant. A program that is already listed, or whose
    /// specialization equals a listed variant's, is not added again; the
    /// earlier entry would always be found first.
    pub fn add(&mut self, program: Arc<CachedShaderProgram<P>>) -> bool {
        let duplicate = self.entries.iter().any(|p| {
            Arc::ptr_eq(p, &program) || p.specialization_state == program.specialization_state
        });
        if !duplicate {
            self.entries.push(program);
        }
        !duplicate
    }

    pub fn remove(&mut self, program: &Arc<CachedShaderProgram<P>>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p| !Arc::ptr_eq(p, program));
        self.entries.len() != before
    }

    pub fn find(
        &self,
        mut matches: impl FnMut(&CachedShaderProgram<P>) -> bool,
    ) -> Option<Arc<CachedShaderProgram<P>>> {
        self.entries.iter().find(|p| matches(p)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<CachedShaderProgram<P>>> {
        self.entries.iter()
    }
}

/// Code stored for each graphics stage slot found by a content lookup.
pub type CachedGraphicsGuestCode = [Option<Arc<[u8]>>; GRAPHICS_STAGE_SLOTS];

pub struct GraphicsLookup<P> {
    pub program: Option<Arc<CachedShaderProgram<P>>>,
    /// Stage code already known to the tables, reusable by a fresh translation.
    pub guest_code: CachedGraphicsGuestCode,
}

pub struct ComputeLookup<P> {
    pub program: Option<Arc<CachedShaderProgram<P>>>,
    pub guest_code: Option<Arc<[u8]>>,
}

type IdTable = [u32; GRAPHICS_STAGE_SLOTS];

pub struct ShaderCacheHashTable<P> {
    stage_caches: [IdCache; GRAPHICS_STAGE_SLOTS],
    programs: HashMap<IdTable, ShaderSpecializationList<P>>,
}

impl<P> Default for ShaderCacheHashTable<P> {
    fn default() -> Self {
        Self {
            stage_caches: Default::default(),
            programs: HashMap::new(),
        }
    }
}

impl<P> ShaderCacheHashTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a program under the ids of its stages. Returns `false` when an
    /// equivalent variant was already present.
    pub fn add(&mut self, program: Arc<CachedShaderProgram<P>>) -> bool {
        let mut ids = [0u32; GRAPHICS_STAGE_SLOTS];
        for (slot, id) in ids.iter_mut().enumerate() {
            if let Some(stage) = program.stage(slot) {
                *id = self.stage_caches[slot].add(stage.code.clone());
            }
        }
        self.programs.entry(ids).or_default().add(program)
    }

    fn ids_of(&self, program: &CachedShaderProgram<P>) -> Option<IdTable> {
        let mut ids = [0u32; GRAPHICS_STAGE_SLOTS];
        for (slot, id) in ids.iter_mut().enumerate() {
            if let Some(stage) = program.stage(slot) {
                *id = self.stage_caches[slot].find_exact(&stage.code)?;
            }
        }
        Some(ids)
    }

    pub fn remove(&mut self, program: &Arc<CachedShaderProgram<P>>) -> bool {
        let Some(ids) = self.ids_of(program) else {
            return false;
        };
        self.programs
            .get_mut(&ids)
            .is_some_and(|list| list.remove(program))
    }

    /// Resolves each stage's code against guest memory, then scans the variants
    /// for one whose specialization state accepts `matches`.
    pub fn try_find(
        &self,
        channel: &dyn GpuChannel,
        addresses: &ShaderAddresses,
        matches: impl FnMut(&CachedShaderProgram<P>) -> bool,
    ) -> GraphicsLookup<P> {
        let mut guest_code: CachedGraphicsGuestCode = Default::default();
        let mut ids = [0u32; GRAPHICS_STAGE_SLOTS];
        let mut all_found = true;

        // Vertex A is only translated together with vertex B, so without
        // vertex B no program holds code in slot 0.
        for (slot, address) in addresses.as_array().into_iter().enumerate() {
            if address == 0 || (slot == 0 && addresses.vertex_b == 0) {
                continue;
            }
            let mut accessor = ShaderCodeAccessor::new(channel.memory(), address);
            match self.stage_caches[slot].try_find(&mut accessor) {
                Some((id, code)) => {
                    ids[slot] = id;
                    guest_code[slot] = Some(code);
                }
                None => all_found = false,
            }
        }

        let program = if all_found {
            self.programs.get(&ids).and_then(|list| list.find(matches))
        } else {
            None
        };
        GraphicsLookup {
            program,
            guest_code,
        }
    }

    pub fn variants(&self, code: &[Option<&[u8]>; GRAPHICS_STAGE_SLOTS]) -> usize {
        let mut ids = [0u32; GRAPHICS_STAGE_SLOTS];
        for (slot, code) in code.iter().enumerate() {
            if let Some(code) = code {
                match self.stage_caches[slot].find_exact(code) {
                    Some(id) => ids[slot] = id,
                    None => return 0,
                }
            }
        }
        self.programs.get(&ids).map_or(0, ShaderSpecializationList::len)
    }

    pub fn programs(&self) -> impl Iterator<Item = &Arc<CachedShaderProgram<P>>> {
        self.programs.values().flat_map(ShaderSpecializationList::iter)
    }
}

pub struct ComputeShaderCacheHashTable<P> {
    cache: IdCache,
    programs: HashMap<u32, ShaderSpecializationList<P>>,
}

impl<P> Default for ComputeShaderCacheHashTable<P> {
    fn default() -> Self {
        Self {
            cache: IdCache::default(),
            programs: HashMap::new(),
        }
    }
}

impl<P> ComputeShaderCacheHashTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, program: Arc<CachedShaderProgram<P>>) -> bool {
        let Some(stage) = program.stage(0) else {
            return false;
        };
        let id = self.cache.add(stage.code.clone());
        self.programs.entry(id).or_default().add(program)
    }

    pub fn remove(&mut self, program: &Arc<CachedShaderProgram<P>>) -> bool {
        let Some(id) = program
            .stage(0)
            .and_then(|stage| self.cache.find_exact(&stage.code))
        else {
            return false;
        };
        self.programs
            .get_mut(&id)
            .is_some_and(|list| list.remove(program))
    }

    pub fn try_find(
        &self,
        channel: &dyn GpuChannel,
        gpu_va: u64,
        matches: impl FnMut(&CachedShaderProgram<P>) -> bool,
    ) -> ComputeLookup<P> {
        let mut accessor = ShaderCodeAccessor::new(channel.memory(), gpu_va);
        match self.cache.try_find(&mut accessor) {
            Some((id, code)) => ComputeLookup {
                program: self.programs.get(&id).and_then(|list| list.find(matches)),
                guest_code: Some(code),
            },
            None => ComputeLookup {
                program: None,
                guest_code: None,
            },
        }
    }

    pub fn variants(&self, code: &[u8]) -> usize {
        self.cache
            .find_exact(code)
            .and_then(|id| self.programs.get(&id))
            .map_or(0, ShaderSpecializationList::len)
    }

    pub fn programs(&self) -> impl Iterator<Item = &Arc<CachedShaderProgram<P>>> {
        self.programs.values().flat_map(ShaderSpecializationList::iter)
    }
}
