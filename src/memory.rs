// Device memory pool
//
// A sub-allocator over raw vkDeviceMemory. For every memory type we
// keep two lists of chunks, one for linear resources (buffers, linear
// images) and one for non-linear (optimally tiled) images. Each chunk
// is a single device allocation carrying a sorted block list; blocks
// are handed out by first-fit gap search between existing blocks.

use ash::vk;

use std::sync::Mutex;

use crate::{Result, SquallError};

/// Default chunk size for linear resources (64 MiB).
const LINEAR_CHUNK_SIZE: vk::DeviceSize = 1024 * 1024 * 64;
/// Default chunk size for non-linear resources (256 MiB).
const NON_LINEAR_CHUNK_SIZE: vk::DeviceSize = 1024 * 1024 * 256;

/// Sentinel block ids marking the start and end of a chunk. Real block
/// ids count up from zero, so these can never collide.
const HEAD_SENTINEL_ID: u64 = u64::MAX;
const TAIL_SENTINEL_ID: u64 = u64::MAX - 1;

pub(crate) fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(alignment > 0);
    ((value + alignment - 1) / alignment) * alignment
}

/// Adjust a byte size up so consecutive buffers of this size stay
/// aligned for uniform, storage and mapped access.
pub(crate) fn buffer_alignment(
    unaligned_size: vk::DeviceSize,
    limits: &vk::PhysicalDeviceLimits,
) -> vk::DeviceSize {
    let alignment = limits
        .min_uniform_buffer_offset_alignment
        .max(limits.min_storage_buffer_offset_alignment)
        .max(limits.min_memory_map_alignment as vk::DeviceSize)
        .max(1);
    align_up(unaligned_size.max(1), alignment)
}

/// A single virtual allocation from a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    id: u64,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    alignment: vk::DeviceSize,
}

/// A single allocation straight from the device. Blocks are assigned
/// out of it. The block list is kept sorted by offset and framed by
/// two zero-sized sentinels so gap search never has to special case
/// the ends.
struct Chunk {
    id: u64,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    blocks: Vec<Block>,
    block_id_counter: u64,
}

impl Chunk {
    fn with_sentinels(id: u64, memory: vk::DeviceMemory, size: vk::DeviceSize) -> Self {
        Chunk {
            id,
            memory,
            size,
            blocks: vec![
                Block {
                    id: HEAD_SENTINEL_ID,
                    offset: 0,
                    size: 0,
                    alignment: 1,
                },
                Block {
                    id: TAIL_SENTINEL_ID,
                    offset: size,
                    size: 0,
                    alignment: 1,
                },
            ],
            block_id_counter: 0,
        }
    }

    /// First-fit search for an aligned gap able to hold `size` bytes.
    /// On success the new block is inserted in place and returned.
    fn allocate_block(
        &mut self,
        size: vk::DeviceSize,
        alignment: vk::DeviceSize,
    ) -> Option<Block> {
        for i in 1..self.blocks.len() {
            let prev = self.blocks[i - 1];
            let next = self.blocks[i];

            let gap_begin = align_up(prev.offset + prev.size, alignment);
            if gap_begin > next.offset {
                continue;
            }
            if next.offset - gap_begin >= size {
                let block = Block {
                    id: self.block_id_counter,
                    offset: gap_begin,
                    size,
                    alignment,
                };
                self.block_id_counter += 1;
                self.blocks.insert(i, block);
                return Some(block);
            }
        }
        None
    }

    fn free_block(&mut self, block_id: u64) {
        if let Some(pos) = self.blocks.iter().position(|b| b.id == block_id) {
            self.blocks.remove(pos);
        }
    }

    /// Only the two sentinels remain.
    fn is_empty(&self) -> bool {
        self.blocks.len() <= 2
    }

    fn user_block_count(&self) -> usize {
        self.blocks.len() - 2
    }
}

/// A sub-allocation handed out by the pool. `DeviceMemoryPool::free`
/// is the sole way to return it.
pub struct PoolMemory {
    pm_memory: vk::DeviceMemory,
    pm_offset: vk::DeviceSize,
    pm_size: vk::DeviceSize,
    pm_alignment: vk::DeviceSize,
    pm_chunk_id: u64,
    pm_block_id: u64,
    pm_memory_type_index: u32,
    pm_linear: bool,
    pm_allocated: bool,
}

impl Default for PoolMemory {
    fn default() -> Self {
        PoolMemory {
            pm_memory: vk::DeviceMemory::null(),
            pm_offset: 0,
            pm_size: 0,
            pm_alignment: 1,
            pm_chunk_id: u64::MAX,
            pm_block_id: u64::MAX,
            pm_memory_type_index: u32::MAX,
            pm_linear: true,
            pm_allocated: false,
        }
    }
}

impl PoolMemory {
    pub fn memory(&self) -> vk::DeviceMemory {
        self.pm_memory
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.pm_offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.pm_size
    }

    pub fn is_allocated(&self) -> bool {
        self.pm_allocated
    }

    /// Copy `data` into this allocation. The memory type must be host
    /// visible.
    pub fn upload<T: Copy>(&self, dev: &ash::Device, data: &[T]) -> Result<()> {
        self.upload_at(dev, 0, data)
    }

    /// Copy `data` into this allocation starting `byte_offset` bytes in.
    pub fn upload_at<T: Copy>(
        &self,
        dev: &ash::Device,
        byte_offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let byte_size = std::mem::size_of_val(data) as vk::DeviceSize;
        debug_assert!(byte_offset + byte_size <= self.pm_size);
        unsafe {
            let ptr = dev
                .map_memory(
                    self.pm_memory,
                    self.pm_offset + byte_offset,
                    byte_size,
                    vk::MemoryMapFlags::empty(),
                )
                .map_err(SquallError::from_vk)?;
            let dst = std::slice::from_raw_parts_mut(ptr as *mut T, data.len());
            dst.copy_from_slice(data);
            dev.unmap_memory(self.pm_memory);
        }
        Ok(())
    }
}

/// A buffer with backing pool memory, and optionally a buffer view,
/// created and destroyed as one transaction.
pub struct CompleteBuffer {
    pub buffer: vk::Buffer,
    pub view: vk::BufferView,
    pub memory: PoolMemory,
}

/// An image with backing pool memory, and optionally an image view.
pub struct CompleteImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: PoolMemory,
}

struct PoolInner {
    chunk_id_counter: u64,
    /// Indexed by memory type; buffers and linear images.
    linear_chunks: Vec<Vec<Chunk>>,
    /// Indexed by memory type; optimally tiled images.
    non_linear_chunks: Vec<Vec<Chunk>>,
}

/// Sub-allocator over device memory. Internally locked; shared
/// read-mostly between the main thread and the loader threads.
pub struct DeviceMemoryPool {
    dmp_dev: ash::Device,
    dmp_device_properties: vk::PhysicalDeviceProperties,
    dmp_memory_properties: vk::PhysicalDeviceMemoryProperties,
    dmp_linear_chunk_size: vk::DeviceSize,
    dmp_non_linear_chunk_size: vk::DeviceSize,
    dmp_inner: Mutex<PoolInner>,
}

impl DeviceMemoryPool {
    pub fn new(
        inst: &ash::Instance,
        pdev: vk::PhysicalDevice,
        dev: ash::Device,
    ) -> DeviceMemoryPool {
        let device_properties = unsafe { inst.get_physical_device_properties(pdev) };
        let memory_properties = unsafe { inst.get_physical_device_memory_properties(pdev) };
        let type_count = memory_properties.memory_type_count as usize;

        DeviceMemoryPool {
            dmp_dev: dev,
            dmp_device_properties: device_properties,
            dmp_memory_properties: memory_properties,
            dmp_linear_chunk_size: LINEAR_CHUNK_SIZE,
            dmp_non_linear_chunk_size: NON_LINEAR_CHUNK_SIZE,
            dmp_inner: Mutex::new(PoolInner {
                chunk_id_counter: 0,
                linear_chunks: (0..type_count).map(|_| Vec::new()).collect(),
                non_linear_chunks: (0..type_count).map(|_| Vec::new()).collect(),
            }),
        }
    }

    pub fn device_properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.dmp_device_properties
    }

    fn find_memory_type_index(
        &self,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        for i in 0..self.dmp_memory_properties.memory_type_count {
            if requirements.memory_type_bits & (1 << i) != 0
                && self.dmp_memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(flags)
            {
                return Some(i);
            }
        }
        None
    }

    /// Allocate memory suitable for `buffer` with `flags` properties.
    pub fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<PoolMemory> {
        let requirements = unsafe { self.dmp_dev.get_buffer_memory_requirements(buffer) };
        let type_index = self
            .find_memory_type_index(&requirements, flags)
            .ok_or(SquallError::OUT_OF_DEVICE_MEMORY)?;
        self.allocate_memory(true, &requirements, type_index)
    }

    /// Allocate memory suitable for `image`. Optimally tiled images go
    /// to the non-linear chunk lists.
    pub fn allocate_image_memory(
        &self,
        image: vk::Image,
        tiling: vk::ImageTiling,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<PoolMemory> {
        let requirements = unsafe { self.dmp_dev.get_image_memory_requirements(image) };
        let type_index = self
            .find_memory_type_index(&requirements, flags)
            .ok_or(SquallError::OUT_OF_DEVICE_MEMORY)?;
        let linear = tiling != vk::ImageTiling::OPTIMAL;
        self.allocate_memory(linear, &requirements, type_index)
    }

    /// Allocate and bind in one step. A bind failure frees the memory
    /// before reporting.
    pub fn allocate_and_bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<PoolMemory> {
        let mut memory = self.allocate_buffer_memory(buffer, flags)?;
        let bind = unsafe {
            self.dmp_dev
                .bind_buffer_memory(buffer, memory.pm_memory, memory.pm_offset)
        };
        if let Err(e) = bind {
            self.free(&mut memory);
            return Err(SquallError::from_vk(e));
        }
        Ok(memory)
    }

    pub fn allocate_and_bind_image_memory(
        &self,
        image: vk::Image,
        tiling: vk::ImageTiling,
        flags: vk::MemoryPropertyFlags,
    ) -> Result<PoolMemory> {
        let mut memory = self.allocate_image_memory(image, tiling, flags)?;
        let bind = unsafe {
            self.dmp_dev
                .bind_image_memory(image, memory.pm_memory, memory.pm_offset)
        };
        if let Err(e) = bind {
            self.free(&mut memory);
            return Err(SquallError::from_vk(e));
        }
        Ok(memory)
    }

    /// Create a buffer, allocate and bind memory for it, and optionally
    /// create a view, as one transaction. On any failure every partial
    /// resource is destroyed.
    pub fn create_complete_buffer(
        &self,
        create_info: &vk::BufferCreateInfo,
        flags: vk::MemoryPropertyFlags,
        view_info: Option<vk::BufferViewCreateInfo>,
    ) -> Result<CompleteBuffer> {
        let buffer = unsafe {
            self.dmp_dev
                .create_buffer(create_info, None)
                .map_err(SquallError::from_vk)?
        };

        let memory = match self.allocate_and_bind_buffer_memory(buffer, flags) {
            Ok(m) => m,
            Err(e) => {
                unsafe { self.dmp_dev.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let view = match view_info {
            Some(mut info) => {
                info.buffer = buffer;
                match unsafe { self.dmp_dev.create_buffer_view(&info, None) } {
                    Ok(v) => v,
                    Err(e) => {
                        let mut complete = CompleteBuffer {
                            buffer,
                            view: vk::BufferView::null(),
                            memory,
                        };
                        self.free_complete_buffer(&mut complete);
                        return Err(SquallError::from_vk(e));
                    }
                }
            }
            None => vk::BufferView::null(),
        };

        Ok(CompleteBuffer {
            buffer,
            view,
            memory,
        })
    }

    /// Image version of `create_complete_buffer`.
    pub fn create_complete_image(
        &self,
        create_info: &vk::ImageCreateInfo,
        flags: vk::MemoryPropertyFlags,
        view_info: Option<vk::ImageViewCreateInfo>,
    ) -> Result<CompleteImage> {
        let image = unsafe {
            self.dmp_dev
                .create_image(create_info, None)
                .map_err(SquallError::from_vk)?
        };

        let memory =
            match self.allocate_and_bind_image_memory(image, create_info.tiling, flags) {
                Ok(m) => m,
                Err(e) => {
                    unsafe { self.dmp_dev.destroy_image(image, None) };
                    return Err(e);
                }
            };

        let view = match view_info {
            Some(mut info) => {
                info.image = image;
                match unsafe { self.dmp_dev.create_image_view(&info, None) } {
                    Ok(v) => v,
                    Err(e) => {
                        let mut complete = CompleteImage {
                            image,
                            view: vk::ImageView::null(),
                            memory,
                        };
                        self.free_complete_image(&mut complete);
                        return Err(SquallError::from_vk(e));
                    }
                }
            }
            None => vk::ImageView::null(),
        };

        Ok(CompleteImage {
            image,
            view,
            memory,
        })
    }

    /// Host-visible buffer pre-filled with `data`.
    pub fn create_complete_host_buffer_with_data<T: Copy>(
        &self,
        data: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<CompleteBuffer> {
        let byte_size = std::mem::size_of_val(data) as vk::DeviceSize;
        let create_info = vk::BufferCreateInfo::builder()
            .size(byte_size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();

        let mut complete = self.create_complete_buffer(
            &create_info,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            None,
        )?;

        if let Err(e) = complete.memory.upload(&self.dmp_dev, data) {
            self.free_complete_buffer(&mut complete);
            return Err(e);
        }
        Ok(complete)
    }

    fn allocate_memory(
        &self,
        linear: bool,
        requirements: &vk::MemoryRequirements,
        type_index: u32,
    ) -> Result<PoolMemory> {
        let mut inner = self.dmp_inner.lock().unwrap();
        let default_chunk_size = if linear {
            self.dmp_linear_chunk_size
        } else {
            self.dmp_non_linear_chunk_size
        };
        let granularity = self
            .dmp_device_properties
            .limits
            .buffer_image_granularity
            .max(1);

        let chunks = if linear {
            &mut inner.linear_chunks[type_index as usize]
        } else {
            &mut inner.non_linear_chunks[type_index as usize]
        };

        // First fit over existing chunks.
        let mut selected: Option<(u64, vk::DeviceMemory, Block)> = None;
        for chunk in chunks.iter_mut() {
            if let Some(block) =
                chunk.allocate_block(requirements.size, requirements.alignment.max(1))
            {
                selected = Some((chunk.id, chunk.memory, block));
                break;
            }
        }

        let (chunk_id, chunk_memory, block) = match selected {
            Some(s) => s,
            None => {
                // No space anywhere, allocate a fresh chunk from the
                // device sized for at least this request.
                let chunk_size =
                    align_up(requirements.size.max(default_chunk_size), granularity);
                let alloc_info = vk::MemoryAllocateInfo::builder()
                    .allocation_size(chunk_size)
                    .memory_type_index(type_index)
                    .build();
                let memory = unsafe {
                    self.dmp_dev
                        .allocate_memory(&alloc_info, None)
                        .map_err(SquallError::from_vk)?
                };

                let id = inner.chunk_id_counter;
                inner.chunk_id_counter += 1;
                let mut chunk = Chunk::with_sentinels(id, memory, chunk_size);
                let block = chunk
                    .allocate_block(requirements.size, requirements.alignment.max(1))
                    .expect("a fresh chunk must fit the request it was sized for");

                let chunks = if linear {
                    &mut inner.linear_chunks[type_index as usize]
                } else {
                    &mut inner.non_linear_chunks[type_index as usize]
                };
                chunks.push(chunk);
                (id, memory, block)
            }
        };

        Ok(PoolMemory {
            pm_memory: chunk_memory,
            pm_offset: block.offset,
            pm_size: block.size,
            pm_alignment: block.alignment,
            pm_chunk_id: chunk_id,
            pm_block_id: block.id,
            pm_memory_type_index: type_index,
            pm_linear: linear,
            pm_allocated: true,
        })
    }

    /// Return a sub-allocation to the pool. Chunks left with no user
    /// blocks are destroyed immediately.
    pub fn free(&self, memory: &mut PoolMemory) {
        if !memory.pm_allocated {
            return;
        }
        memory.pm_allocated = false;

        let mut inner = self.dmp_inner.lock().unwrap();
        let chunks = if memory.pm_linear {
            &mut inner.linear_chunks[memory.pm_memory_type_index as usize]
        } else {
            &mut inner.non_linear_chunks[memory.pm_memory_type_index as usize]
        };

        let pos = chunks.iter().position(|c| c.id == memory.pm_chunk_id);
        debug_assert!(pos.is_some(), "freeing memory from an unknown chunk");
        if let Some(pos) = pos {
            chunks[pos].free_block(memory.pm_block_id);
            if chunks[pos].is_empty() {
                let chunk = chunks.remove(pos);
                debug_assert_eq!(chunk.user_block_count(), 0);
                unsafe { self.dmp_dev.free_memory(chunk.memory, None) };
            }
        }
    }

    pub fn free_complete_buffer(&self, complete: &mut CompleteBuffer) {
        unsafe {
            if complete.view != vk::BufferView::null() {
                self.dmp_dev.destroy_buffer_view(complete.view, None);
                complete.view = vk::BufferView::null();
            }
            if complete.buffer != vk::Buffer::null() {
                self.dmp_dev.destroy_buffer(complete.buffer, None);
                complete.buffer = vk::Buffer::null();
            }
        }
        self.free(&mut complete.memory);
    }

    pub fn free_complete_image(&self, complete: &mut CompleteImage) {
        unsafe {
            if complete.view != vk::ImageView::null() {
                self.dmp_dev.destroy_image_view(complete.view, None);
                complete.view = vk::ImageView::null();
            }
            if complete.image != vk::Image::null() {
                self.dmp_dev.destroy_image(complete.image, None);
                complete.image = vk::Image::null();
            }
        }
        self.free(&mut complete.memory);
    }
}

impl Drop for DeviceMemoryPool {
    fn drop(&mut self) {
        let inner = self.dmp_inner.lock().unwrap();
        for list in inner
            .linear_chunks
            .iter()
            .chain(inner.non_linear_chunks.iter())
        {
            for chunk in list.iter() {
                unsafe { self.dmp_dev.free_memory(chunk.memory, None) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(size: vk::DeviceSize) -> Chunk {
        Chunk::with_sentinels(0, vk::DeviceMemory::null(), size)
    }

    fn assert_invariants(c: &Chunk) {
        // Sorted by offset, non-overlapping, fully inside the chunk,
        // each aligned to its requested alignment.
        for w in c.blocks.windows(2) {
            assert!(w[0].offset + w[0].size <= w[1].offset);
        }
        for b in c.blocks.iter() {
            if b.id == HEAD_SENTINEL_ID || b.id == TAIL_SENTINEL_ID {
                continue;
            }
            assert!(b.offset + b.size <= c.size);
            assert_eq!(b.offset % b.alignment, 0);
        }
    }

    #[test]
    fn aligned_placement() {
        let mut c = chunk(1024);
        let a = c.allocate_block(10, 1).unwrap();
        assert_eq!(a.offset, 0);
        let b = c.allocate_block(16, 64).unwrap();
        assert_eq!(b.offset, 64);
        assert_invariants(&c);
    }

    #[test]
    fn first_fit_reuses_freed_gaps() {
        let mut c = chunk(256);
        let a = c.allocate_block(64, 1).unwrap();
        let _b = c.allocate_block(64, 1).unwrap();
        c.free_block(a.id);
        // Fits in the hole a left behind.
        let d = c.allocate_block(32, 1).unwrap();
        assert_eq!(d.offset, 0);
        assert_invariants(&c);
    }

    #[test]
    fn exact_fit_succeeds_one_byte_more_fails() {
        let mut c = chunk(128);
        assert!(c.allocate_block(128, 1).is_some());
        let mut c2 = chunk(128);
        assert!(c2.allocate_block(129, 1).is_none());
    }

    #[test]
    fn chunk_empty_after_all_frees() {
        let mut c = chunk(512);
        let ids: Vec<u64> = (0..4)
            .map(|_| c.allocate_block(100, 4).unwrap().id)
            .collect();
        assert_eq!(c.user_block_count(), 4);
        for id in ids {
            c.free_block(id);
        }
        assert!(c.is_empty());
    }

    #[test]
    fn randomized_alloc_free_keeps_invariants() {
        // Deterministic xorshift so the test is reproducible.
        let mut state: u64 = 0x9e3779b97f4a7c15;
        let mut rand = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut c = chunk(1 << 20);
        let mut live: Vec<u64> = Vec::new();
        for _ in 0..2000 {
            if live.is_empty() || rand() % 3 != 0 {
                let size = (rand() % 4096) + 1;
                let alignment = 1 << (rand() % 9);
                if let Some(b) = c.allocate_block(size, alignment) {
                    live.push(b.id);
                }
            } else {
                let pick = (rand() as usize) % live.len();
                let id = live.swap_remove(pick);
                c.free_block(id);
            }
            assert_invariants(&c);
        }
        for id in live {
            c.free_block(id);
        }
        assert!(c.is_empty());
    }

    #[test]
    fn buffer_alignment_rounds_up() {
        let mut limits = vk::PhysicalDeviceLimits::default();
        limits.min_uniform_buffer_offset_alignment = 4;
        limits.min_storage_buffer_offset_alignment = 16;
        limits.min_memory_map_alignment = 8;
        assert_eq!(buffer_alignment(7, &limits), 16);
        assert_eq!(buffer_alignment(16, &limits), 16);
        assert_eq!(buffer_alignment(17, &limits), 32);
    }
}
