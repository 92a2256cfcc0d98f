// Mesh streaming buffer
//
// Indices, vertices and texture layer weights are appended host side
// into per-family blocks, each a staging+device buffer pair bound to
// the pipeline as a storage block (the index block doubles as the
// bound index buffer). At frame end the used range of every block is
// copied staging→device in the window's transfer command buffer.

use ash::vk;

use std::sync::Arc;

use crate::device::Device;
use crate::memory::{buffer_alignment, CompleteBuffer};
use crate::mesh::Vertex;
use crate::pipeline::{
    DESCRIPTOR_SET_INDEX_BUFFER, DESCRIPTOR_SET_TEXTURE_LAYER_WEIGHTS,
    DESCRIPTOR_SET_VERTEX_BUFFER,
};
use crate::{Result, SquallError};

/// Minimum block sizes per family.
const INDEX_BLOCK_BYTE_SIZE: vk::DeviceSize = 512 * 1024;
const VERTEX_BLOCK_BYTE_SIZE: vk::DeviceSize = 2 * 1024 * 1024;
const WEIGHT_BLOCK_BYTE_SIZE: vk::DeviceSize = 256 * 1024;

/// Where a pushed mesh landed. The caller embeds these offsets in the
/// draw's push constants.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MeshBlockLocation {
    pub index_offset: u32,
    pub index_count: u32,
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub texture_layer_weight_offset: u32,
    pub texture_layer_weight_count: u32,
    pub index_byte_offset: vk::DeviceSize,
}

/// One staging+device buffer pair of a single family.
struct MeshBufferBlock<T: Copy> {
    host_data: Vec<T>,
    staging: CompleteBuffer,
    device: CompleteBuffer,
    descriptor_set: crate::descpool::PoolDescriptorSet,
    total_byte_size: vk::DeviceSize,
    used_byte_size: vk::DeviceSize,
}

impl<T: Copy> MeshBufferBlock<T> {
    fn new(dev: &Arc<Device>, byte_size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> Result<Self> {
        let total = buffer_alignment(byte_size, dev.limits());

        let staging_info = vk::BufferCreateInfo::builder()
            .size(total)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let mut staging = dev.d_memory_pool.create_complete_buffer(
            &staging_info,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            None,
        )?;

        let device_info = vk::BufferCreateInfo::builder()
            .size(total)
            .usage(usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .build();
        let mut device = match dev.d_memory_pool.create_complete_buffer(
            &device_info,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            None,
        ) {
            Ok(b) => b,
            Err(e) => {
                dev.d_memory_pool.free_complete_buffer(&mut staging);
                return Err(e);
            }
        };

        // Expose the device buffer to the shaders as a storage block.
        let mut descpool = dev.d_descpool.lock().unwrap();
        let descriptor_set = match descpool.allocate_descriptor_set(&dev.d_layouts.storage) {
            Ok(s) => s,
            Err(e) => {
                dev.d_memory_pool.free_complete_buffer(&mut staging);
                dev.d_memory_pool.free_complete_buffer(&mut device);
                return Err(e);
            }
        };
        let buffer_info = [vk::DescriptorBufferInfo::builder()
            .buffer(device.buffer)
            .offset(0)
            .range(vk::WHOLE_SIZE)
            .build()];
        let writes = [vk::WriteDescriptorSet::builder()
            .dst_set(descriptor_set.set())
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)
            .build()];
        unsafe { dev.d_dev.update_descriptor_sets(&writes, &[]) };

        Ok(MeshBufferBlock {
            host_data: Vec::with_capacity(total as usize / std::mem::size_of::<T>()),
            staging,
            device,
            descriptor_set,
            total_byte_size: total,
            used_byte_size: 0,
        })
    }

    fn element_size() -> vk::DeviceSize {
        std::mem::size_of::<T>() as vk::DeviceSize
    }

    fn fits(&self, count: usize) -> bool {
        self.used_byte_size + count as vk::DeviceSize * Self::element_size()
            <= self.total_byte_size
    }

    /// Reserve `count` elements, returning the byte offset the data
    /// will start at.
    fn reserve(&mut self, count: usize) -> vk::DeviceSize {
        debug_assert!(self.fits(count));
        let offset = self.used_byte_size;
        self.used_byte_size += count as vk::DeviceSize * Self::element_size();
        offset
    }

    fn append(&mut self, data: &[T]) {
        self.host_data.extend_from_slice(data);
        debug_assert!(
            self.host_data.len() as vk::DeviceSize * Self::element_size()
                <= self.used_byte_size
        );
    }

    /// Copy the whole used range into staging, record staging→device,
    /// and reset for the next frame.
    fn upload(&mut self, dev: &Device, cbuf: vk::CommandBuffer) -> Result<()> {
        if self.used_byte_size == 0 {
            return Ok(());
        }

        self.staging
            .memory
            .upload(&dev.d_dev, self.host_data.as_slice())?;

        let regions = [vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: self.used_byte_size,
        }];
        unsafe {
            dev.d_dev
                .cmd_copy_buffer(cbuf, self.staging.buffer, self.device.buffer, &regions);
        }

        self.host_data.clear();
        self.used_byte_size = 0;
        Ok(())
    }

    fn destroy(&mut self, dev: &Device) {
        dev.d_descpool
            .lock()
            .unwrap()
            .free_descriptor_set(&mut self.descriptor_set);
        dev.d_memory_pool.free_complete_buffer(&mut self.staging);
        dev.d_memory_pool.free_complete_buffer(&mut self.device);
    }
}

/// Streams mesh data for one draw target. The three block families
/// are independent; a mesh's indices, vertices and weights may land
/// in blocks created at different times.
pub(crate) struct MeshBuffer {
    mb_dev: Arc<Device>,
    mb_index_blocks: Vec<MeshBufferBlock<u32>>,
    mb_vertex_blocks: Vec<MeshBufferBlock<Vertex>>,
    mb_weight_blocks: Vec<MeshBufferBlock<f32>>,
    /// Device buffer handles of the currently bound blocks, used to
    /// skip redundant rebinds between draws.
    mb_bound_index_block: Option<vk::Buffer>,
    mb_bound_vertex_block: Option<vk::Buffer>,
    mb_bound_weight_block: Option<vk::Buffer>,
    mb_pushed_mesh_count: u32,
}

impl MeshBuffer {
    pub fn new(dev: Arc<Device>) -> MeshBuffer {
        MeshBuffer {
            mb_dev: dev,
            mb_index_blocks: Vec::new(),
            mb_vertex_blocks: Vec::new(),
            mb_weight_blocks: Vec::new(),
            mb_bound_index_block: None,
            mb_bound_vertex_block: None,
            mb_bound_weight_block: None,
            mb_pushed_mesh_count: 0,
        }
    }

    pub fn pushed_mesh_count(&self) -> u32 {
        self.mb_pushed_mesh_count
    }

    /// Push one mesh. Rebinds the index buffer and the storage block
    /// descriptor sets for any family whose block changed, then
    /// appends the host data. Returns the offsets for the draw's push
    /// constants.
    pub fn cmd_push_mesh(
        &mut self,
        cbuf: vk::CommandBuffer,
        indices: &[u32],
        vertices: &[Vertex],
        weights: &[f32],
    ) -> Result<MeshBlockLocation> {
        let dev = self.mb_dev.clone();
        let layout = dev.d_pipelines.primary_layout();

        let index_block = Self::find_block(
            &dev,
            &mut self.mb_index_blocks,
            indices.len(),
            INDEX_BLOCK_BYTE_SIZE,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        let index_byte_offset = self.mb_index_blocks[index_block].reserve(indices.len());

        let vertex_block = Self::find_block(
            &dev,
            &mut self.mb_vertex_blocks,
            vertices.len(),
            VERTEX_BLOCK_BYTE_SIZE,
            vk::BufferUsageFlags::empty(),
        )?;
        let vertex_byte_offset = self.mb_vertex_blocks[vertex_block].reserve(vertices.len());

        let weight_block = Self::find_block(
            &dev,
            &mut self.mb_weight_blocks,
            weights.len(),
            WEIGHT_BLOCK_BYTE_SIZE,
            vk::BufferUsageFlags::empty(),
        )?;
        let weight_byte_offset = self.mb_weight_blocks[weight_block].reserve(weights.len());

        // Rebind whatever changed since the previous draw.
        {
            let block = &self.mb_index_blocks[index_block];
            if self.mb_bound_index_block != Some(block.device.buffer) {
                unsafe {
                    dev.d_dev.cmd_bind_index_buffer(
                        cbuf,
                        block.device.buffer,
                        0,
                        vk::IndexType::UINT32,
                    );
                    dev.d_dev.cmd_bind_descriptor_sets(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        layout,
                        DESCRIPTOR_SET_INDEX_BUFFER,
                        &[block.descriptor_set.set()],
                        &[],
                    );
                }
                self.mb_bound_index_block = Some(block.device.buffer);
            }
        }
        {
            let block = &self.mb_vertex_blocks[vertex_block];
            if self.mb_bound_vertex_block != Some(block.device.buffer) {
                unsafe {
                    dev.d_dev.cmd_bind_descriptor_sets(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        layout,
                        DESCRIPTOR_SET_VERTEX_BUFFER,
                        &[block.descriptor_set.set()],
                        &[],
                    );
                }
                self.mb_bound_vertex_block = Some(block.device.buffer);
            }
        }
        {
            let block = &self.mb_weight_blocks[weight_block];
            if self.mb_bound_weight_block != Some(block.device.buffer) {
                unsafe {
                    dev.d_dev.cmd_bind_descriptor_sets(
                        cbuf,
                        vk::PipelineBindPoint::GRAPHICS,
                        layout,
                        DESCRIPTOR_SET_TEXTURE_LAYER_WEIGHTS,
                        &[block.descriptor_set.set()],
                        &[],
                    );
                }
                self.mb_bound_weight_block = Some(block.device.buffer);
            }
        }

        self.mb_index_blocks[index_block].append(indices);
        self.mb_vertex_blocks[vertex_block].append(vertices);
        self.mb_weight_blocks[weight_block].append(weights);
        self.mb_pushed_mesh_count += 1;

        Ok(MeshBlockLocation {
            index_offset: (index_byte_offset / std::mem::size_of::<u32>() as vk::DeviceSize)
                as u32,
            index_count: indices.len() as u32,
            vertex_offset: (vertex_byte_offset
                / std::mem::size_of::<Vertex>() as vk::DeviceSize) as u32,
            vertex_count: vertices.len() as u32,
            texture_layer_weight_offset: (weight_byte_offset
                / std::mem::size_of::<f32>() as vk::DeviceSize)
                as u32,
            texture_layer_weight_count: weights.len() as u32,
            index_byte_offset,
        })
    }

    fn find_block<T: Copy>(
        dev: &Arc<Device>,
        blocks: &mut Vec<MeshBufferBlock<T>>,
        count: usize,
        minimum_byte_size: vk::DeviceSize,
        extra_usage: vk::BufferUsageFlags,
    ) -> Result<usize> {
        for (i, block) in blocks.iter().enumerate() {
            if block.fits(count) {
                return Ok(i);
            }
        }

        let needed = count as vk::DeviceSize * std::mem::size_of::<T>() as vk::DeviceSize;
        let block = MeshBufferBlock::new(dev, needed.max(minimum_byte_size), extra_usage)?;
        if !block.fits(count) {
            return Err(SquallError::OUT_OF_DEVICE_MEMORY);
        }
        blocks.push(block);
        Ok(blocks.len() - 1)
    }

    /// Record the staging→device copies for every block that holds
    /// data, and reset the per-frame bookkeeping.
    pub fn cmd_upload_to_gpu(&mut self, cbuf: vk::CommandBuffer) -> Result<()> {
        for block in self.mb_index_blocks.iter_mut() {
            block.upload(&self.mb_dev, cbuf)?;
        }
        for block in self.mb_vertex_blocks.iter_mut() {
            block.upload(&self.mb_dev, cbuf)?;
        }
        for block in self.mb_weight_blocks.iter_mut() {
            block.upload(&self.mb_dev, cbuf)?;
        }

        self.mb_bound_index_block = None;
        self.mb_bound_vertex_block = None;
        self.mb_bound_weight_block = None;
        self.mb_pushed_mesh_count = 0;
        Ok(())
    }

    /// Drop the binding bookkeeping without touching block contents,
    /// used when a frame is abandoned.
    pub fn reset_bindings(&mut self) {
        self.mb_bound_index_block = None;
        self.mb_bound_vertex_block = None;
        self.mb_bound_weight_block = None;
    }

    pub fn destroy(&mut self) {
        let dev = self.mb_dev.clone();
        for mut block in self.mb_index_blocks.drain(..) {
            block.destroy(&dev);
        }
        for mut block in self.mb_vertex_blocks.drain(..) {
            block.destroy(&dev);
        }
        for mut block in self.mb_weight_blocks.drain(..) {
            block.destroy(&dev);
        }
    }
}
