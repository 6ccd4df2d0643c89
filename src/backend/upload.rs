// Per-frame upload heap
//
// A persistently mapped CpuToGpu buffer sub-allocated by a bump arena. The
// arena cursor doubles as the byte offset used for copy sources and dynamic
// uniform offsets, so CPU writes and GPU addressing share one bookkeeping.
//
// Reclaim discipline: reset() is only legal once the fence token of the
// frame that last wrote into this heap has been observed complete. The
// frame driver owns that ordering.

use super::VulkanDevice;
use crate::arena::{align_up, Arena};
use crate::snapshot::ImageView;
use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Byte layout of one mip level inside a staging block.
///
/// `offset` is relative to the block start and respects the device's copy
/// offset alignment; rows are padded from `row_size` out to `row_pitch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceFootprint {
    pub mip: u32,
    pub offset: u64,
    pub width: u32,
    pub height: u32,
    pub row_size: u64,
    pub row_pitch: u64,
    pub rows: u32,
}

impl SubresourceFootprint {
    pub fn slice_size(&self) -> u64 {
        self.row_pitch * self.rows as u64
    }
}

/// Compute per-mip staging footprints for a tightly packed mip chain.
///
/// Every subresource gets its own offset-aligned footprint; mip dimensions
/// floor at 1. Returns the footprints and the total block size to reserve.
pub fn compute_footprints(
    width: u32,
    height: u32,
    mip_count: u32,
    bytes_per_pixel: u32,
    row_align: u64,
    offset_align: u64,
) -> (Vec<SubresourceFootprint>, u64) {
    assert!(width > 0 && height > 0 && mip_count > 0);

    let mut footprints = Vec::with_capacity(mip_count as usize);
    let mut cursor = 0u64;

    for mip in 0..mip_count {
        let mip_width = (width >> mip).max(1);
        let mip_height = (height >> mip).max(1);
        let row_size = mip_width as u64 * bytes_per_pixel as u64;
        let row_pitch = align_up(row_size, row_align);

        let footprint = SubresourceFootprint {
            mip,
            offset: align_up(cursor, offset_align),
            width: mip_width,
            height: mip_height,
            row_size,
            row_pitch,
            rows: mip_height,
        };
        cursor = footprint.offset + footprint.slice_size();
        footprints.push(footprint);
    }

    (footprints, cursor)
}

/// Copy one tightly packed subresource into its padded footprint. `dst` is
/// the whole staging block; `src` holds exactly `rows * row_size` bytes.
pub fn write_padded_rows(dst: &mut [u8], src: &[u8], footprint: &SubresourceFootprint) {
    debug_assert_eq!(src.len() as u64, footprint.row_size * footprint.rows as u64);

    for row in 0..footprint.rows as u64 {
        let src_start = (row * footprint.row_size) as usize;
        let dst_start = (footprint.offset + row * footprint.row_pitch) as usize;
        let len = footprint.row_size as usize;
        dst[dst_start..dst_start + len].copy_from_slice(&src[src_start..src_start + len]);
    }
}

/// Persistently mapped staging/constant heap for one frame slot.
pub struct UploadHeap {
    device: Arc<VulkanDevice>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    mapped: *mut u8,
    arena: Arena,
    alloc_align: u64,
}

impl UploadHeap {
    pub fn new(device: &Arc<VulkanDevice>, size: u64) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::UNIFORM_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create upload heap buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let allocation = device
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "upload-heap",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("Failed to allocate upload heap memory")?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind upload heap memory")?;

        let mapped = allocation
            .mapped_ptr()
            .context("Upload heap memory is not host-mapped")?
            .as_ptr() as *mut u8;

        Ok(Self {
            device: device.clone(),
            buffer,
            allocation: Some(allocation),
            mapped,
            arena: Arena::new(size),
            alloc_align: device.upload_alignment(),
        })
    }

    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn remaining(&self) -> u64 {
        self.arena.remaining()
    }

    /// Copy a Pod struct into the heap; the returned offset is valid as a
    /// dynamic uniform offset and as a copy source offset.
    pub fn push<T: Pod>(&mut self, value: &T) -> u32 {
        let offset = self.push_bytes(bytemuck::bytes_of(value));
        offset as u32
    }

    /// Copy raw bytes into the heap at the device's transfer alignment.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.arena.allocate(bytes.len() as u64, self.alloc_align);
        self.block_mut(offset, bytes.len() as u64).copy_from_slice(bytes);
        offset
    }

    /// Stage a tightly packed mip chain with device-required row padding.
    /// Returns the block base offset and the per-mip footprints (relative to
    /// the base).
    pub fn stage_image(&mut self, image: &ImageView) -> (u64, Vec<SubresourceFootprint>) {
        let bpp = image.format.bytes_per_pixel();
        let (footprints, total) = compute_footprints(
            image.width,
            image.height,
            image.mip_count,
            bpp,
            self.device.copy_row_alignment(),
            self.device.copy_offset_alignment(),
        );

        let base = self.arena.allocate(total, self.alloc_align.max(self.device.copy_offset_alignment()));
        let block = self.block_mut(base, total);

        let mut src_cursor = 0usize;
        for footprint in &footprints {
            let tight = (footprint.row_size * footprint.rows as u64) as usize;
            write_padded_rows(block, &image.bytes[src_cursor..src_cursor + tight], footprint);
            src_cursor += tight;
        }
        assert_eq!(
            src_cursor,
            image.bytes.len(),
            "image byte length does not match declared {}x{} mip chain",
            image.width,
            image.height
        );

        (base, footprints)
    }

    /// Release everything written for the retiring frame. Only call after
    /// the slot's fence token has completed.
    pub fn reset(&mut self) {
        self.arena.reset();
    }

    fn block_mut(&mut self, offset: u64, len: u64) -> &mut [u8] {
        debug_assert!(offset + len <= self.arena.capacity());
        // Mapped pointer is valid for the allocation's lifetime and the
        // arena never hands out overlapping ranges.
        unsafe { std::slice::from_raw_parts_mut(self.mapped.add(offset as usize), len as usize) }
    }
}

impl Drop for UploadHeap {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator.lock().free(allocation);
        }
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reconstruct the tight bytes of one mip from a padded staging block.
    fn read_back(block: &[u8], footprint: &SubresourceFootprint) -> Vec<u8> {
        let mut out = Vec::with_capacity((footprint.row_size * footprint.rows as u64) as usize);
        for row in 0..footprint.rows as u64 {
            let start = (footprint.offset + row * footprint.row_pitch) as usize;
            out.extend_from_slice(&block[start..start + footprint.row_size as usize]);
        }
        out
    }

    // Deterministic byte pattern distinguishing rows and mips.
    fn tight_chain(width: u32, height: u32, mips: u32, bpp: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for mip in 0..mips {
            let w = (width >> mip).max(1);
            let h = (height >> mip).max(1);
            for y in 0..h {
                for x in 0..w * bpp {
                    bytes.push((mip as u32 * 31 + y * 7 + x) as u8);
                }
            }
        }
        bytes
    }

    #[test]
    fn footprints_respect_alignment_per_mip() {
        let (footprints, total) = compute_footprints(256, 256, 9, 4, 256, 512);

        assert_eq!(footprints.len(), 9);
        for fp in &footprints {
            assert_eq!(fp.offset % 512, 0, "mip {} offset unaligned", fp.mip);
            assert_eq!(fp.row_pitch % 256, 0, "mip {} pitch unaligned", fp.mip);
            assert!(fp.row_pitch >= fp.row_size);
            assert!(fp.width >= 1 && fp.height >= 1);
        }
        // Last mip of a 256x256 chain with 9 levels is 1x1.
        assert_eq!(footprints[8].width, 1);
        assert_eq!(footprints[8].height, 1);
        assert!(total >= footprints[8].offset + footprints[8].slice_size());
    }

    #[test]
    fn unaligned_rows_round_trip_per_mip() {
        // 33-wide 3-byte texels: tight row of 99 bytes, nowhere near the
        // 256-byte pitch, catching any mip that reuses the tight stride.
        let (width, height, mips, bpp) = (33u32, 16u32, 3u32, 3u32);
        let src = tight_chain(width, height, mips, bpp);
        let (footprints, total) = compute_footprints(width, height, mips, bpp, 256, 512);

        let mut block = vec![0xAAu8; total as usize];
        let mut cursor = 0usize;
        for fp in &footprints {
            let tight = (fp.row_size * fp.rows as u64) as usize;
            write_padded_rows(&mut block, &src[cursor..cursor + tight], fp);
            cursor += tight;
        }
        assert_eq!(cursor, src.len());

        let mut cursor = 0usize;
        for fp in &footprints {
            let tight = (fp.row_size * fp.rows as u64) as usize;
            assert_eq!(
                read_back(&block, fp),
                &src[cursor..cursor + tight],
                "mip {} corrupted",
                fp.mip
            );
            cursor += tight;
        }
    }

    #[test]
    fn aligned_rows_have_no_padding() {
        // 64-wide RGBA8 rows are exactly 256 bytes - pitch equals row size.
        let (footprints, _) = compute_footprints(64, 64, 1, 4, 256, 512);
        assert_eq!(footprints[0].row_pitch, footprints[0].row_size);
    }

    #[test]
    fn non_square_chain_floors_at_one() {
        let (footprints, _) = compute_footprints(256, 16, 9, 4, 256, 512);
        let last = footprints.last().unwrap();
        assert_eq!((last.width, last.height), (1, 1));
        // Height hits 1 at mip 4 and stays there.
        assert_eq!(footprints[4].height, 1);
        assert_eq!(footprints[5].height, 1);
    }
}
