use ash::vk;

use vk_mem::Alloc;

use crate::foundation::device::GfxDevice;

/// vk-mem 分配的 buffer
///
/// 分配失败视为资源耗尽，直接 panic，不在这一层做回退。
pub struct GfxBuffer {
    handle: vk::Buffer,
    allocation: vk_mem::Allocation,

    size: vk::DeviceSize,

    /// 在创建时写死；None 表示未映射
    map_ptr: Option<*mut u8>,

    debug_name: String,
}

// 创建与销毁
impl GfxBuffer {
    /// - mem_map: 是否持久映射；优先使用 device memory
    pub fn new(
        device: &GfxDevice,
        buffer_size: vk::DeviceSize,
        buffer_usage: vk::BufferUsageFlags,
        mem_map: bool,
        name: impl AsRef<str>,
    ) -> Self {
        let buffer_ci = vk::BufferCreateInfo::default().size(buffer_size).usage(buffer_usage);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: if mem_map {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };

        let (buffer, mut alloc) = unsafe {
            device
                .allocator()
                .create_buffer(&buffer_ci, &alloc_ci)
                .unwrap_or_else(|e| panic!("GfxBuffer::new: allocation failed for {:?}: {e:?}", name.as_ref()))
        };

        let mut mapped_ptr = None;
        if mem_map {
            unsafe {
                mapped_ptr = Some(device.allocator().map_memory(&mut alloc).unwrap());
            }
        }

        device.set_object_debug_name(buffer, format!("Buffer::{}", name.as_ref()));
        Self {
            handle: buffer,
            allocation: alloc,
            size: buffer_size,
            map_ptr: mapped_ptr,
            debug_name: name.as_ref().to_string(),
        }
    }

    pub fn destroy(self, device: &GfxDevice) {
        let Self { handle, mut allocation, map_ptr, .. } = self;
        unsafe {
            if map_ptr.is_some() {
                device.allocator().unmap_memory(&mut allocation);
            }
            device.allocator().destroy_buffer(handle, &mut allocation);
        }
    }
}

// getters
impl GfxBuffer {
    #[inline]
    pub fn vk_buffer(&self) -> vk::Buffer {
        self.handle
    }

    #[inline]
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    #[inline]
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    #[inline]
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.map_ptr.unwrap_or_else(|| panic!("GfxBuffer::{}: buffer is not mapped", self.debug_name))
    }
}

// tools
impl GfxBuffer {
    /// 写入单个 POD 结构到映射内存的起始位置
    #[inline]
    pub fn write_pod<T: bytemuck::Pod>(&self, value: &T) {
        self.write_bytes(bytemuck::bytes_of(value), 0);
    }

    /// 写入 POD slice，byte_offset 为目标偏移
    #[inline]
    pub fn write_slice<T: bytemuck::Pod>(&self, values: &[T], byte_offset: vk::DeviceSize) {
        self.write_bytes(bytemuck::cast_slice(values), byte_offset);
    }

    fn write_bytes(&self, bytes: &[u8], byte_offset: vk::DeviceSize) {
        assert!(
            byte_offset + bytes.len() as vk::DeviceSize <= self.size,
            "GfxBuffer::{}: write of {} bytes at offset {} exceeds size {}",
            self.debug_name,
            bytes.len(),
            byte_offset,
            self.size
        );
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.mapped_ptr().add(byte_offset as usize), bytes.len());
        }
    }
}
