use ash::vk;
use itertools::Itertools;

use crate::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};
use crate::foundation::device::GfxDevice;

/// 命令录制的轻量包装
///
/// 不持有 command buffer 的所有权，按需临时创建；
/// 分配与回收由 frame context 的 command pool 负责。
#[derive(Clone, Copy)]
pub struct GfxCommandBuffer<'a> {
    device: &'a GfxDevice,
    handle: vk::CommandBuffer,
}

// basic 命令
impl<'a> GfxCommandBuffer<'a> {
    #[inline]
    pub fn new(device: &'a GfxDevice, handle: vk::CommandBuffer) -> Self {
        Self { device, handle }
    }

    #[inline]
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    #[inline]
    pub fn device(&self) -> &GfxDevice {
        self.device
    }

    /// 开始录制 command
    #[inline]
    pub fn begin(&self, usage_flag: vk::CommandBufferUsageFlags) {
        unsafe {
            self.device
                .begin_command_buffer(self.handle, &vk::CommandBufferBeginInfo::default().flags(usage_flag))
                .unwrap();
        }
    }

    /// 结束录制 command
    #[inline]
    pub fn end(&self) {
        unsafe { self.device.end_command_buffer(self.handle).unwrap() }
    }

    #[inline]
    pub fn begin_label(&self, name: &str, color: glam::Vec4) {
        self.device.cmd_begin_label(self.handle, name, color);
    }

    #[inline]
    pub fn end_label(&self) {
        self.device.cmd_end_label(self.handle);
    }
}

// 同步命令
impl GfxCommandBuffer<'_> {
    /// 一个 pass 的所有 barrier 合并为一次 `vkCmdPipelineBarrier2` 调用
    pub fn pipeline_barrier2(&self, image_barriers: &[GfxImageBarrier], buffer_barriers: &[GfxBufferBarrier]) {
        if image_barriers.is_empty() && buffer_barriers.is_empty() {
            return;
        }

        let image_barriers = image_barriers.iter().map(|b| b.inner()).collect_vec();
        let buffer_barriers = buffer_barriers.iter().map(|b| b.inner()).collect_vec();
        let dependency_info = vk::DependencyInfo::default()
            .image_memory_barriers(&image_barriers)
            .buffer_memory_barriers(&buffer_barriers);
        unsafe {
            self.device.cmd_pipeline_barrier2(self.handle, &dependency_info);
        }
    }
}

// 渲染与绑定命令
impl GfxCommandBuffer<'_> {
    #[inline]
    pub fn begin_rendering(&self, rendering_info: &vk::RenderingInfo) {
        unsafe {
            self.device.cmd_begin_rendering(self.handle, rendering_info);
        }
    }

    #[inline]
    pub fn end_rendering(&self) {
        unsafe {
            self.device.cmd_end_rendering(self.handle);
        }
    }

    #[inline]
    pub fn bind_graphics_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(self.handle, vk::PipelineBindPoint::GRAPHICS, pipeline);
        }
    }

    #[inline]
    pub fn bind_compute_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(self.handle, vk::PipelineBindPoint::COMPUTE, pipeline);
        }
    }

    #[inline]
    pub fn bind_descriptor_sets(
        &self,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(self.handle, bind_point, layout, first_set, sets, &[]);
        }
    }

    #[inline]
    pub fn push_constants(&self, layout: vk::PipelineLayout, stages: vk::ShaderStageFlags, offset: u32, data: &[u8]) {
        unsafe {
            self.device.cmd_push_constants(self.handle, layout, stages, offset, data);
        }
    }

    #[inline]
    pub fn set_viewport(&self, viewport: vk::Viewport) {
        unsafe {
            self.device.cmd_set_viewport(self.handle, 0, std::slice::from_ref(&viewport));
        }
    }

    #[inline]
    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        unsafe {
            self.device.cmd_set_scissor(self.handle, 0, std::slice::from_ref(&scissor));
        }
    }

    #[inline]
    pub fn bind_vertex_buffers(&self, first_binding: u32, buffers: &[vk::Buffer], offsets: &[vk::DeviceSize]) {
        unsafe {
            self.device.cmd_bind_vertex_buffers(self.handle, first_binding, buffers, offsets);
        }
    }

    #[inline]
    pub fn bind_index_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, index_type: vk::IndexType) {
        unsafe {
            self.device.cmd_bind_index_buffer(self.handle, buffer, offset, index_type);
        }
    }
}

// action 命令
impl GfxCommandBuffer<'_> {
    #[inline]
    pub fn dispatch(&self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        unsafe {
            self.device.cmd_dispatch(self.handle, group_count_x, group_count_y, group_count_z);
        }
    }

    #[inline]
    pub fn fill_buffer(&self, buffer: vk::Buffer, offset: vk::DeviceSize, size: vk::DeviceSize, data: u32) {
        unsafe {
            self.device.cmd_fill_buffer(self.handle, buffer, offset, size, data);
        }
    }

    #[inline]
    pub fn draw(&self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw(self.handle, vertex_count, instance_count, first_vertex, first_instance);
        }
    }

    #[inline]
    pub fn draw_indexed(
        &self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.handle,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            );
        }
    }

    #[inline]
    pub fn draw_indexed_indirect_count(
        &self,
        indirect_buffer: vk::Buffer,
        indirect_offset: vk::DeviceSize,
        count_buffer: vk::Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    ) {
        self.device.cmd_draw_indexed_indirect_count(
            self.handle,
            indirect_buffer,
            indirect_offset,
            count_buffer,
            count_offset,
            max_draw_count,
            stride,
        );
    }
}
