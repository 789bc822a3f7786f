//! 帧作用域的资源表与 hazard 跟踪
//!
//! 每个逻辑资源一帧内只有一条存活记录，状态随 pass 的引用单调更新。
//! barrier 判定规则：
//! - image：layout 变化，或新旧 access 任一含写位，需要 barrier；
//! - buffer：首次访问只记录状态不出 barrier；之后写位介入才需要 barrier，
//!   read-after-read 不出任何东西。
//! 判定后无条件把跟踪状态更新为 pending 状态（单线程录制下安全）。

use std::cell::Cell;
use std::rc::Rc;

use ash::vk;
use veyra_gfx::commands::barrier::{GfxBufferBarrier, GfxImageBarrier};

use crate::render_graph::handle::{RgBufferHandle, RgImageHandle};
use crate::render_graph::pass::RgPassNode;
use crate::render_graph::usage::{BUFFER_WRITE_ACCESS, IMAGE_WRITE_ACCESS, buffer_use_state, image_use_state};

/// 图像 layout 的存放位置
///
/// 外部导入的资源（swapchain image / depth）layout 由呈现层持有，
/// graph 对它的修改必须对呈现层可见。
pub enum RgLayoutSlot {
    Owned(Cell<vk::ImageLayout>),
    External(Rc<Cell<vk::ImageLayout>>),
}

impl RgLayoutSlot {
    #[inline]
    pub fn get(&self) -> vk::ImageLayout {
        match self {
            Self::Owned(cell) => cell.get(),
            Self::External(cell) => cell.get(),
        }
    }

    #[inline]
    pub fn set(&self, layout: vk::ImageLayout) {
        match self {
            Self::Owned(cell) => cell.set(layout),
            Self::External(cell) => cell.set(layout),
        }
    }
}

/// 帧作用域的图像记录
pub struct RgImageResource {
    pub name: String,
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub aspect: vk::ImageAspectFlags,

    pub(crate) layout: RgLayoutSlot,
    pub(crate) last_stage: vk::PipelineStageFlags2,
    pub(crate) last_access: vk::AccessFlags2,

    /// graph 拥有（帧末入删除队列）还是外部导入
    pub owned: bool,
    /// 帧末回池还是销毁
    pub pooled: bool,
}

impl RgImageResource {
    /// 外部导入的资源，layout cell 由呈现层共享
    pub fn imported(
        name: impl Into<String>,
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
        layout: Rc<Cell<vk::ImageLayout>>,
    ) -> Self {
        Self {
            name: name.into(),
            image,
            view,
            format,
            extent,
            aspect,
            layout: RgLayoutSlot::External(layout),
            last_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_access: vk::AccessFlags2::NONE,
            owned: false,
            pooled: false,
        }
    }

    /// 从 transient 池借出的资源，layout 从 UNDEFINED 开始
    pub fn pooled(
        name: impl Into<String>,
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
        aspect: vk::ImageAspectFlags,
    ) -> Self {
        Self {
            name: name.into(),
            image,
            view,
            format,
            extent,
            aspect,
            layout: RgLayoutSlot::Owned(Cell::new(vk::ImageLayout::UNDEFINED)),
            last_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_access: vk::AccessFlags2::NONE,
            owned: false,
            pooled: true,
        }
    }

    #[inline]
    pub fn current_layout(&self) -> vk::ImageLayout {
        self.layout.get()
    }
}

/// 帧作用域的缓冲区记录
pub struct RgBufferResource {
    pub buffer: vk::Buffer,

    pub(crate) last_stage: vk::PipelineStageFlags2,
    pub(crate) last_access: vk::AccessFlags2,

    pub owned: bool,
    pub pooled: bool,
}

impl RgBufferResource {
    pub fn imported(buffer: vk::Buffer) -> Self {
        Self {
            buffer,
            last_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_access: vk::AccessFlags2::NONE,
            owned: false,
            pooled: false,
        }
    }

    pub fn pooled(buffer: vk::Buffer) -> Self {
        Self {
            buffer,
            last_stage: vk::PipelineStageFlags2::TOP_OF_PIPE,
            last_access: vk::AccessFlags2::NONE,
            owned: false,
            pooled: true,
        }
    }
}

/// 一个 pass 的 barrier 批次，对应一次 `vkCmdPipelineBarrier2`
#[derive(Default)]
pub struct RgBarrierBatch {
    pub image_barriers: Vec<GfxImageBarrier>,
    pub buffer_barriers: Vec<GfxBufferBarrier>,
}

impl RgBarrierBatch {
    pub fn clear(&mut self) {
        self.image_barriers.clear();
        self.buffer_barriers.clear();
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.image_barriers.is_empty() && self.buffer_barriers.is_empty()
    }
}

/// 帧作用域的资源注册表
///
/// 越界句柄的访问被跳过并计数，不中断当前帧。
pub struct RgResourceRegistry {
    images: Vec<RgImageResource>,
    buffers: Vec<RgBufferResource>,

    skipped_accesses: u32,
}

// 创建与注册
impl RgResourceRegistry {
    pub fn new() -> Self {
        Self {
            images: Vec::with_capacity(8),
            buffers: Vec::with_capacity(32),
            skipped_accesses: 0,
        }
    }

    pub fn register_image(&mut self, resource: RgImageResource) -> RgImageHandle {
        let id = self.images.len() as u32;
        self.images.push(resource);
        RgImageHandle::new(id)
    }

    pub fn register_buffer(&mut self, resource: RgBufferResource) -> RgBufferHandle {
        let id = self.buffers.len() as u32;
        self.buffers.push(resource);
        RgBufferHandle::new(id)
    }
}

impl Default for RgResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// getters
impl RgResourceRegistry {
    #[inline]
    pub fn image(&self, id: u32) -> Option<&RgImageResource> {
        self.images.get(id as usize)
    }

    #[inline]
    pub fn buffer(&self, id: u32) -> Option<&RgBufferResource> {
        self.buffers.get(id as usize)
    }

    #[inline]
    pub fn images(&self) -> &[RgImageResource] {
        &self.images
    }

    #[inline]
    pub fn buffers(&self) -> &[RgBufferResource] {
        &self.buffers
    }

    /// 本帧因句柄越界而被跳过的访问数（诊断用，不致命）
    #[inline]
    pub fn skipped_access_count(&self) -> u32 {
        self.skipped_accesses
    }
}

// hazard 跟踪
impl RgResourceRegistry {
    /// 计算一个 pass 需要的全部 barrier，追加到批次中
    ///
    /// 无论是否出 barrier，资源的跟踪状态都会立即更新为本次访问的状态。
    pub fn collect_pass_barriers(&mut self, pass: &RgPassNode<'_>, out: &mut RgBarrierBatch) {
        for access in &pass.images {
            let Some(res) = self.images.get_mut(access.id as usize) else {
                self.skipped_accesses += 1;
                log::debug!("pass {:?}: image access out of range (id = {}), skipped", pass.name, access.id);
                continue;
            };

            let required = image_use_state(access.usage, access.write);
            let old_layout = res.layout.get();

            let needs_memory_barrier = (res.last_access | required.access).intersects(IMAGE_WRITE_ACCESS);
            let same_layout = old_layout == required.layout;

            if same_layout && !needs_memory_barrier {
                res.last_stage = required.stage;
                res.last_access = required.access;
                res.aspect = required.aspect;
                continue;
            }

            out.image_barriers.push(
                GfxImageBarrier::new()
                    .image(res.image)
                    .layout_transfer(old_layout, required.layout)
                    .src_mask(res.last_stage, res.last_access)
                    .dst_mask(required.stage, required.access)
                    .image_aspect_flag(required.aspect),
            );

            res.layout.set(required.layout);
            res.last_stage = required.stage;
            res.last_access = required.access;
            res.aspect = required.aspect;
        }

        for access in &pass.buffers {
            let Some(res) = self.buffers.get_mut(access.id as usize) else {
                self.skipped_accesses += 1;
                log::debug!("pass {:?}: buffer access out of range (id = {}), skipped", pass.name, access.id);
                continue;
            };

            let required = buffer_use_state(access.usage, access.write);

            // 首次访问没有可同步的前驱，只记录状态
            if res.last_access == vk::AccessFlags2::NONE {
                res.last_stage = required.stage;
                res.last_access = required.access;
                continue;
            }

            let needs_memory_barrier = (res.last_access | required.access).intersects(BUFFER_WRITE_ACCESS);
            if !needs_memory_barrier && res.last_stage == required.stage && res.last_access == required.access {
                continue;
            }

            out.buffer_barriers.push(
                GfxBufferBarrier::new()
                    .buffer(res.buffer, 0, vk::WHOLE_SIZE)
                    .src_mask(res.last_stage, res.last_access)
                    .dst_mask(required.stage, required.access),
            );

            res.last_stage = required.stage;
            res.last_access = required.access;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_graph::pass::{RgBufferAccess, RgImageAccess, RgPassKind};
    use crate::render_graph::usage::{RgBufferUse, RgImageUse};

    fn image_pass(accesses: Vec<RgImageAccess>) -> RgPassNode<'static> {
        let mut pass = RgPassNode::new("test".into(), RgPassKind::Graphics);
        pass.images = accesses;
        pass
    }

    fn buffer_pass(accesses: Vec<RgBufferAccess>) -> RgPassNode<'static> {
        let mut pass = RgPassNode::new("test".into(), RgPassKind::Compute);
        pass.buffers = accesses;
        pass
    }

    fn test_image() -> RgImageResource {
        RgImageResource::pooled(
            "img",
            vk::Image::null(),
            vk::ImageView::null(),
            vk::Format::R8G8B8A8_UNORM,
            vk::Extent2D { width: 4, height: 4 },
            vk::ImageAspectFlags::COLOR,
        )
    }

    #[test]
    fn write_then_read_same_layout_emits_barrier() {
        veyra_crate_tools::init_log::try_init_log();

        let mut registry = RgResourceRegistry::new();
        let h = registry.register_image(test_image());
        let mut batch = RgBarrierBatch::default();

        // P1 写 color attachment
        let p1 = image_pass(vec![RgImageAccess { id: h.id(), usage: RgImageUse::ColorAttachment, write: true }]);
        registry.collect_pass_barriers(&p1, &mut batch);
        batch.clear();

        // P2 再以同 layout 读：前一次 access 含写位，仍需 barrier
        let p2 = image_pass(vec![RgImageAccess { id: h.id(), usage: RgImageUse::ColorAttachment, write: false }]);
        registry.collect_pass_barriers(&p2, &mut batch);
        assert_eq!(batch.image_barriers.len(), 1);

        let b = batch.image_barriers[0].inner();
        assert_eq!(b.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(b.new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(b.src_access_mask, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
    }

    #[test]
    fn read_after_read_same_layout_emits_nothing() {
        let mut registry = RgResourceRegistry::new();
        let h = registry.register_image(test_image());
        let mut batch = RgBarrierBatch::default();

        // 先把 layout 转换到 SHADER_READ_ONLY（UNDEFINED → 需要一次 barrier）
        let p1 = image_pass(vec![RgImageAccess { id: h.id(), usage: RgImageUse::Sampled, write: false }]);
        registry.collect_pass_barriers(&p1, &mut batch);
        assert_eq!(batch.image_barriers.len(), 1);
        batch.clear();

        // 再次只读、layout 不变：无 barrier，但状态已更新
        let p2 = image_pass(vec![RgImageAccess { id: h.id(), usage: RgImageUse::Sampled, write: false }]);
        registry.collect_pass_barriers(&p2, &mut batch);
        assert!(batch.is_empty());
    }

    #[test]
    fn layout_change_emits_barrier_even_without_writes() {
        let mut registry = RgResourceRegistry::new();
        let h = registry.register_image(test_image());
        let mut batch = RgBarrierBatch::default();

        let p1 = image_pass(vec![RgImageAccess { id: h.id(), usage: RgImageUse::Sampled, write: false }]);
        registry.collect_pass_barriers(&p1, &mut batch);
        batch.clear();

        let p2 = image_pass(vec![RgImageAccess { id: h.id(), usage: RgImageUse::Present, write: false }]);
        registry.collect_pass_barriers(&p2, &mut batch);
        assert_eq!(batch.image_barriers.len(), 1);
        let b = batch.image_barriers[0].inner();
        assert_eq!(b.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(b.new_layout, vk::ImageLayout::PRESENT_SRC_KHR);
    }

    #[test]
    fn buffer_first_touch_records_state_without_barrier() {
        let mut registry = RgResourceRegistry::new();
        let h = registry.register_buffer(RgBufferResource::imported(vk::Buffer::null()));
        let mut batch = RgBarrierBatch::default();

        let p1 = buffer_pass(vec![RgBufferAccess { id: h.id(), usage: RgBufferUse::Storage, write: true }]);
        registry.collect_pass_barriers(&p1, &mut batch);
        assert!(batch.is_empty());

        // 状态已被记录：下一次读取要同步上一次的写
        let p2 = buffer_pass(vec![RgBufferAccess { id: h.id(), usage: RgBufferUse::Indirect, write: false }]);
        registry.collect_pass_barriers(&p2, &mut batch);
        assert_eq!(batch.buffer_barriers.len(), 1);

        let b = batch.buffer_barriers[0].inner();
        assert!(b.src_access_mask.contains(vk::AccessFlags2::SHADER_WRITE));
        assert_eq!(b.dst_access_mask, vk::AccessFlags2::INDIRECT_COMMAND_READ);
    }

    #[test]
    fn buffer_read_after_read_emits_nothing() {
        let mut registry = RgResourceRegistry::new();
        let h = registry.register_buffer(RgBufferResource::imported(vk::Buffer::null()));
        let mut batch = RgBarrierBatch::default();

        let p1 = buffer_pass(vec![RgBufferAccess { id: h.id(), usage: RgBufferUse::Storage, write: false }]);
        registry.collect_pass_barriers(&p1, &mut batch);
        let p2 = buffer_pass(vec![RgBufferAccess { id: h.id(), usage: RgBufferUse::Storage, write: false }]);
        registry.collect_pass_barriers(&p2, &mut batch);

        assert!(batch.is_empty());
    }

    #[test]
    fn out_of_range_access_is_skipped_and_counted() {
        veyra_crate_tools::init_log::try_init_log();

        let mut registry = RgResourceRegistry::new();
        let _ = registry.register_image(test_image());
        let mut batch = RgBarrierBatch::default();

        // 上一帧遗留的句柄在本帧的表中不存在
        let stale = image_pass(vec![RgImageAccess { id: 5, usage: RgImageUse::Sampled, write: false }]);
        registry.collect_pass_barriers(&stale, &mut batch);

        assert!(batch.is_empty());
        assert_eq!(registry.skipped_access_count(), 1);
        // 表中已有的记录未被触碰
        assert_eq!(registry.image(0).unwrap().current_layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn barriers_for_one_pass_are_batched() {
        let mut registry = RgResourceRegistry::new();
        let h1 = registry.register_image(test_image());
        let h2 = registry.register_image(test_image());
        let hb = registry.register_buffer(RgBufferResource::imported(vk::Buffer::null()));
        let mut batch = RgBarrierBatch::default();

        let warmup = buffer_pass(vec![RgBufferAccess { id: hb.id(), usage: RgBufferUse::Storage, write: true }]);
        registry.collect_pass_barriers(&warmup, &mut batch);
        batch.clear();

        let mut pass = RgPassNode::new("multi".into(), RgPassKind::Graphics);
        pass.images = vec![
            RgImageAccess { id: h1.id(), usage: RgImageUse::ColorAttachment, write: true },
            RgImageAccess { id: h2.id(), usage: RgImageUse::DepthAttachment, write: true },
        ];
        pass.buffers = vec![RgBufferAccess { id: hb.id(), usage: RgBufferUse::Indirect, write: false }];
        registry.collect_pass_barriers(&pass, &mut batch);

        assert_eq!(batch.image_barriers.len(), 2);
        assert_eq!(batch.buffer_barriers.len(), 1);
    }
}
