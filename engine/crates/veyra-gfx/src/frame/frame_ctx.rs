//! 帧推进与呈现上下文
//!
//! 对应外部呈现层：fence 等待、swapchain acquire/present、
//! per-slot 的命令缓冲与删除队列、transient 资源池的 slot 翻转。

use std::cell::{Cell, RefCell, RefMut};
use std::fmt::Display;
use std::ops::Deref;
use std::rc::Rc;

use ash::vk;
use vk_mem::Alloc;

use crate::commands::sync::{GfxFence, GfxSemaphore};
use crate::foundation::device::GfxDevice;
use crate::frame::FIF_COUNT;
use crate::frame::deletion_queue::DeletionQueue;
use crate::frame::transient_pool::{
    TransientBuffer, TransientBufferKey, TransientImage, TransientImageKey, TransientPool,
};

/// 帧标签（A/B）
///
/// 表示当前处于 Frames in Flight 的哪一帧。
/// 通过 `Deref` 转换为索引 0/1。
#[derive(Debug, Clone, Copy)]
pub enum FrameLabel {
    A,
    B,
}
impl Deref for FrameLabel {
    type Target = usize;
    #[inline]
    fn deref(&self) -> &Self::Target {
        match self {
            Self::A => &Self::INDEX[0],
            Self::B => &Self::INDEX[1],
        }
    }
}
impl Display for FrameLabel {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}
impl FrameLabel {
    const INDEX: [usize; 2] = [0, 1];

    #[inline]
    pub fn from_usize(idx: usize) -> Self {
        match idx {
            0 => Self::A,
            1 => Self::B,
            _ => panic!("Invalid frame index: {idx}"),
        }
    }
}

/// 由外部引导层创建并移交的呈现目标
///
/// swapchain 与 depth image 的销毁仍由引导层负责，
/// 这里只持有 handle 并跟踪 layout。
pub struct GfxPresentTargets {
    pub swapchain: vk::SwapchainKHR,
    pub color_format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,

    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub depth_format: vk::Format,
}

/// 附件信息快照
///
/// layout cell 由 frame context 持有，graph 对 layout 的修改对呈现层可见。
#[derive(Clone)]
pub struct GfxAttachmentInfo {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub layout: Rc<Cell<vk::ImageLayout>>,
}

/// 帧呈现上下文
///
/// 单线程录制模型：帧串行化由 ring slot 提供，内部可变性用 Cell/RefCell 表达，无锁。
/// 唯一的阻塞点：begin_frame 的 slot fence 等待，以及 shutdown/rebuild 的 wait idle。
pub struct GfxFrameContext {
    device: GfxDevice,

    targets: RefCell<GfxPresentTargets>,
    backbuffer_layouts: RefCell<Vec<Rc<Cell<vk::ImageLayout>>>>,
    depth_layout: Rc<Cell<vk::ImageLayout>>,

    cmd_pool: vk::CommandPool,
    cmd_buffers: [vk::CommandBuffer; FIF_COUNT],

    image_available: [GfxSemaphore; FIF_COUNT],
    render_finished: [GfxSemaphore; FIF_COUNT],
    in_flight: [GfxFence; FIF_COUNT],

    frame_deletion: [RefCell<DeletionQueue>; FIF_COUNT],
    device_deletion: RefCell<DeletionQueue>,

    image_pool: RefCell<TransientPool<TransientImageKey, TransientImage>>,
    buffer_pool: RefCell<TransientPool<TransientBufferKey, TransientBuffer>>,

    frame_index: Cell<usize>,
    acquired_image: Cell<usize>,
    rebuild_requested: Cell<bool>,
    swapchain_gen: Cell<u64>,
}

// 创建与销毁
impl GfxFrameContext {
    pub fn new(device: GfxDevice, targets: GfxPresentTargets) -> Self {
        let cmd_pool = unsafe {
            device
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::default()
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                        .queue_family_index(device.graphics_family()),
                    None,
                )
                .unwrap()
        };
        device.set_object_debug_name(cmd_pool, "FrameContext::cmd-pool");

        let cmd_buffers: Vec<_> = unsafe {
            device
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::default()
                        .command_pool(cmd_pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(FIF_COUNT as u32),
                )
                .unwrap()
        };
        for (idx, cmd) in cmd_buffers.iter().enumerate() {
            device.set_object_debug_name(*cmd, format!("FrameContext::cmd-{}", FrameLabel::from_usize(idx)));
        }

        let image_available = std::array::from_fn(|idx| {
            GfxSemaphore::new(&device, &format!("image-available-{}", FrameLabel::from_usize(idx)))
        });
        let render_finished = std::array::from_fn(|idx| {
            GfxSemaphore::new(&device, &format!("render-finished-{}", FrameLabel::from_usize(idx)))
        });
        let in_flight = std::array::from_fn(|idx| {
            GfxFence::new(&device, true, &format!("in-flight-{}", FrameLabel::from_usize(idx)))
        });

        let backbuffer_layouts = targets.images.iter().map(|_| Rc::new(Cell::new(vk::ImageLayout::UNDEFINED))).collect();

        Self {
            device,
            targets: RefCell::new(targets),
            backbuffer_layouts: RefCell::new(backbuffer_layouts),
            depth_layout: Rc::new(Cell::new(vk::ImageLayout::UNDEFINED)),
            cmd_pool,
            cmd_buffers: cmd_buffers.try_into().unwrap(),
            image_available,
            render_finished,
            in_flight,
            frame_deletion: std::array::from_fn(|_| RefCell::new(DeletionQueue::new())),
            device_deletion: RefCell::new(DeletionQueue::new()),
            image_pool: RefCell::new(TransientPool::new()),
            buffer_pool: RefCell::new(TransientPool::new()),
            frame_index: Cell::new(0),
            acquired_image: Cell::new(0),
            rebuild_requested: Cell::new(false),
            swapchain_gen: Cell::new(0),
        }
    }

    /// 等待 device idle、清空所有队列与资源池后，把 device 交还给引导层
    pub fn destroy(self) -> GfxDevice {
        let Self {
            device,
            cmd_pool,
            image_available,
            render_finished,
            in_flight,
            frame_deletion,
            device_deletion,
            image_pool,
            buffer_pool,
            ..
        } = self;

        device.wait_idle();

        for queue in frame_deletion {
            queue.into_inner().flush(&device);
        }
        device_deletion.into_inner().flush(&device);

        for (_, img) in image_pool.into_inner().drain() {
            Self::destroy_transient_image(&device, img);
        }
        for (_, buf) in buffer_pool.into_inner().drain() {
            Self::destroy_transient_buffer(&device, buf);
        }

        for sem in image_available {
            sem.destroy(&device);
        }
        for sem in render_finished {
            sem.destroy(&device);
        }
        for fence in in_flight {
            fence.destroy(&device);
        }
        unsafe {
            device.destroy_command_pool(cmd_pool, None);
        }

        device
    }
}

// 帧推进
impl GfxFrameContext {
    /// 开始一帧
    ///
    /// None 表示本帧无法渲染（rebuild pending 或 swapchain out of date），
    /// 调用方应放弃本帧并在下一帧前重建 swapchain。
    pub fn begin_frame(&self) -> Option<vk::CommandBuffer> {
        let _span = tracy_client::span!("GfxFrameContext::begin_frame");

        if self.rebuild_requested.get() {
            return None;
        }

        let fi = self.frame_index.get();
        self.in_flight[fi].wait(&self.device);

        // fence 已保证 slot fi 上一次提交的 GPU 工作全部完成，
        // 该 slot 的 in-flight 资源可以安全回收
        self.image_pool.borrow_mut().begin_slot(fi);
        self.buffer_pool.borrow_mut().begin_slot(fi);
        self.frame_deletion[fi].borrow_mut().flush(&self.device);

        self.in_flight[fi].reset(&self.device);

        let acquire_result = unsafe {
            self.device.swapchain_device().acquire_next_image(
                self.targets.borrow().swapchain,
                u64::MAX,
                self.image_available[fi].handle(),
                vk::Fence::null(),
            )
        };
        match acquire_result {
            Ok((image_index, suboptimal)) => {
                if suboptimal {
                    self.rebuild_requested.set(true);
                }
                self.acquired_image.set(image_index as usize);
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::ERROR_SURFACE_LOST_KHR) => {
                self.rebuild_requested.set(true);
                return None;
            }
            Err(e) => panic!("vkAcquireNextImageKHR failed: {e:?}"),
        }

        let cmd = self.cmd_buffers[fi];
        unsafe {
            self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty()).unwrap();
            self.device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .unwrap();
        }
        Some(cmd)
    }

    /// 结束一帧：提交命令并触发呈现，推进 ring index
    pub fn end_frame(&self) {
        let _span = tracy_client::span!("GfxFrameContext::end_frame");

        let fi = self.frame_index.get();
        let cmd = self.cmd_buffers[fi];
        unsafe {
            self.device.end_command_buffer(cmd).unwrap();
        }

        let wait_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.image_available[fi].handle())
            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT)];
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(self.render_finished[fi].handle())
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&cmd_infos)
            .signal_semaphore_infos(&signal_infos);
        unsafe {
            self.device
                .queue_submit2(self.device.graphics_queue(), &[submit_info], self.in_flight[fi].handle())
                .unwrap();
        }

        let targets = self.targets.borrow();
        let wait_semaphores = [self.render_finished[fi].handle()];
        let swapchains = [targets.swapchain];
        let image_indices = [self.acquired_image.get() as u32];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let present_result =
            unsafe { self.device.swapchain_device().queue_present(self.device.graphics_queue(), &present_info) };
        match present_result {
            Ok(suboptimal) => {
                if suboptimal {
                    self.rebuild_requested.set(true);
                }
            }
            Err(
                vk::Result::ERROR_OUT_OF_DATE_KHR | vk::Result::SUBOPTIMAL_KHR | vk::Result::ERROR_SURFACE_LOST_KHR,
            ) => {
                self.rebuild_requested.set(true);
            }
            Err(e) => panic!("vkQueuePresentKHR failed: {e:?}"),
        }

        self.frame_index.set((fi + 1) % FIF_COUNT);
    }
}

// transient 资源池
impl GfxFrameContext {
    /// 池命中返回复用的条目，否则新建（分配失败为致命错误）
    pub fn acquire_transient_image(&self, debug_name: &str, key: TransientImageKey) -> TransientImage {
        if let Some(img) = self.image_pool.borrow_mut().acquire(key) {
            self.device.set_object_debug_name(img.image, debug_name);
            self.device.set_object_debug_name(img.view, debug_name);
            return img;
        }

        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(key.format)
            .extent(vk::Extent3D { width: key.extent.width, height: key.extent.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(key.usage)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };
        let (image, allocation) = unsafe {
            self.device
                .allocator()
                .create_image(&image_ci, &alloc_ci)
                .unwrap_or_else(|e| panic!("transient image allocation failed for {debug_name:?}: {e:?}"))
        };

        let view_ci = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(key.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(key.aspect)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );
        let view = unsafe { self.device.create_image_view(&view_ci, None).unwrap() };

        self.device.set_object_debug_name(image, debug_name);
        self.device.set_object_debug_name(view, debug_name);
        TransientImage { image, view, allocation }
    }

    pub fn retire_transient_image(&self, key: TransientImageKey, img: TransientImage) {
        self.image_pool.borrow_mut().retire(self.frame_index.get(), key, img);
    }

    pub fn acquire_transient_buffer(&self, debug_name: &str, key: TransientBufferKey) -> TransientBuffer {
        if let Some(buf) = self.buffer_pool.borrow_mut().acquire(key) {
            self.device.set_object_debug_name(buf.buffer, debug_name);
            return buf;
        }

        let buffer_ci = vk::BufferCreateInfo::default().size(key.size).usage(key.usage);
        let alloc_ci = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            flags: if key.host_access {
                vk_mem::AllocationCreateFlags::HOST_ACCESS_RANDOM
            } else {
                vk_mem::AllocationCreateFlags::empty()
            },
            ..Default::default()
        };
        let (buffer, allocation) = unsafe {
            self.device
                .allocator()
                .create_buffer(&buffer_ci, &alloc_ci)
                .unwrap_or_else(|e| panic!("transient buffer allocation failed for {debug_name:?}: {e:?}"))
        };

        self.device.set_object_debug_name(buffer, debug_name);
        TransientBuffer { buffer, allocation }
    }

    pub fn retire_transient_buffer(&self, key: TransientBufferKey, buf: TransientBuffer) {
        self.buffer_pool.borrow_mut().retire(self.frame_index.get(), key, buf);
    }

    fn destroy_transient_image(device: &GfxDevice, img: TransientImage) {
        let TransientImage { image, view, mut allocation } = img;
        unsafe {
            device.destroy_image_view(view, None);
            device.allocator().destroy_image(image, &mut allocation);
        }
    }

    fn destroy_transient_buffer(device: &GfxDevice, buf: TransientBuffer) {
        let TransientBuffer { buffer, mut allocation } = buf;
        unsafe {
            device.allocator().destroy_buffer(buffer, &mut allocation);
        }
    }
}

// 删除队列
impl GfxFrameContext {
    /// 当前 slot 的帧删除队列，入队的闭包在该 slot 下一次复用前执行
    #[inline]
    pub fn frame_deletion_queue(&self) -> RefMut<'_, DeletionQueue> {
        self.frame_deletion[self.frame_index.get()].borrow_mut()
    }

    /// device 生命周期的删除队列，shutdown 时执行
    #[inline]
    pub fn device_deletion_queue(&self) -> RefMut<'_, DeletionQueue> {
        self.device_deletion.borrow_mut()
    }
}

// swapchain rebuild
impl GfxFrameContext {
    #[inline]
    pub fn request_swapchain_rebuild(&self) {
        self.rebuild_requested.set(true);
    }

    #[inline]
    pub fn swapchain_rebuild_requested(&self) -> bool {
        self.rebuild_requested.get()
    }

    #[inline]
    pub fn swapchain_generation(&self) -> u64 {
        self.swapchain_gen.get()
    }

    /// 安装由外部引导层重建好的呈现目标
    ///
    /// 所有 layout 跟踪回到 UNDEFINED，generation 递增以触发 pipeline 重建。
    pub fn rebuild_present_targets(&self, targets: GfxPresentTargets) {
        self.device.wait_idle();

        *self.backbuffer_layouts.borrow_mut() =
            targets.images.iter().map(|_| Rc::new(Cell::new(vk::ImageLayout::UNDEFINED))).collect();
        self.depth_layout.set(vk::ImageLayout::UNDEFINED);
        *self.targets.borrow_mut() = targets;

        self.rebuild_requested.set(false);
        self.swapchain_gen.set(self.swapchain_gen.get() + 1);
    }
}

// getters
impl GfxFrameContext {
    #[inline]
    pub fn device(&self) -> &GfxDevice {
        &self.device
    }

    #[inline]
    pub fn frame_index(&self) -> usize {
        self.frame_index.get()
    }

    #[inline]
    pub fn frame_label(&self) -> FrameLabel {
        FrameLabel::from_usize(self.frame_index.get())
    }

    #[inline]
    pub fn swapchain_extent(&self) -> vk::Extent2D {
        self.targets.borrow().extent
    }

    #[inline]
    pub fn color_format(&self) -> vk::Format {
        self.targets.borrow().color_format
    }

    #[inline]
    pub fn depth_format(&self) -> vk::Format {
        self.targets.borrow().depth_format
    }

    /// 当前已 acquire 的 backbuffer
    pub fn current_backbuffer(&self) -> GfxAttachmentInfo {
        let targets = self.targets.borrow();
        let image_index = self.acquired_image.get();
        GfxAttachmentInfo {
            image: targets.images[image_index],
            view: targets.views[image_index],
            format: targets.color_format,
            extent: targets.extent,
            layout: self.backbuffer_layouts.borrow()[image_index].clone(),
        }
    }

    pub fn depth_target(&self) -> GfxAttachmentInfo {
        let targets = self.targets.borrow();
        GfxAttachmentInfo {
            image: targets.depth_image,
            view: targets.depth_view,
            format: targets.depth_format,
            extent: targets.extent,
            layout: self.depth_layout.clone(),
        }
    }
}
