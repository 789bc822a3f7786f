//! 帧生命周期编排
//!
//! 每帧一个 `RenderGraph` 实例，借用 frame context；帧末随 `end()` 被消耗，
//! 上一帧的句柄在结构上无法再使用（资源表随实例整体废弃）。

use ash::vk;
use itertools::Itertools;
use veyra_gfx::basic::color::LabelColor;
use veyra_gfx::commands::command_buffer::GfxCommandBuffer;
use veyra_gfx::frame::frame_ctx::GfxFrameContext;
use veyra_gfx::frame::transient_pool::{TransientBuffer, TransientBufferKey, TransientImage, TransientImageKey};

use crate::render_graph::handle::{RgBufferHandle, RgImageHandle};
use crate::render_graph::pass::{RgImageAccess, RgPassBuilder, RgPassKind, RgPassNode};
use crate::render_graph::registry::{RgBarrierBatch, RgBufferResource, RgImageResource, RgResourceRegistry};
use crate::render_graph::usage::RgImageUse;

fn default_color_clear() -> vk::ClearValue {
    vk::ClearValue { color: vk::ClearColorValue { float32: [0.05, 0.06, 0.08, 1.0] } }
}

fn default_depth_clear() -> vk::ClearValue {
    vk::ClearValue { depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 } }
}

/// 帧作用域的 render graph
///
/// 生命周期：`begin` → 若干 `add_pass` →（访问声明已全部确定）→ `execute` → `end`。
/// pass 按声明顺序执行，barrier 严格插在相邻 pass 之间。
pub struct RenderGraph<'a> {
    ctx: &'a GfxFrameContext,
    cmd: vk::CommandBuffer,

    registry: RgResourceRegistry,
    passes: Vec<RgPassNode<'a>>,

    retire_images: Vec<(TransientImageKey, TransientImage)>,
    retire_buffers: Vec<(TransientBufferKey, TransientBuffer)>,

    backbuffer: RgImageHandle,
    depth: RgImageHandle,
}

// 帧生命周期
impl<'a> RenderGraph<'a> {
    /// 开始一帧并导入两个常驻外部资源（backbuffer 与 depth）
    ///
    /// None 表示呈现层本帧不可用（resize/minimize），调用方直接放弃本帧。
    pub fn begin(ctx: &'a GfxFrameContext) -> Option<Self> {
        let cmd = ctx.begin_frame()?;

        let mut registry = RgResourceRegistry::new();

        let bb = ctx.current_backbuffer();
        let backbuffer = registry.register_image(RgImageResource::imported(
            "backbuffer",
            bb.image,
            bb.view,
            bb.format,
            bb.extent,
            vk::ImageAspectFlags::COLOR,
            bb.layout,
        ));

        let dt = ctx.depth_target();
        let depth = registry.register_image(RgImageResource::imported(
            "depth",
            dt.image,
            dt.view,
            dt.format,
            dt.extent,
            vk::ImageAspectFlags::DEPTH,
            dt.layout,
        ));

        Some(Self {
            ctx,
            cmd,
            registry,
            passes: Vec::with_capacity(16),
            retire_images: Vec::new(),
            retire_buffers: Vec::new(),
            backbuffer,
            depth,
        })
    }

    /// 追加一个 pass；setup 立即执行，访问列表在任何 barrier 计算之前就已完整
    pub fn add_pass<S, E>(&mut self, name: impl Into<String>, kind: RgPassKind, setup: S, exec: E)
    where
        S: FnOnce(&mut RgPassBuilder),
        E: FnOnce(&GfxCommandBuffer) + 'a,
    {
        let mut builder = RgPassBuilder::new();
        setup(&mut builder);

        let mut pass = RgPassNode::new(name.into(), builder.kind.unwrap_or(kind));
        pass.images = builder.images;
        pass.buffers = builder.buffers;
        pass.color_attachments = builder.color_attachments;
        pass.depth_attachment = builder.depth_attachment;
        pass.exec = Some(Box::new(exec));

        self.passes.push(pass);
    }

    /// 按声明顺序执行所有 pass，每个 pass 前批量提交它的 barrier
    pub fn execute(&mut self) {
        let _span = tracy_client::span!("RenderGraph::execute");

        let cmd = GfxCommandBuffer::new(self.ctx.device(), self.cmd);
        let extent = self.ctx.swapchain_extent();
        let mut batch = RgBarrierBatch::default();

        for pass in &mut self.passes {
            cmd.begin_label(&pass.name, LabelColor::COLOR_PASS);

            batch.clear();
            self.registry.collect_pass_barriers(pass, &mut batch);
            cmd.pipeline_barrier2(&batch.image_barriers, &batch.buffer_barriers);

            let has_attachments = !pass.color_attachments.is_empty() || pass.depth_attachment.is_some();
            if pass.kind == RgPassKind::Graphics && has_attachments {
                let color_attachments = pass
                    .color_attachments
                    .iter()
                    .filter_map(|att| {
                        let res = self.registry.image(att.id)?;
                        let mut info = vk::RenderingAttachmentInfo::default()
                            .image_view(res.view)
                            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                            .load_op(att.load_op)
                            .store_op(att.store_op);
                        if let Some(clear) = att.clear {
                            info = info.clear_value(clear);
                        } else if att.load_op == vk::AttachmentLoadOp::CLEAR {
                            info = info.clear_value(default_color_clear());
                        }
                        Some(info)
                    })
                    .collect_vec();

                let depth_attachment = pass.depth_attachment.as_ref().and_then(|att| {
                    let res = self.registry.image(att.id)?;
                    let mut info = vk::RenderingAttachmentInfo::default()
                        .image_view(res.view)
                        .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                        .load_op(att.load_op)
                        .store_op(att.store_op);
                    if let Some(clear) = att.clear {
                        info = info.clear_value(clear);
                    } else if att.load_op == vk::AttachmentLoadOp::CLEAR {
                        info = info.clear_value(default_depth_clear());
                    }
                    Some(info)
                });

                let mut rendering_info = vk::RenderingInfo::default()
                    .render_area(vk::Rect2D { offset: vk::Offset2D::default(), extent })
                    .layer_count(1)
                    .color_attachments(&color_attachments);
                if let Some(depth_info) = &depth_attachment {
                    rendering_info = rendering_info.depth_attachment(depth_info);
                }

                cmd.begin_rendering(&rendering_info);
                if let Some(exec) = pass.exec.take() {
                    exec(&cmd);
                }
                cmd.end_rendering();
            } else if let Some(exec) = pass.exec.take() {
                exec(&cmd);
            }

            cmd.end_label();
        }
    }

    /// 结束一帧：backbuffer 转换到呈现 layout，回收帧资源，提交并呈现
    pub fn end(mut self) {
        let _span = tracy_client::span!("RenderGraph::end");

        let cmd = GfxCommandBuffer::new(self.ctx.device(), self.cmd);

        // 合成一次 Present 访问作为最终 barrier
        if self.registry.image(self.backbuffer.id()).is_some() {
            let mut present_pass = RgPassNode::new("present-transition".into(), RgPassKind::Graphics);
            present_pass.images =
                vec![RgImageAccess { id: self.backbuffer.id(), usage: RgImageUse::Present, write: false }];

            let mut batch = RgBarrierBatch::default();
            self.registry.collect_pass_barriers(&present_pass, &mut batch);
            cmd.pipeline_barrier2(&batch.image_barriers, &batch.buffer_barriers);
        }

        // graph 拥有的非池化资源延迟销毁（该 slot 的 fence 等待之后执行）
        for res in self.registry.images() {
            if !res.owned {
                continue;
            }
            let (image, view) = (res.image, res.view);
            self.ctx.frame_deletion_queue().push(move |device| unsafe {
                device.destroy_image_view(view, None);
                device.destroy_image(image, None);
            });
        }
        for res in self.registry.buffers() {
            if !res.owned {
                continue;
            }
            let buffer = res.buffer;
            self.ctx.frame_deletion_queue().push(move |device| unsafe {
                device.destroy_buffer(buffer, None);
            });
        }

        // 池化资源进入当前 slot 的 in-flight 列表
        for (key, img) in self.retire_images.drain(..) {
            self.ctx.retire_transient_image(key, img);
        }
        for (key, buf) in self.retire_buffers.drain(..) {
            self.ctx.retire_transient_buffer(key, buf);
        }

        if self.registry.skipped_access_count() > 0 {
            log::debug!("render graph skipped {} out-of-range accesses this frame", self.registry.skipped_access_count());
        }

        self.ctx.end_frame();
    }
}

// 资源注册
impl RenderGraph<'_> {
    /// 从 transient 池借一个 image；帧末自动 retire 回池
    pub fn create_transient_image(
        &mut self,
        name: &str,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> RgImageHandle {
        let key = TransientImageKey { format, extent, usage, aspect };
        let transient = self.ctx.acquire_transient_image(name, key);
        let handle = self.registry.register_image(RgImageResource::pooled(
            name,
            transient.image,
            transient.view,
            format,
            extent,
            aspect,
        ));
        self.retire_images.push((key, transient));
        handle
    }

    /// 从 transient 池借一个 buffer；帧末自动 retire 回池
    pub fn create_transient_buffer(
        &mut self,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        host_access: bool,
    ) -> RgBufferHandle {
        let key = TransientBufferKey { size, usage, host_access };
        let transient = self.ctx.acquire_transient_buffer(name, key);
        let handle = self.registry.register_buffer(RgBufferResource::pooled(transient.buffer));
        self.retire_buffers.push((key, transient));
        handle
    }

    /// 导入外部 buffer，仅在本帧内跟踪其同步状态
    pub fn import_buffer(&mut self, buffer: vk::Buffer) -> RgBufferHandle {
        self.registry.register_buffer(RgBufferResource::imported(buffer))
    }
}

// getters
impl RenderGraph<'_> {
    #[inline]
    pub fn cmd(&self) -> vk::CommandBuffer {
        self.cmd
    }

    #[inline]
    pub fn backbuffer(&self) -> RgImageHandle {
        self.backbuffer
    }

    #[inline]
    pub fn depth(&self) -> RgImageHandle {
        self.depth
    }

    #[inline]
    pub fn registry(&self) -> &RgResourceRegistry {
        &self.registry
    }
}
