//! Pass 节点与构建器
//!
//! Pass 是一段 GPU 工作的声明：资源访问列表、附件绑定，
//! 以及执行时录制命令的一次性回调。

use ash::vk;
use veyra_gfx::commands::command_buffer::GfxCommandBuffer;

use crate::render_graph::handle::{RgBufferHandle, RgImageHandle};
use crate::render_graph::usage::{RgBufferUse, RgImageUse};

/// Pass 类型
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RgPassKind {
    Compute,
    Graphics,
}

/// 一条图像访问声明
#[derive(Clone, Copy, Debug)]
pub struct RgImageAccess {
    pub id: u32,
    pub usage: RgImageUse,
    pub write: bool,
}

/// 一条缓冲区访问声明
#[derive(Clone, Copy, Debug)]
pub struct RgBufferAccess {
    pub id: u32,
    pub usage: RgBufferUse,
    pub write: bool,
}

/// 颜色附件绑定
#[derive(Clone, Copy)]
pub struct RgColorAttachment {
    pub id: u32,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: Option<vk::ClearValue>,
}

/// 深度附件绑定
#[derive(Clone, Copy)]
pub struct RgDepthAttachment {
    pub id: u32,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: Option<vk::ClearValue>,
}

/// Pass 节点
///
/// 声明当帧创建，下一帧 begin 时随 graph 一起销毁。
/// `'a` 是 exec 回调可以借用的外部数据的生命周期。
pub struct RgPassNode<'a> {
    pub name: String,
    pub kind: RgPassKind,

    pub images: Vec<RgImageAccess>,
    pub buffers: Vec<RgBufferAccess>,

    pub color_attachments: Vec<RgColorAttachment>,
    pub depth_attachment: Option<RgDepthAttachment>,

    pub(crate) exec: Option<Box<dyn FnOnce(&GfxCommandBuffer) + 'a>>,
}

impl<'a> RgPassNode<'a> {
    pub(crate) fn new(name: String, kind: RgPassKind) -> Self {
        Self {
            name,
            kind,
            images: Vec::new(),
            buffers: Vec::new(),
            color_attachments: Vec::new(),
            depth_attachment: None,
            exec: None,
        }
    }
}

/// Pass 构建器
///
/// 仅在 pass 的 setup 回调期间有效。声明是幂等的：
/// 相同 (resource, usage) 的重复声明会合并，write 标志取 OR。
/// 这一层没有失败路径，坏句柄在执行阶段作为越界访问被跳过。
#[derive(Default)]
pub struct RgPassBuilder {
    pub(crate) kind: Option<RgPassKind>,
    pub(crate) images: Vec<RgImageAccess>,
    pub(crate) buffers: Vec<RgBufferAccess>,
    pub(crate) color_attachments: Vec<RgColorAttachment>,
    pub(crate) depth_attachment: Option<RgDepthAttachment>,
}

impl RgPassBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn add_image_access(&mut self, id: u32, usage: RgImageUse, write: bool) {
        for access in &mut self.images {
            if access.id == id && access.usage == usage {
                access.write = access.write || write;
                return;
            }
        }
        self.images.push(RgImageAccess { id, usage, write });
    }

    fn add_buffer_access(&mut self, id: u32, usage: RgBufferUse, write: bool) {
        for access in &mut self.buffers {
            if access.id == id && access.usage == usage {
                access.write = access.write || write;
                return;
            }
        }
        self.buffers.push(RgBufferAccess { id, usage, write });
    }

    #[inline]
    pub fn read_image(&mut self, handle: RgImageHandle, usage: RgImageUse) {
        self.add_image_access(handle.id, usage, false);
    }

    #[inline]
    pub fn write_image(&mut self, handle: RgImageHandle, usage: RgImageUse) {
        self.add_image_access(handle.id, usage, true);
    }

    #[inline]
    pub fn read_buffer(&mut self, handle: RgBufferHandle, usage: RgBufferUse) {
        self.add_buffer_access(handle.id, usage, false);
    }

    #[inline]
    pub fn write_buffer(&mut self, handle: RgBufferHandle, usage: RgBufferUse) {
        self.add_buffer_access(handle.id, usage, true);
    }

    /// 绑定颜色附件；隐含 Graphics 类型以及对该图像的 ColorAttachment 写访问
    pub fn color_attachment(
        &mut self,
        handle: RgImageHandle,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear: Option<vk::ClearValue>,
    ) {
        self.kind = Some(RgPassKind::Graphics);
        self.write_image(handle, RgImageUse::ColorAttachment);
        self.color_attachments.push(RgColorAttachment { id: handle.id, load_op, store_op, clear });
    }

    /// 绑定深度附件；隐含 Graphics 类型以及对该图像的 DepthAttachment 写访问
    pub fn depth_attachment(
        &mut self,
        handle: RgImageHandle,
        load_op: vk::AttachmentLoadOp,
        store_op: vk::AttachmentStoreOp,
        clear: Option<vk::ClearValue>,
    ) {
        self.kind = Some(RgPassKind::Graphics);
        self.write_image(handle, RgImageUse::DepthAttachment);
        self.depth_attachment = Some(RgDepthAttachment { id: handle.id, load_op, store_op, clear });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_access_merges_write_flags() {
        let mut builder = RgPassBuilder::new();
        let h = RgImageHandle::new(3);

        builder.read_image(h, RgImageUse::Sampled);
        builder.write_image(h, RgImageUse::Sampled);
        builder.read_image(h, RgImageUse::Sampled);

        assert_eq!(builder.images.len(), 1);
        assert!(builder.images[0].write);
    }

    #[test]
    fn same_resource_different_usage_stays_separate() {
        let mut builder = RgPassBuilder::new();
        let h = RgImageHandle::new(0);

        builder.read_image(h, RgImageUse::Sampled);
        builder.write_image(h, RgImageUse::ColorAttachment);

        assert_eq!(builder.images.len(), 2);
    }

    #[test]
    fn buffer_access_dedup_ors_write() {
        let mut builder = RgPassBuilder::new();
        let h = RgBufferHandle::new(7);

        builder.write_buffer(h, RgBufferUse::Storage);
        builder.read_buffer(h, RgBufferUse::Storage);
        builder.read_buffer(h, RgBufferUse::Indirect);

        assert_eq!(builder.buffers.len(), 2);
        assert!(builder.buffers[0].write);
        assert!(!builder.buffers[1].write);
    }

    #[test]
    fn color_attachment_implies_graphics_and_write_access() {
        let mut builder = RgPassBuilder::new();
        let h = RgImageHandle::new(0);

        builder.color_attachment(h, vk::AttachmentLoadOp::CLEAR, vk::AttachmentStoreOp::STORE, None);

        assert_eq!(builder.kind, Some(RgPassKind::Graphics));
        assert_eq!(builder.color_attachments.len(), 1);
        assert_eq!(builder.images.len(), 1);
        assert!(builder.images[0].write);
        assert_eq!(builder.images[0].usage, RgImageUse::ColorAttachment);
    }
}
