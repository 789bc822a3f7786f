//! 资源用途到同步状态的固定映射
//!
//! 每种用途确定性地映射到 (pipeline stage, access, layout, aspect)，
//! write 标志只影响 access 的读/写位。

use ash::vk;

/// 图像在 pass 中的用途
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RgImageUse {
    ColorAttachment,
    DepthAttachment,
    Sampled,
    Present,
}

/// 缓冲区在 pass 中的用途
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RgBufferUse {
    Uniform,
    Storage,
    Indirect,
    Transfer,
}

/// 图像用途展开后的同步状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgImageUseState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
    pub layout: vk::ImageLayout,
    pub aspect: vk::ImageAspectFlags,
}

/// 缓冲区用途展开后的同步状态
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RgBufferUseState {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// 视为「写」的图像 access 位
pub const IMAGE_WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
);

/// 视为「写」的缓冲区 access 位
pub const BUFFER_WRITE_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
);

pub fn image_use_state(usage: RgImageUse, write: bool) -> RgImageUseState {
    match usage {
        RgImageUse::ColorAttachment => RgImageUseState {
            stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access: if write {
                vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
            } else {
                vk::AccessFlags2::COLOR_ATTACHMENT_READ
            },
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            aspect: vk::ImageAspectFlags::COLOR,
        },
        RgImageUse::DepthAttachment => RgImageUseState {
            stage: vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
            access: if write {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
            } else {
                vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
            },
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            aspect: vk::ImageAspectFlags::DEPTH,
        },
        RgImageUse::Sampled => RgImageUseState {
            stage: vk::PipelineStageFlags2::FRAGMENT_SHADER | vk::PipelineStageFlags2::COMPUTE_SHADER,
            access: vk::AccessFlags2::SHADER_SAMPLED_READ | vk::AccessFlags2::SHADER_READ,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            aspect: vk::ImageAspectFlags::COLOR,
        },
        RgImageUse::Present => RgImageUseState {
            stage: vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
            access: vk::AccessFlags2::NONE,
            layout: vk::ImageLayout::PRESENT_SRC_KHR,
            aspect: vk::ImageAspectFlags::COLOR,
        },
    }
}

pub fn buffer_use_state(usage: RgBufferUse, write: bool) -> RgBufferUseState {
    match usage {
        RgBufferUse::Uniform => RgBufferUseState {
            stage: vk::PipelineStageFlags2::VERTEX_SHADER | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access: vk::AccessFlags2::UNIFORM_READ,
        },
        RgBufferUse::Storage => RgBufferUseState {
            stage: vk::PipelineStageFlags2::COMPUTE_SHADER
                | vk::PipelineStageFlags2::VERTEX_SHADER
                | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access: if write {
                vk::AccessFlags2::SHADER_WRITE | vk::AccessFlags2::SHADER_READ
            } else {
                vk::AccessFlags2::SHADER_READ
            },
        },
        RgBufferUse::Indirect => RgBufferUseState {
            stage: vk::PipelineStageFlags2::DRAW_INDIRECT,
            access: vk::AccessFlags2::INDIRECT_COMMAND_READ,
        },
        RgBufferUse::Transfer => RgBufferUseState {
            stage: vk::PipelineStageFlags2::TRANSFER,
            access: if write { vk::AccessFlags2::TRANSFER_WRITE } else { vk::AccessFlags2::TRANSFER_READ },
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_attachment_write_maps_to_attachment_state() {
        let st = image_use_state(RgImageUse::ColorAttachment, true);
        assert_eq!(st.layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(st.access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
        assert!(st.access.intersects(IMAGE_WRITE_ACCESS));
    }

    #[test]
    fn sampled_is_read_only_regardless_of_mapping() {
        let st = image_use_state(RgImageUse::Sampled, false);
        assert_eq!(st.layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert!(!st.access.intersects(IMAGE_WRITE_ACCESS));
    }

    #[test]
    fn storage_write_carries_read_and_write_bits() {
        let st = buffer_use_state(RgBufferUse::Storage, true);
        assert!(st.access.contains(vk::AccessFlags2::SHADER_WRITE));
        assert!(st.access.contains(vk::AccessFlags2::SHADER_READ));
        assert!(st.access.intersects(BUFFER_WRITE_ACCESS));

        let st = buffer_use_state(RgBufferUse::Storage, false);
        assert!(!st.access.intersects(BUFFER_WRITE_ACCESS));
    }

    #[test]
    fn indirect_use_targets_draw_indirect_stage() {
        let st = buffer_use_state(RgBufferUse::Indirect, false);
        assert_eq!(st.stage, vk::PipelineStageFlags2::DRAW_INDIRECT);
        assert_eq!(st.access, vk::AccessFlags2::INDIRECT_COMMAND_READ);
    }
}
