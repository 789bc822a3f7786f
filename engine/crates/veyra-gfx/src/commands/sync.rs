use ash::vk;

use crate::foundation::device::GfxDevice;

/// # Destroy
/// 不实现 Drop，因为可以 Clone，需要手动 destroy
#[derive(Clone)]
pub struct GfxFence {
    fence: vk::Fence,
}

// 创建与销毁
impl GfxFence {
    /// # param
    /// * signaled - 是否创建时就 signaled
    pub fn new(device: &GfxDevice, signaled: bool, debug_name: &str) -> Self {
        let fence_flags = if signaled { vk::FenceCreateFlags::SIGNALED } else { vk::FenceCreateFlags::empty() };
        let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default().flags(fence_flags), None).unwrap() };
        device.set_object_debug_name(fence, format!("GfxFence::{debug_name}"));
        Self { fence }
    }

    #[inline]
    pub fn destroy(self, device: &GfxDevice) {
        unsafe {
            device.destroy_fence(self.fence, None);
        }
    }
}

// getters
impl GfxFence {
    #[inline]
    pub fn handle(&self) -> vk::Fence {
        self.fence
    }
}

// tools
impl GfxFence {
    /// 阻塞等待 fence
    #[inline]
    pub fn wait(&self, device: &GfxDevice) {
        unsafe {
            device.wait_for_fences(std::slice::from_ref(&self.fence), true, u64::MAX).unwrap();
        }
    }

    #[inline]
    pub fn reset(&self, device: &GfxDevice) {
        unsafe {
            device.reset_fences(std::slice::from_ref(&self.fence)).unwrap();
        }
    }
}

/// # Destroy
/// 同 [`GfxFence`]，需要手动 destroy
#[derive(Clone)]
pub struct GfxSemaphore {
    semaphore: vk::Semaphore,
}

// 创建与销毁
impl GfxSemaphore {
    pub fn new(device: &GfxDevice, debug_name: &str) -> Self {
        let semaphore = unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None).unwrap() };
        device.set_object_debug_name(semaphore, format!("GfxSemaphore::{debug_name}"));
        Self { semaphore }
    }

    #[inline]
    pub fn destroy(self, device: &GfxDevice) {
        unsafe {
            device.destroy_semaphore(self.semaphore, None);
        }
    }
}

// getters
impl GfxSemaphore {
    #[inline]
    pub fn handle(&self) -> vk::Semaphore {
        self.semaphore
    }
}
