use std::ffi::CString;
use std::ops::Deref;

use ash::vk;
use itertools::Itertools;

/// Vulkan 逻辑设备封装
///
/// 包含核心设备 API、graphics queue、vk-mem 分配器以及调试工具的函数指针。
/// 设备和帧状态不依赖任何全局单例，所有调用方显式传递 `&GfxDevice`。
///
/// # 扩展支持
/// - Swapchain (KHR)
/// - Debug Utils (EXT，可选)
/// - Vulkan 1.3 core：dynamic rendering 与 synchronization2
pub struct GfxDevice {
    /// 核心 Vulkan 设备 API
    device: ash::Device,
    /// 交换链扩展 API
    swapchain: ash::khr::swapchain::Device,
    /// 调试工具扩展 API（instance 未开启 debug utils 时为 None）
    debug_utils: Option<ash::ext::debug_utils::Device>,

    /// vk-mem 分配器，所有 buffer/pooled image 由它分配
    allocator: vk_mem::Allocator,

    graphics_queue: vk::Queue,
    graphics_family: u32,

    /// `vkCmdDrawIndexedIndirectCount` 是否可用；不可用时退化为 capped indirect draw
    indirect_count_supported: bool,
}

// 构造与销毁
impl GfxDevice {
    /// instance/surface 的引导由外部完成，这里只负责创建逻辑设备
    pub fn new(
        instance: &ash::Instance,
        pdevice: vk::PhysicalDevice,
        graphics_family: u32,
        enable_debug_utils: bool,
    ) -> Self {
        let _span = tracy_client::span!("GfxDevice::new");

        let device_exts = Self::basic_device_exts();
        let mut exts_str = String::new();
        for ext in &device_exts {
            exts_str.push_str(&format!("\n\t{:?}", unsafe { std::ffi::CStr::from_ptr(*ext) }));
        }
        log::info!("device exts: {}", exts_str);

        let indirect_count_supported = Self::probe_indirect_count(instance, pdevice);
        if !indirect_count_supported {
            log::warn!("drawIndirectCount is not supported, falling back to capped indirect draws");
        }

        let basic_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(true)
            .multi_draw_indirect(true);
        let mut vk12_features =
            vk::PhysicalDeviceVulkan12Features::default().draw_indirect_count(indirect_count_supported);
        let mut vk13_features =
            vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true).synchronization2(true);

        let queue_priorities = [1.0_f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_family)
            .queue_priorities(&queue_priorities)];

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&device_exts)
            .enabled_features(&basic_features)
            .push_next(&mut vk12_features)
            .push_next(&mut vk13_features);

        let device = unsafe { instance.create_device(pdevice, &device_create_info, None).unwrap() };
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };

        let vk_swapchain = ash::khr::swapchain::Device::new(instance, &device);
        let vk_debug_utils = enable_debug_utils.then(|| ash::ext::debug_utils::Device::new(instance, &device));

        let allocator = unsafe {
            vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(instance, &device, pdevice))
                .unwrap_or_else(|e| panic!("vk-mem allocator creation failed: {e:?}"))
        };

        Self {
            device,
            swapchain: vk_swapchain,
            debug_utils: vk_debug_utils,
            allocator,
            graphics_queue,
            graphics_family,
            indirect_count_supported,
        }
    }

    pub fn destroy(self) {
        log::info!("destroying device");
        let Self { device, allocator, .. } = self;
        drop(allocator);
        unsafe {
            device.destroy_device(None);
        }
    }
}

// 创建过程的辅助函数
impl GfxDevice {
    /// 必要的 device extensions
    fn basic_device_exts() -> Vec<*const std::ffi::c_char> {
        [ash::khr::swapchain::NAME].iter().map(|e| e.as_ptr()).collect_vec()
    }

    /// 查询 `drawIndirectCount`（Vulkan 1.2 feature）是否受支持
    fn probe_indirect_count(instance: &ash::Instance, pdevice: vk::PhysicalDevice) -> bool {
        let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vk12_features);
        unsafe {
            instance.get_physical_device_features2(pdevice, &mut features2);
        }
        vk12_features.draw_indirect_count == vk::TRUE
    }
}

// getters
impl GfxDevice {
    #[inline]
    pub fn vk_handle(&self) -> vk::Device {
        self.device.handle()
    }
    #[inline]
    pub fn swapchain_device(&self) -> &ash::khr::swapchain::Device {
        &self.swapchain
    }
    #[inline]
    pub fn allocator(&self) -> &vk_mem::Allocator {
        &self.allocator
    }
    #[inline]
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }
    #[inline]
    pub fn graphics_family(&self) -> u32 {
        self.graphics_family
    }
    #[inline]
    pub fn indirect_count_supported(&self) -> bool {
        self.indirect_count_supported
    }
}

// tools
impl GfxDevice {
    #[inline]
    pub fn set_object_debug_name<T: vk::Handle + Copy>(&self, handle: T, name: impl AsRef<str>) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let name = CString::new(name.as_ref()).unwrap();
        unsafe {
            debug_utils
                .set_debug_utils_object_name(
                    &vk::DebugUtilsObjectNameInfoEXT::default().object_name(name.as_c_str()).object_handle(handle),
                )
                .unwrap();
        }
    }

    pub fn cmd_begin_label(&self, cmd: vk::CommandBuffer, name: &str, color: glam::Vec4) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let name = CString::new(name).unwrap();
        let label = vk::DebugUtilsLabelEXT::default().label_name(name.as_c_str()).color(color.to_array());
        unsafe {
            debug_utils.cmd_begin_debug_utils_label(cmd, &label);
        }
    }

    pub fn cmd_end_label(&self, cmd: vk::CommandBuffer) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        unsafe {
            debug_utils.cmd_end_debug_utils_label(cmd);
        }
    }

    /// 设备不支持 indirect count 时，退化为 max_draw_count 上限的普通 indirect draw
    pub fn cmd_draw_indexed_indirect_count(
        &self,
        cmd: vk::CommandBuffer,
        indirect_buffer: vk::Buffer,
        indirect_offset: vk::DeviceSize,
        count_buffer: vk::Buffer,
        count_offset: vk::DeviceSize,
        max_draw_count: u32,
        stride: u32,
    ) {
        unsafe {
            if self.indirect_count_supported {
                self.device.cmd_draw_indexed_indirect_count(
                    cmd,
                    indirect_buffer,
                    indirect_offset,
                    count_buffer,
                    count_offset,
                    max_draw_count,
                    stride,
                );
            } else {
                self.device.cmd_draw_indexed_indirect(cmd, indirect_buffer, indirect_offset, max_draw_count, stride);
            }
        }
    }

    #[inline]
    pub fn wait_idle(&self) {
        unsafe {
            self.device.device_wait_idle().unwrap();
        }
    }
}

impl Deref for GfxDevice {
    type Target = ash::Device;
    fn deref(&self) -> &Self::Target {
        &self.device
    }
}
