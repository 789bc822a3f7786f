//! 跨帧复用的 transient 资源池
//!
//! 同形状的 image/buffer 在帧之间复用，避免逐帧分配。
//! 条目的状态流转：Free → (acquire) → 调用方持有 → (retire) → InFlight[slot]
//! → (slot 下一次 begin，fence 已等待) → Free。InFlight 期间绝不销毁。

use crate::frame::FIF_COUNT;

use ash::vk;

/// 通用的 free list + per-slot in-flight list 资源池
///
/// key 为资源形状，匹配策略是首个精确命中（不做 best-fit）。
pub struct TransientPool<K: PartialEq + Copy, T> {
    free: Vec<(K, T)>,
    in_flight: [Vec<(K, T)>; FIF_COUNT],
}

impl<K: PartialEq + Copy, T> Default for TransientPool<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: PartialEq + Copy, T> TransientPool<K, T> {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            in_flight: std::array::from_fn(|_| Vec::new()),
        }
    }

    /// 取出一个形状精确匹配的空闲条目；None 表示需要新建
    pub fn acquire(&mut self, key: K) -> Option<T> {
        let idx = self.free.iter().position(|(k, _)| *k == key)?;
        Some(self.free.swap_remove(idx).1)
    }

    /// 放入 slot 的 in-flight 列表；不销毁
    pub fn retire(&mut self, slot: usize, key: K, value: T) {
        self.in_flight[slot].push((key, value));
    }

    /// slot 的 fence 等待完成后调用，把该 slot 的 in-flight 条目合并回 free list。
    /// 必须先于该 slot 本帧的任何 acquire。
    pub fn begin_slot(&mut self, slot: usize) {
        self.free.append(&mut self.in_flight[slot]);
    }

    /// 取出所有条目（shutdown 时销毁用）
    pub fn drain(&mut self) -> Vec<(K, T)> {
        let mut all = std::mem::take(&mut self.free);
        for slot in &mut self.in_flight {
            all.append(slot);
        }
        all
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// image 池的形状 key
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransientImageKey {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// buffer 池的形状 key
///
/// host_access 对应 vk-mem 的 HOST_ACCESS_RANDOM 分配标志。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TransientBufferKey {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub host_access: bool,
}

/// 池中的 image 条目
pub struct TransientImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub allocation: vk_mem::Allocation,
}

/// 池中的 buffer 条目
pub struct TransientBuffer {
    pub buffer: vk::Buffer,
    pub allocation: vk_mem::Allocation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_on_empty_pool_misses() {
        let mut pool = TransientPool::<u32, u64>::new();
        assert!(pool.acquire(7).is_none());
    }

    #[test]
    fn retired_entry_stays_in_flight_until_slot_begins() {
        let mut pool = TransientPool::<u32, u64>::new();
        pool.retire(0, 7, 100);

        // slot 0 还未重新开始，条目不可复用
        assert!(pool.acquire(7).is_none());

        pool.begin_slot(0);
        assert_eq!(pool.acquire(7), Some(100));
    }

    #[test]
    fn same_shape_reuses_identity_across_the_ring() {
        let mut pool = TransientPool::<u32, u64>::new();

        // frame 0 (slot 0)：新建，retire
        pool.begin_slot(0);
        assert!(pool.acquire(7).is_none());
        pool.retire(0, 7, 0xAB);

        // frame 1 (slot 1)：slot 0 的条目依然 in flight
        pool.begin_slot(1);
        assert!(pool.acquire(7).is_none());
        pool.retire(1, 7, 0xCD);

        // frame 2 (slot 0)：ring 回绕，slot 0 的条目回到 free list，原生身份复用
        pool.begin_slot(0);
        assert_eq!(pool.acquire(7), Some(0xAB));
    }

    #[test]
    fn mismatched_shape_never_matches() {
        let mut pool = TransientPool::<u32, u64>::new();
        pool.retire(0, 7, 100);
        pool.begin_slot(0);

        assert!(pool.acquire(8).is_none());
        assert_eq!(pool.acquire(7), Some(100));
    }

    #[test]
    fn drain_returns_free_and_in_flight_entries() {
        let mut pool = TransientPool::<u32, u64>::new();
        pool.retire(0, 1, 10);
        pool.retire(1, 2, 20);
        pool.begin_slot(0);
        pool.retire(0, 3, 30);

        let mut drained = pool.drain().into_iter().map(|(k, _)| k).collect::<Vec<_>>();
        drained.sort();
        assert_eq!(drained, vec![1, 2, 3]);
        assert_eq!(pool.free_count(), 0);
    }
}
