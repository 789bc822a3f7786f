pub mod deletion_queue;
pub mod frame_ctx;
pub mod transient_pool;

/// Frames in Flight 的数量
///
/// host 录制 slot N 时，device 可以继续执行 slot N-1 已提交的工作。
pub const FIF_COUNT: usize = 2;
