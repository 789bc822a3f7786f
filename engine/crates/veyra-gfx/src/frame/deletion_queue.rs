//! 延迟销毁队列
//!
//! 资源销毁以闭包形式入队，在对应 ring slot 的 fence 等待之后统一执行，
//! 保证 GPU 不会访问到已销毁的资源。

use crate::foundation::device::GfxDevice;

/// 延迟销毁队列
///
/// flush 时按入队的逆序执行（后创建的资源先销毁）。
/// 两种作用域：per-ring-slot 的帧队列（slot 复用前 flush），
/// 以及 device 生命周期的队列（shutdown 时 flush）。
pub struct DeletionQueue<C = GfxDevice> {
    fns: Vec<Box<dyn FnOnce(&C)>>,
}

impl<C> Default for DeletionQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DeletionQueue<C> {
    pub fn new() -> Self {
        Self { fns: Vec::new() }
    }

    #[inline]
    pub fn push(&mut self, f: impl FnOnce(&C) + 'static) {
        self.fns.push(Box::new(f));
    }

    /// 逆序执行所有入队的闭包并清空队列
    pub fn flush(&mut self, ctx: &C) {
        for f in self.fns.drain(..).rev() {
            f(ctx);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn flush_runs_in_reverse_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut queue = DeletionQueue::<()>::new();
        for i in 0..4 {
            let order = order.clone();
            queue.push(move |_| order.borrow_mut().push(i));
        }

        queue.flush(&());
        assert_eq!(*order.borrow(), vec![3, 2, 1, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_on_empty_queue_is_noop() {
        let mut queue = DeletionQueue::<()>::new();
        queue.flush(&());
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }
}
