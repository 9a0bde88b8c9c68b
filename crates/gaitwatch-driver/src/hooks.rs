//! 钩子系统
//!
//! 在采样线程中状态发生转换时触发自定义回调，例如把
//! [`StateTransitionRecord`] 交给外部存储做审计。
//!
//! # 使用示例
//!
//! ```rust
//! use gaitwatch_driver::hooks::{ChannelTransitionHook, HookManager, TransitionCallback};
//! use std::sync::Arc;
//!
//! let mut hooks = HookManager::new();
//! let (hook, rx) = ChannelTransitionHook::new(64);
//! hooks.add_callback(Arc::new(hook) as Arc<dyn TransitionCallback>);
//! assert_eq!(hooks.len(), 1);
//! assert!(rx.is_empty());
//! ```

use crossbeam_channel::{Receiver, Sender, bounded};
use gaitwatch_motion::StateTransitionRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 状态转换回调
///
/// 在采样线程中同步调用，实现必须非阻塞（推荐 `try_send`）。
pub trait TransitionCallback: Send + Sync {
    fn on_transition(&self, record: &StateTransitionRecord);
}

impl<F> TransitionCallback for F
where
    F: Fn(&StateTransitionRecord) + Send + Sync,
{
    fn on_transition(&self, record: &StateTransitionRecord) {
        self(record)
    }
}

/// 钩子管理器
///
/// 回调列表本身不是线程安全的，需要外部同步（`RwLock<HookManager>`）。
#[derive(Default)]
pub struct HookManager {
    callbacks: Vec<Arc<dyn TransitionCallback>>,
}

impl HookManager {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            callbacks: Vec::new(),
        }
    }

    pub fn add_callback(&mut self, callback: Arc<dyn TransitionCallback>) {
        self.callbacks.push(callback);
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }

    /// 触发所有回调
    pub fn trigger_all(&self, record: &StateTransitionRecord) {
        for callback in self.callbacks.iter() {
            callback.on_transition(record);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// 通过有界通道异步转发转换记录
///
/// 通道满时丢弃记录并计数，从不阻塞采样线程。
pub struct ChannelTransitionHook {
    tx: Sender<StateTransitionRecord>,
    dropped: Arc<AtomicU64>,
}

impl ChannelTransitionHook {
    pub fn new(capacity: usize) -> (Self, Receiver<StateTransitionRecord>) {
        let (tx, rx) = bounded(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// 丢弃计数（可在 hook 移入管理器前克隆出来）
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl TransitionCallback for ChannelTransitionHook {
    fn on_transition(&self, record: &StateTransitionRecord) {
        if self.tx.try_send(record.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}
