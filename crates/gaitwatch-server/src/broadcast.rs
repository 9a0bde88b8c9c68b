//! 告警广播
//!
//! 对所有已连接的观察端逐一发送；单个观察端发送失败或已关闭时只影响它自己
//! （记录日志并断开），不会中断对其余观察端的投递。

use crate::error::ServerError;
use gaitwatch_protocol::ServerMessage;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// 分配观察端 ID
pub fn next_observer_id() -> u64 {
    NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed)
}

/// 一个可接收下行报文的会话
pub trait Observer: Send + Sync {
    fn id(&self) -> u64;

    /// 会话标识（用户 ID），用于日志
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// 发送一行文本
    fn send_text(&self, text: &str) -> Result<(), ServerError>;

    /// 关闭会话（幂等）
    fn close(&self);
}

/// TCP 会话的写半部
pub struct TcpObserver {
    id: u64,
    label: String,
    stream: Mutex<TcpStream>,
    open: AtomicBool,
}

impl TcpObserver {
    pub fn new(label: impl Into<String>, stream: TcpStream) -> Self {
        Self {
            id: next_observer_id(),
            label: label.into(),
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
        }
    }
}

impl Observer for TcpObserver {
    fn id(&self) -> u64 {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send_text(&self, text: &str) -> Result<(), ServerError> {
        if !self.is_open() {
            return Err(ServerError::ObserverClosed(self.id));
        }
        let mut stream = self.stream.lock();
        stream.write_all(text.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            // 同时唤醒阻塞在读半部上的连接线程
            let _ = self.stream.lock().shutdown(Shutdown::Both);
        }
    }
}

/// 告警广播器
#[derive(Default)]
pub struct Broadcaster {
    observers: RwLock<BTreeMap<u64, Arc<dyn Observer>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn Observer>) {
        self.observers.write().insert(observer.id(), observer);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<dyn Observer>> {
        self.observers.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// 广播，返回成功投递的数量
    ///
    /// 失败或已关闭的观察端被移除并关闭；其连接线程随后完成清理。
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} broadcast: {}", message.wire_type(), e);
                return 0;
            },
        };
        self.broadcast_text(message.wire_type(), &text)
    }

    fn broadcast_text(&self, kind: &str, text: &str) -> usize {
        let targets: Vec<Arc<dyn Observer>> = self.observers.read().values().cloned().collect();

        let mut sent = 0;
        let mut failed = Vec::new();
        for observer in targets.iter() {
            if !observer.is_open() {
                failed.push(observer.clone());
                continue;
            }
            match observer.send_text(text) {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!("Broadcast to {} failed: {}", observer.label(), e);
                    failed.push(observer.clone());
                },
            }
        }

        if !failed.is_empty() {
            let mut observers = self.observers.write();
            for observer in failed.iter() {
                observers.remove(&observer.id());
                observer.close();
            }
            debug!("Dropped {} unreachable observer(s)", failed.len());
        }

        if sent == 0 && !targets.is_empty() {
            error!("Broadcast {} reached no observers", kind);
        } else {
            info!("Broadcast {}: delivered to {} observer(s)", kind, sent);
        }
        sent
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 内存观察端：记录收到的行，可设置为发送失败
    pub(crate) struct MemoryObserver {
        id: u64,
        label: String,
        pub(crate) lines: Mutex<Vec<String>>,
        fail: AtomicBool,
        open: AtomicBool,
    }

    impl MemoryObserver {
        pub(crate) fn new(label: &str) -> Arc<Self> {
            Arc::new(Self {
                id: next_observer_id(),
                label: label.to_string(),
                lines: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                open: AtomicBool::new(true),
            })
        }

        pub(crate) fn failing(label: &str) -> Arc<Self> {
            let observer = Self::new(label);
            observer.fail.store(true, Ordering::Relaxed);
            observer
        }

        pub(crate) fn types(&self) -> Vec<String> {
            self.lines
                .lock()
                .iter()
                .map(|line| {
                    serde_json::from_str::<serde_json::Value>(line)
                        .ok()
                        .and_then(|v| v["type"].as_str().map(str::to_string))
                        .unwrap_or_else(|| line.clone())
                })
                .collect()
        }
    }

    impl Observer for MemoryObserver {
        fn id(&self) -> u64 {
            self.id
        }

        fn label(&self) -> &str {
            &self.label
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn send_text(&self, text: &str) -> Result<(), ServerError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(ServerError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "peer gone",
                )));
            }
            self.lines.lock().push(text.to_string());
            Ok(())
        }

        fn close(&self) {
            self.open.store(false, Ordering::Release);
        }
    }

    #[test]
    fn test_partial_failure_is_isolated() {
        let broadcaster = Broadcaster::new();
        let a = MemoryObserver::new("a");
        let bad = MemoryObserver::failing("bad");
        let c = MemoryObserver::new("c");
        broadcaster.add(a.clone());
        broadcaster.add(bad.clone());
        broadcaster.add(c.clone());

        assert_eq!(broadcaster.broadcast(&ServerMessage::Pong), 2);
        assert_eq!(a.types(), vec!["pong"]);
        assert_eq!(c.types(), vec!["pong"]);

        assert!(!bad.is_open());
        assert_eq!(broadcaster.len(), 2);
    }

    #[test]
    fn test_closed_observer_is_skipped() {
        let broadcaster = Broadcaster::new();
        let a = MemoryObserver::new("a");
        broadcaster.add(a.clone());
        a.close();

        assert_eq!(broadcaster.broadcast(&ServerMessage::Pong), 0);
        assert!(broadcaster.is_empty());
        assert!(a.lines.lock().is_empty());
    }

    #[test]
    fn test_no_observers() {
        let broadcaster = Broadcaster::new();
        assert_eq!(broadcaster.broadcast(&ServerMessage::DisconnectAck), 0);
    }
}
