//! 数据存储
//!
//! 所有写入对核心流程都是 fire-and-forget：记录通过有界通道交给写入线程，
//! 通道满或写入失败只记日志，从不阻塞或影响告警投递。

use crate::config::{StoreConfig, StoreKind};
use crate::error::{ServerError, StoreError};
use crossbeam_channel::{Sender, TrySendError, bounded};
use gaitwatch_protocol::{FallPayload, ImuReading, MotionState, StateInfo, timestamp};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn};

/// 存储记录
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "table", content = "record", rename_all = "snake_case")]
pub enum StoreRecord {
    ImuData(ImuReading),
    FallData(FallPayload),
    UserState {
        user_id: String,
        state: MotionState,
        start_time: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<StateInfo>,
    },
    WalkingSessionStarted {
        user_id: String,
        session_id: u64,
        start_time: String,
    },
    WalkingSessionEnded {
        user_id: String,
        session_id: u64,
        end_time: String,
        duration_seconds: u64,
    },
    EmergencyEvent {
        user_id: String,
        emergency_type: String,
        start_time: String,
        duration_seconds: u64,
    },
    EmergencyResolution {
        user_id: String,
        fall_time: String,
        resolution_time: String,
        duration_seconds: u64,
        resolution_type: String,
    },
}

impl StoreRecord {
    pub fn table(&self) -> &'static str {
        match self {
            StoreRecord::ImuData(_) => "imu_data",
            StoreRecord::FallData(_) => "fall_data",
            StoreRecord::UserState { .. } => "user_state",
            StoreRecord::WalkingSessionStarted { .. } => "walking_session_started",
            StoreRecord::WalkingSessionEnded { .. } => "walking_session_ended",
            StoreRecord::EmergencyEvent { .. } => "emergency_event",
            StoreRecord::EmergencyResolution { .. } => "emergency_resolution",
        }
    }
}

/// 写入确认
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAck {
    /// 已持久化，附记录 ID
    Stored(u64),
    /// 模拟后端，未持久化
    MockAck,
}

/// 数据存储后端
pub trait DataStore: Send {
    fn save(&mut self, record: &StoreRecord) -> Result<StoreAck, StoreError>;

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// 模拟存储（只记日志）
#[derive(Debug, Default)]
pub struct MockStore {
    saved: u64,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> u64 {
        self.saved
    }
}

impl DataStore for MockStore {
    fn save(&mut self, record: &StoreRecord) -> Result<StoreAck, StoreError> {
        self.saved += 1;
        debug!("Mock store: {} record (not persisted)", record.table());
        Ok(StoreAck::MockAck)
    }
}

/// JSON Lines 文件存储
///
/// 每行 `{"id", "saved_at", "table", "record"}`，只追加。
pub struct JsonlStore {
    writer: BufWriter<File>,
    next_id: u64,
}

#[derive(Serialize)]
struct JsonlLine<'a> {
    id: u64,
    saved_at: String,
    #[serde(flatten)]
    record: &'a StoreRecord,
}

impl JsonlStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!("JSONL store opened at {}", path.display());
        Ok(Self {
            writer: BufWriter::new(file),
            next_id: 1,
        })
    }
}

impl DataStore for JsonlStore {
    fn save(&mut self, record: &StoreRecord) -> Result<StoreAck, StoreError> {
        let id = self.next_id;
        let line = serde_json::to_string(&JsonlLine {
            id,
            saved_at: timestamp::now_string(),
            record,
        })?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.next_id += 1;
        Ok(StoreAck::Stored(id))
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// 按配置创建存储后端
pub fn open_store(config: &StoreConfig) -> Result<Box<dyn DataStore>, StoreError> {
    match (config.kind, config.path.as_deref()) {
        (StoreKind::Mock, _) => Ok(Box::new(MockStore::new())),
        (StoreKind::Jsonl, Some(path)) => Ok(Box::new(JsonlStore::open(path)?)),
        (StoreKind::Jsonl, None) => Err(StoreError::Unavailable(
            "jsonl store requires a path".to_string(),
        )),
    }
}

/// 异步写入器
///
/// Drop 时关闭通道并等待写入线程把剩余记录写完。
pub struct StoreWriter {
    tx: Option<Sender<StoreRecord>>,
    handle: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl StoreWriter {
    pub fn spawn(mut store: Box<dyn DataStore>, capacity: usize) -> Result<Self, ServerError> {
        let (tx, rx) = bounded::<StoreRecord>(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("gw-store".into())
            .spawn(move || {
                let mut since_flush = 0usize;
                for record in rx.iter() {
                    match store.save(&record) {
                        Ok(ack) => trace!("Stored {} record: {:?}", record.table(), ack),
                        Err(e) => warn!("Store write of {} record failed: {}", record.table(), e),
                    }
                    since_flush += 1;
                    if rx.is_empty() || since_flush >= 64 {
                        if let Err(e) = store.flush() {
                            warn!("Store flush failed: {}", e);
                        }
                        since_flush = 0;
                    }
                }
                if let Err(e) = store.flush() {
                    warn!("Store flush failed: {}", e);
                }
            })
            .map_err(|source| ServerError::ThreadSpawn {
                name: "gw-store".into(),
                source,
            })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// 提交记录（非阻塞），返回是否被接受
    pub fn submit(&self, record: StoreRecord) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Store channel full, dropping {} record", record.table());
                false
            },
            Err(TrySendError::Disconnected(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Store writer stopped, dropping {} record", record.table());
                false
            },
        }
    }

    pub fn submit_all(&self, records: impl IntoIterator<Item = StoreRecord>) {
        for record in records {
            self.submit(record);
        }
    }

    /// 因通道满或写入线程退出而丢弃的记录数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Store writer thread panicked");
        }
    }
}
