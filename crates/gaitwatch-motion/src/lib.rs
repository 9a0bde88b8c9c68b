//! 运动分析模块
//!
//! 本模块把原始六轴采样转换为用户运动状态，包括：
//! - 步行检测（加速度范数滑动窗口 + 峰值/步频/规律性 + 迟滞）
//! - 运动状态机（日常 / 步行 / 跌倒，带确认时长与跌倒冷却）
//! - 跌倒分类器接口（固定长度缓冲 + 步长调用 + 失败降级）
//! - 组合引擎：每个采样周期跑一遍以上三者
//!
//! 所有时间相关逻辑都提供 `*_at(now, ..)` 形式，便于用模拟时间测试。

pub mod classifier;
pub mod config;
pub mod engine;
mod error;
pub mod state;
pub mod walking;

pub use classifier::{
    ClassifierVerdict, FallClassifier, FallScorer, FeatureBuffer, ImpactClassifier,
};
pub use config::{ClassifierConfig, MotionConfig, StateMachineConfig, WalkingConfig};
pub use engine::{MotionEngine, MotionUpdate};
pub use error::{ClassifierError, MotionError};
pub use state::{MotionStateMachine, StateTransitionRecord, TransitionEvidence};
pub use walking::{WalkingConfidence, WalkingDetector, WalkingHysteresis, WindowFeatures};
