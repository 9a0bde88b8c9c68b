//! 运动分析引擎
//!
//! 每个采样周期依次运行步行检测、分类器调度和状态机。

use crate::classifier::{ClassifierVerdict, FallClassifier, FallScorer};
use crate::config::MotionConfig;
use crate::error::MotionError;
use crate::state::{MotionStateMachine, StateTransitionRecord};
use crate::walking::WalkingDetector;
use gaitwatch_protocol::{MotionState, SensorSample, StateInfo};
use std::time::Instant;

/// 单个采样周期的分析结果
#[derive(Debug, Clone, PartialEq)]
pub struct MotionUpdate {
    pub sample: SensorSample,
    pub is_walking: bool,
    pub walking_confidence: f64,
    pub verdict: Option<ClassifierVerdict>,
    pub transition: Option<StateTransitionRecord>,
    pub state: MotionState,
    pub state_info: StateInfo,
}

impl MotionUpdate {
    /// 本周期是否进入了 Fall
    pub fn entered_fall(&self) -> bool {
        self.transition
            .as_ref()
            .is_some_and(|t| t.to == MotionState::Fall)
    }
}

/// 运动分析引擎
pub struct MotionEngine {
    walking: WalkingDetector,
    scorer: FallScorer,
    machine: MotionStateMachine,
}

impl MotionEngine {
    /// 创建引擎（配置先经过校验）
    pub fn new(
        config: MotionConfig,
        classifier: Box<dyn FallClassifier>,
    ) -> Result<Self, MotionError> {
        Self::new_at(Instant::now(), config, classifier)
    }

    pub fn new_at(
        now: Instant,
        config: MotionConfig,
        classifier: Box<dyn FallClassifier>,
    ) -> Result<Self, MotionError> {
        config.validate()?;
        Ok(Self {
            scorer: FallScorer::new(&config.classifier, classifier),
            machine: MotionStateMachine::new_at(now, config.state),
            walking: WalkingDetector::new(config.walking),
        })
    }

    /// 处理一个采样
    pub fn process_at(&mut self, now: Instant, sample: &SensorSample) -> MotionUpdate {
        let [ax, ay, az] = sample.acc;
        let (is_walking, walking_confidence) = self.walking.add_sample_at(now, ax, ay, az);
        let verdict = self.scorer.push(sample);
        let transition = self.machine.evaluate_at(now, is_walking, verdict.as_ref());

        MotionUpdate {
            sample: *sample,
            is_walking,
            walking_confidence,
            verdict,
            transition,
            state: self.machine.state(),
            state_info: self.machine.state_info_at(now),
        }
    }

    pub fn state(&self) -> MotionState {
        self.machine.state()
    }

    pub fn classifier_failures(&self) -> u64 {
        self.scorer.failures()
    }
}
