//! 跌倒分类器接口
//!
//! 分类模型本身是外部组件：输入固定长度的六轴序列，输出跌倒概率。
//! [`FallScorer`] 负责缓冲、按步长调用以及失败降级（失败时本周期无判定）。

use crate::config::ClassifierConfig;
use crate::error::ClassifierError;
use gaitwatch_protocol::SensorSample;
use gaitwatch_tools::statistics::std_dev;
use std::collections::VecDeque;
use tracing::warn;

/// 分类器判定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierVerdict {
    /// 跌倒概率 [0, 1]
    pub probability: f64,
    pub is_fall: bool,
}

/// 固定长度六轴缓冲（最旧的先丢弃）
#[derive(Debug, Clone)]
pub struct FeatureBuffer {
    capacity: usize,
    rows: VecDeque<[f64; 6]>,
}

impl FeatureBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            rows: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: &SensorSample) {
        if self.rows.len() == self.capacity {
            self.rows.pop_front();
        }
        self.rows.push_back(sample.to_array());
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.capacity
    }

    /// 按时间顺序遍历（最旧在前）
    pub fn iter(&self) -> impl Iterator<Item = &[f64; 6]> {
        self.rows.iter()
    }

    /// 加速度范数序列
    pub fn acc_magnitudes(&self) -> Vec<f64> {
        self.rows
            .iter()
            .map(|r| (r[0] * r[0] + r[1] * r[1] + r[2] * r[2]).sqrt())
            .collect()
    }
}

/// 跌倒分类器
///
/// 实现者只关心一次推理；缓冲与调用时机由 [`FallScorer`] 管理。
pub trait FallClassifier: Send {
    /// 对一个已填满的缓冲给出跌倒概率
    fn classify(&mut self, window: &FeatureBuffer) -> Result<f64, ClassifierError>;
}

impl<F> FallClassifier for F
where
    F: FnMut(&FeatureBuffer) -> Result<f64, ClassifierError> + Send,
{
    fn classify(&mut self, window: &FeatureBuffer) -> Result<f64, ClassifierError> {
        self(window)
    }
}

/// 分类器调度器
pub struct FallScorer {
    buffer: FeatureBuffer,
    classifier: Box<dyn FallClassifier>,
    stride: usize,
    threshold: f64,
    counter: u64,
    failures: u64,
}

impl FallScorer {
    pub fn new(config: &ClassifierConfig, classifier: Box<dyn FallClassifier>) -> Self {
        Self {
            buffer: FeatureBuffer::new(config.sequence_length),
            classifier,
            stride: config.stride.max(1),
            threshold: config.fall_threshold,
            counter: 0,
            failures: 0,
        }
    }

    /// 推入一个采样，到达调用时机时返回判定
    ///
    /// 缓冲未满、未到步长或分类器失败时返回 `None`。
    pub fn push(&mut self, sample: &SensorSample) -> Option<ClassifierVerdict> {
        self.buffer.push(sample);
        self.counter += 1;

        if !self.buffer.is_full() || self.counter % self.stride as u64 != 0 {
            return None;
        }

        match self.classifier.classify(&self.buffer) {
            Ok(p) if p.is_finite() => {
                let probability = p.clamp(0.0, 1.0);
                Some(ClassifierVerdict {
                    probability,
                    is_fall: probability >= self.threshold,
                })
            },
            Ok(p) => {
                self.failures += 1;
                warn!("{}", ClassifierError::InvalidOutput(p));
                None
            },
            Err(e) => {
                self.failures += 1;
                warn!("Fall classifier failed, no verdict this cycle: {}", e);
                None
            },
        }
    }

    /// 累计失败次数
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

/// 内置冲击-静止启发式分类器
///
/// 在没有外部模型时使用：窗口内出现超过 `impact_g` 的冲击，且冲击之后
/// 的加速度范数趋于平稳（标准差低于 `stillness_std`）时给出高概率。
#[derive(Debug, Clone)]
pub struct ImpactClassifier {
    pub impact_g: f64,
    pub stillness_std: f64,
    /// 冲击后至少需要的采样数
    pub min_post_samples: usize,
}

impl Default for ImpactClassifier {
    fn default() -> Self {
        Self {
            impact_g: 2.5,
            stillness_std: 0.3,
            min_post_samples: 30,
        }
    }
}

impl FallClassifier for ImpactClassifier {
    fn classify(&mut self, window: &FeatureBuffer) -> Result<f64, ClassifierError> {
        if !window.is_full() {
            return Err(ClassifierError::BufferNotFull {
                len: window.len(),
                required: window.capacity(),
            });
        }

        let magnitudes = self.magnitudes_or_err(window)?;
        let (peak_idx, peak) = magnitudes
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best });

        let span = (self.impact_g - 1.0).max(f64::EPSILON);
        let impact_score = ((peak - 1.0) / span).clamp(0.0, 1.0);

        let post = &magnitudes[(peak_idx + 1).min(magnitudes.len())..];
        let still = post.len() >= self.min_post_samples && std_dev(post) < self.stillness_std;

        Ok(if still { impact_score } else { impact_score * 0.4 })
    }
}

impl ImpactClassifier {
    fn magnitudes_or_err(&self, window: &FeatureBuffer) -> Result<Vec<f64>, ClassifierError> {
        let magnitudes = window.acc_magnitudes();
        if magnitudes.iter().any(|m| !m.is_finite()) {
            return Err(ClassifierError::Unavailable(
                "non-finite acceleration in window".to_string(),
            ));
        }
        Ok(magnitudes)
    }
}
