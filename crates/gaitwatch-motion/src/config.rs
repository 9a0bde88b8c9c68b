//! 运动分析配置
//!
//! 所有阈值与时长均为可调参数，默认值取自现有部署。

use crate::error::MotionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 秒数转 `Duration`（负数、NaN 视为 0）
pub(crate) fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// 运动分析总配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub walking: WalkingConfig,
    pub state: StateMachineConfig,
    pub classifier: ClassifierConfig,
}

impl MotionConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), MotionError> {
        self.walking.validate()?;
        self.state.validate()?;
        self.classifier.validate()
    }
}

/// 步行检测参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkingConfig {
    /// 滑动窗口长度（采样数）
    pub window_size: usize,
    /// 采样率（Hz）
    pub sample_rate_hz: f64,
    /// 峰值阈值系数：`mean + k * std`
    pub peak_std_factor: f64,
    /// 相邻峰最小间隔（采样数）
    pub min_peak_distance: usize,
    /// 局部极大值判定半径（采样数）
    pub local_max_radius: usize,
    /// 窗口两端不参与峰值搜索的采样数
    pub edge_margin: usize,
    /// 步行可接受的标准差范围（g）
    pub std_min: f64,
    pub std_max: f64,
    /// 步频范围（Hz）
    pub cadence_min_hz: f64,
    pub cadence_max_hz: f64,
    /// 峰间隔标准差上限（采样数）
    pub interval_jitter_max: f64,
    /// 各项检查的权重
    pub weight_variance: f64,
    pub weight_cadence: f64,
    pub weight_regularity: f64,
    /// 判定为步行的置信度阈值
    pub start_threshold: f64,
    /// 进入步行所需的连续周期数
    pub enter_cycles: u32,
    /// 退出步行所需的连续周期数
    pub exit_cycles: u32,
    /// 两次翻转之间的最小间隔（秒）
    pub debounce_secs: f64,
    /// 步行最短持续时间（秒）
    pub min_walking_secs: f64,
}

impl Default for WalkingConfig {
    fn default() -> Self {
        Self {
            window_size: 300,
            sample_rate_hz: 100.0,
            peak_std_factor: 0.15,
            min_peak_distance: 15,
            local_max_radius: 10,
            edge_margin: 20,
            std_min: 0.2,
            std_max: 2.0,
            cadence_min_hz: 1.2,
            cadence_max_hz: 3.5,
            interval_jitter_max: 10.0,
            weight_variance: 0.4,
            weight_cadence: 0.4,
            weight_regularity: 0.2,
            start_threshold: 0.7,
            enter_cycles: 3,
            exit_cycles: 5,
            debounce_secs: 1.5,
            min_walking_secs: 2.0,
        }
    }
}

impl WalkingConfig {
    /// 窗口时长（秒）
    pub fn window_secs(&self) -> f64 {
        self.window_size as f64 / self.sample_rate_hz
    }

    pub fn debounce(&self) -> Duration {
        secs(self.debounce_secs)
    }

    pub fn min_walking(&self) -> Duration {
        secs(self.min_walking_secs)
    }

    pub fn validate(&self) -> Result<(), MotionError> {
        if self.window_size == 0 {
            return Err(invalid("walking.window_size must be > 0"));
        }
        if self.window_size <= 2 * self.edge_margin {
            return Err(invalid("walking.window_size must exceed twice edge_margin"));
        }
        if !(self.sample_rate_hz > 0.0) {
            return Err(invalid("walking.sample_rate_hz must be > 0"));
        }
        if self.std_min > self.std_max {
            return Err(invalid("walking.std_min must not exceed std_max"));
        }
        if self.cadence_min_hz > self.cadence_max_hz {
            return Err(invalid("walking.cadence_min_hz must not exceed cadence_max_hz"));
        }
        if self.enter_cycles == 0 || self.exit_cycles == 0 {
            return Err(invalid("walking.enter_cycles and exit_cycles must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.start_threshold) {
            return Err(invalid("walking.start_threshold must be within [0, 1]"));
        }
        let weights = self.weight_variance + self.weight_cadence + self.weight_regularity;
        if (weights - 1.0).abs() > 1e-6 {
            return Err(invalid("walking weights must sum to 1.0"));
        }
        if self.debounce_secs < 0.0 || self.min_walking_secs < 0.0 {
            return Err(invalid("walking durations must be non-negative"));
        }
        Ok(())
    }
}

/// 状态机参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// 跌倒冷却（秒）
    pub fall_cooldown_secs: f64,
    /// 步行确认时长（秒）
    pub walking_confirm_secs: f64,
    /// 空闲确认时长（秒），必须不短于步行确认
    pub idle_confirm_secs: f64,
    /// 跌倒自动恢复时长（秒）
    pub fall_recovery_secs: f64,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            fall_cooldown_secs: 10.0,
            walking_confirm_secs: 3.0,
            idle_confirm_secs: 8.0,
            fall_recovery_secs: 5.0,
        }
    }
}

impl StateMachineConfig {
    pub fn fall_cooldown(&self) -> Duration {
        secs(self.fall_cooldown_secs)
    }

    pub fn walking_confirm(&self) -> Duration {
        secs(self.walking_confirm_secs)
    }

    pub fn idle_confirm(&self) -> Duration {
        secs(self.idle_confirm_secs)
    }

    pub fn fall_recovery(&self) -> Duration {
        secs(self.fall_recovery_secs)
    }

    pub fn validate(&self) -> Result<(), MotionError> {
        let all = [
            self.fall_cooldown_secs,
            self.walking_confirm_secs,
            self.idle_confirm_secs,
            self.fall_recovery_secs,
        ];
        if all.iter().any(|v| !(*v >= 0.0)) {
            return Err(invalid("state durations must be non-negative"));
        }
        if self.idle_confirm_secs < self.walking_confirm_secs {
            return Err(invalid(
                "state.idle_confirm_secs must not be shorter than walking_confirm_secs",
            ));
        }
        Ok(())
    }
}

/// 跌倒分类器调用参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// 输入序列长度（采样数）
    pub sequence_length: usize,
    /// 调用步长（每 N 个采样调用一次）
    pub stride: usize,
    /// 判定为跌倒的概率阈值
    pub fall_threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            sequence_length: 150,
            stride: 5,
            fall_threshold: 0.5,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<(), MotionError> {
        if self.sequence_length == 0 || self.stride == 0 {
            return Err(invalid("classifier.sequence_length and stride must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.fall_threshold) {
            return Err(invalid("classifier.fall_threshold must be within [0, 1]"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> MotionError {
    MotionError::InvalidConfig(msg.to_string())
}
