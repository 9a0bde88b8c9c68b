//! 步行检测
//!
//! 维护最近 N 个加速度范数，窗口填满后每个采样重新评估：
//!
//! 1. 计算均值 / 标准差
//! 2. 寻找超过 `mean + k·std` 的局部极大值（带最小峰间距）
//! 3. 步频 = 峰数 / 窗口时长
//! 4. 置信度 = 方差范围、步频范围、峰间隔规律性三项检查的加权和
//! 5. 通过 [`WalkingHysteresis`] 把置信度转换为稳定的 `is_walking`

use crate::config::WalkingConfig;
use gaitwatch_tools::statistics::{diffs, mean_std, std_dev};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info};

/// 单次评估结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WalkingConfidence {
    pub is_walking: bool,
    /// 置信度 [0, 1]
    pub confidence: f64,
    pub computed_at: Instant,
}

/// 窗口特征
#[derive(Debug, Clone, PartialEq)]
pub struct WindowFeatures {
    pub mean: f64,
    pub std: f64,
    /// 峰值下标（窗口内位置）
    pub peaks: SmallVec<[usize; 16]>,
    /// 步频（Hz），少于两个峰时为 0
    pub cadence_hz: f64,
    /// 峰间隔标准差（采样数），少于三个峰时为 `None`
    pub interval_jitter: Option<f64>,
}

impl WindowFeatures {
    /// 从窗口计算特征
    pub fn compute(window: &[f64], config: &WalkingConfig) -> Self {
        let (mean, std) = mean_std(window);
        let threshold = mean + config.peak_std_factor * std;
        let peaks = find_peaks(window, threshold, config);

        let cadence_hz = if peaks.len() > 1 {
            peaks.len() as f64 / config.window_secs()
        } else {
            0.0
        };

        let interval_jitter = if peaks.len() >= 3 {
            Some(std_dev(&diffs(&peaks)))
        } else {
            None
        };

        Self {
            mean,
            std,
            peaks,
            cadence_hz,
            interval_jitter,
        }
    }

    /// 加权置信度
    pub fn confidence(&self, config: &WalkingConfig) -> f64 {
        let mut confidence = 0.0;
        if (config.std_min..=config.std_max).contains(&self.std) {
            confidence += config.weight_variance;
        }
        if (config.cadence_min_hz..=config.cadence_max_hz).contains(&self.cadence_hz) {
            confidence += config.weight_cadence;
        }
        if let Some(jitter) = self.interval_jitter
            && jitter < config.interval_jitter_max
        {
            confidence += config.weight_regularity;
        }
        confidence.clamp(0.0, 1.0)
    }
}

fn find_peaks(window: &[f64], threshold: f64, config: &WalkingConfig) -> SmallVec<[usize; 16]> {
    let mut peaks: SmallVec<[usize; 16]> = SmallVec::new();
    let len = window.len();
    if len <= 2 * config.edge_margin {
        return peaks;
    }

    for i in config.edge_margin..len - config.edge_margin {
        let value = window[i];
        if value <= threshold {
            continue;
        }
        let lo = i.saturating_sub(config.local_max_radius);
        let hi = (i + config.local_max_radius + 1).min(len);
        let local_max = window[lo..hi].iter().copied().fold(f64::MIN, f64::max);
        if value < local_max {
            continue;
        }
        if let Some(&last) = peaks.last()
            && i - last < config.min_peak_distance
        {
            continue;
        }
        peaks.push(i);
    }
    peaks
}

/// 置信度迟滞
///
/// - 进入步行：连续 `enter_cycles` 个周期置信度不低于阈值
/// - 退出步行：连续 `exit_cycles` 个周期低于阈值，且步行已持续 `min_walking`
/// - 任意两次翻转之间至少间隔 `debounce`，去抖期内的周期不计数
#[derive(Debug, Clone)]
pub struct WalkingHysteresis {
    start_threshold: f64,
    enter_cycles: u32,
    exit_cycles: u32,
    debounce: std::time::Duration,
    min_walking: std::time::Duration,

    is_walking: bool,
    consecutive_walking: u32,
    consecutive_idle: u32,
    last_flip: Option<Instant>,
    walking_since: Option<Instant>,
}

impl WalkingHysteresis {
    pub fn new(config: &WalkingConfig) -> Self {
        Self {
            start_threshold: config.start_threshold,
            enter_cycles: config.enter_cycles,
            exit_cycles: config.exit_cycles,
            debounce: config.debounce(),
            min_walking: config.min_walking(),
            is_walking: false,
            consecutive_walking: 0,
            consecutive_idle: 0,
            last_flip: None,
            walking_since: None,
        }
    }

    pub fn is_walking(&self) -> bool {
        self.is_walking
    }

    /// 输入一个周期的置信度，返回稳定后的 `is_walking`
    pub fn update_at(&mut self, now: Instant, confidence: f64) -> bool {
        if let Some(flip) = self.last_flip
            && now.saturating_duration_since(flip) < self.debounce
        {
            return self.is_walking;
        }

        if confidence >= self.start_threshold {
            self.consecutive_walking += 1;
            self.consecutive_idle = 0;
        } else {
            self.consecutive_idle += 1;
            self.consecutive_walking = 0;
        }

        if !self.is_walking && self.consecutive_walking >= self.enter_cycles {
            self.is_walking = true;
            self.walking_since = Some(now);
            self.last_flip = Some(now);
            info!("Walking started (confidence: {:.2})", confidence);
        } else if self.is_walking
            && self.consecutive_idle >= self.exit_cycles
            && self
                .walking_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.min_walking)
        {
            let walked = self
                .walking_since
                .map(|since| now.saturating_duration_since(since).as_secs_f64())
                .unwrap_or_default();
            self.is_walking = false;
            self.walking_since = None;
            self.last_flip = Some(now);
            info!(
                "Walking stopped (duration: {:.1}s, confidence: {:.2})",
                walked, confidence
            );
        }

        self.is_walking
    }
}

/// 步行检测器
///
/// # Example
///
/// ```
/// use gaitwatch_motion::{WalkingConfig, WalkingDetector};
///
/// let mut detector = WalkingDetector::new(WalkingConfig::default());
/// let (is_walking, confidence) = detector.add_sample(0.0, 0.0, 1.0);
/// assert!(!is_walking);
/// assert_eq!(confidence, 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct WalkingDetector {
    config: WalkingConfig,
    window: VecDeque<f64>,
    hysteresis: WalkingHysteresis,
    last: Option<WalkingConfidence>,
}

impl WalkingDetector {
    pub fn new(config: WalkingConfig) -> Self {
        let hysteresis = WalkingHysteresis::new(&config);
        Self {
            window: VecDeque::with_capacity(config.window_size),
            hysteresis,
            config,
            last: None,
        }
    }

    /// 添加一个加速度采样（使用当前时间）
    pub fn add_sample(&mut self, ax: f64, ay: f64, az: f64) -> (bool, f64) {
        self.add_sample_at(Instant::now(), ax, ay, az)
    }

    /// 添加一个加速度采样
    ///
    /// 非有限分量按 0 处理。窗口未满时总是返回 `(false, 0.0)`。
    pub fn add_sample_at(&mut self, now: Instant, ax: f64, ay: f64, az: f64) -> (bool, f64) {
        let [x, y, z] = [ax, ay, az].map(|v| if v.is_finite() { v } else { 0.0 });
        self.add_magnitude_at(now, (x * x + y * y + z * z).sqrt())
    }

    /// 直接添加加速度范数（负数、NaN 截断为 0）
    pub fn add_magnitude_at(&mut self, now: Instant, magnitude: f64) -> (bool, f64) {
        let magnitude = if magnitude.is_finite() {
            magnitude.max(0.0)
        } else {
            0.0
        };

        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(magnitude);

        if self.window.len() < self.config.window_size {
            return (false, 0.0);
        }

        let features = WindowFeatures::compute(self.window.make_contiguous(), &self.config);
        let confidence = features.confidence(&self.config);
        let is_walking = self.hysteresis.update_at(now, confidence);
        debug!(
            "walking eval: std={:.3} cadence={:.2}Hz peaks={} confidence={:.2}",
            features.std,
            features.cadence_hz,
            features.peaks.len(),
            confidence
        );

        self.last = Some(WalkingConfidence {
            is_walking,
            confidence,
            computed_at: now,
        });
        (is_walking, confidence)
    }

    /// 最近一次评估结果
    pub fn last(&self) -> Option<WalkingConfidence> {
        self.last
    }

    pub fn is_walking(&self) -> bool {
        self.hysteresis.is_walking()
    }

    pub fn is_window_full(&self) -> bool {
        self.window.len() >= self.config.window_size
    }
}
