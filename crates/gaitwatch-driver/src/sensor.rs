//! 传感器数据源
//!
//! - [`SyntheticSource`]: 按脚本循环生成 静止 / 步行 / 跌倒 波形（带噪声）
//! - [`ScriptedSource`]: 回放固定采样序列（测试用）

use crate::error::DriverError;
use gaitwatch_protocol::SensorSample;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::f64::consts::PI;

/// 六轴传感器数据源
pub trait SensorSource: Send {
    /// 读取下一个采样
    ///
    /// 返回 `Ok(None)` 表示数据源已耗尽，采样线程随之退出。
    fn read(&mut self) -> Result<Option<SensorSample>, DriverError>;
}

/// 合成波形阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// 静止站立/坐着
    Idle,
    /// 约 1.8 Hz 步态
    Walking,
    /// 冲击后躺倒
    Fall,
}

/// 合成传感器
pub struct SyntheticSource {
    rng: StdRng,
    script: Vec<(Phase, usize)>,
    step: usize,
    phase_tick: usize,
    sample_rate_hz: f64,
}

impl SyntheticSource {
    /// 默认脚本：静止 5s → 步行 20s → 静止 10s → 跌倒 30s，循环
    pub fn new(sample_rate_hz: f64) -> Self {
        let secs = |s: f64| (s * sample_rate_hz) as usize;
        Self::with_script(
            sample_rate_hz,
            vec![
                (Phase::Idle, secs(5.0)),
                (Phase::Walking, secs(20.0)),
                (Phase::Idle, secs(10.0)),
                (Phase::Fall, secs(30.0)),
            ],
        )
    }

    pub fn with_script(sample_rate_hz: f64, script: Vec<(Phase, usize)>) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            script,
            step: 0,
            phase_tick: 0,
            sample_rate_hz,
        }
    }

    /// 固定随机种子（可复现）
    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn noise(&mut self, amplitude: f64) -> f64 {
        self.rng.gen_range(-amplitude..=amplitude)
    }

    fn current_phase(&mut self) -> Phase {
        if self.script.is_empty() {
            return Phase::Idle;
        }
        while self.phase_tick >= self.script[self.step].1 {
            self.phase_tick = 0;
            self.step = (self.step + 1) % self.script.len();
            if self.script.iter().all(|(_, len)| *len == 0) {
                return Phase::Idle;
            }
        }
        self.script[self.step].0
    }

    fn generate(&mut self, phase: Phase, tick: usize) -> SensorSample {
        let t = tick as f64 / self.sample_rate_hz;
        match phase {
            Phase::Idle => SensorSample::new(
                [self.noise(0.02), self.noise(0.02), 1.0 + self.noise(0.02)],
                [self.noise(0.5), self.noise(0.5), self.noise(0.5)],
            ),
            Phase::Walking => {
                let stride = (2.0 * PI * 1.8 * t).cos();
                let sway = (PI * 1.8 * t).sin();
                SensorSample::new(
                    [
                        0.15 * sway + self.noise(0.03),
                        0.1 * stride + self.noise(0.03),
                        1.0 + 0.5 * stride + self.noise(0.03),
                    ],
                    [
                        20.0 * sway + self.noise(2.0),
                        8.0 * stride + self.noise(2.0),
                        self.noise(2.0),
                    ],
                )
            },
            Phase::Fall => {
                // 前 0.3 s 失衡，随后一次冲击，之后侧躺静止
                let impact_tick = (0.3 * self.sample_rate_hz) as usize;
                if tick < impact_tick {
                    SensorSample::new(
                        [0.3 + self.noise(0.2), self.noise(0.2), 0.4 + self.noise(0.2)],
                        [self.noise(150.0), self.noise(150.0), self.noise(150.0)],
                    )
                } else if tick == impact_tick {
                    SensorSample::new([2.4, -1.2, 2.1], [210.0, -140.0, 95.0])
                } else {
                    SensorSample::new(
                        [1.0 + self.noise(0.02), self.noise(0.02), self.noise(0.02)],
                        [self.noise(0.5), self.noise(0.5), self.noise(0.5)],
                    )
                }
            },
        }
    }
}

impl SensorSource for SyntheticSource {
    fn read(&mut self) -> Result<Option<SensorSample>, DriverError> {
        let phase = self.current_phase();
        let tick = self.phase_tick;
        self.phase_tick += 1;
        Ok(Some(self.generate(phase, tick)))
    }
}

/// 回放固定采样序列
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    samples: VecDeque<SensorSample>,
}

impl ScriptedSource {
    pub fn new(samples: impl IntoIterator<Item = SensorSample>) -> Self {
        Self {
            samples: samples.into_iter().collect(),
        }
    }

    /// 追加 `count` 个相同采样
    pub fn repeat(mut self, sample: SensorSample, count: usize) -> Self {
        self.samples.extend(std::iter::repeat_n(sample, count));
        self
    }

    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl SensorSource for ScriptedSource {
    fn read(&mut self) -> Result<Option<SensorSample>, DriverError> {
        Ok(self.samples.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_source_exhausts() {
        let still = SensorSample::new([0.0, 0.0, 1.0], [0.0; 3]);
        let mut source = ScriptedSource::default().repeat(still, 2);
        assert_eq!(source.read().unwrap(), Some(still));
        assert_eq!(source.remaining(), 1);
        assert!(source.read().unwrap().is_some());
        assert!(source.read().unwrap().is_none());
    }

    #[test]
    fn test_synthetic_phases_cycle() {
        let mut source =
            SyntheticSource::with_script(100.0, vec![(Phase::Idle, 3), (Phase::Fall, 50)]).seeded(7);
        let idle: Vec<SensorSample> = (0..3).map(|_| source.read().unwrap().unwrap()).collect();
        assert!(idle.iter().all(|s| (s.acc_magnitude() - 1.0).abs() < 0.1));

        let fall: Vec<SensorSample> = (0..50).map(|_| source.read().unwrap().unwrap()).collect();
        let peak = fall.iter().map(|s| s.acc_magnitude()).fold(0.0, f64::max);
        assert!(peak > 3.0);

        // 回到脚本开头
        let again = source.read().unwrap().unwrap();
        assert!((again.acc_magnitude() - 1.0).abs() < 0.1);
    }

    #[test]
    fn test_synthetic_walking_swings() {
        let mut source = SyntheticSource::with_script(100.0, vec![(Phase::Walking, 300)]).seeded(1);
        let mags: Vec<f64> = (0..300)
            .map(|_| source.read().unwrap().unwrap().acc_magnitude())
            .collect();
        let max = mags.iter().copied().fold(f64::MIN, f64::max);
        let min = mags.iter().copied().fold(f64::MAX, f64::min);
        assert!(max - min > 0.7);
    }

    #[test]
    fn test_empty_script_is_idle() {
        let mut source = SyntheticSource::with_script(100.0, Vec::new()).seeded(3);
        let sample = source.read().unwrap().unwrap();
        assert!((sample.acc_magnitude() - 1.0).abs() < 0.1);
    }
}
