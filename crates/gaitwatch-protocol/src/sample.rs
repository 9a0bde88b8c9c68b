//! # IMU 采样

use crate::message::{Axis3, ImuReading, SensorData};

/// 单次六轴采样
///
/// 加速度单位 g，角速度单位 °/s。产生后不可变，按到达顺序处理。
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SensorSample {
    /// 三轴加速度（x, y, z）
    pub acc: [f64; 3],
    /// 三轴角速度（x, y, z）
    pub gyr: [f64; 3],
}

impl SensorSample {
    pub fn new(acc: [f64; 3], gyr: [f64; 3]) -> Self {
        Self { acc, gyr }
    }

    /// 按 `[acc_x, acc_y, acc_z, gyr_x, gyr_y, gyr_z]` 顺序构造
    pub fn from_array(values: [f64; 6]) -> Self {
        Self {
            acc: [values[0], values[1], values[2]],
            gyr: [values[3], values[4], values[5]],
        }
    }

    pub fn to_array(&self) -> [f64; 6] {
        [
            self.acc[0],
            self.acc[1],
            self.acc[2],
            self.gyr[0],
            self.gyr[1],
            self.gyr[2],
        ]
    }

    /// 加速度欧氏范数
    pub fn acc_magnitude(&self) -> f64 {
        let [x, y, z] = self.acc;
        (x * x + y * y + z * z).sqrt()
    }

    /// 转换为遥测报文体
    pub fn to_reading(&self, user_id: &str, timestamp: String) -> ImuReading {
        ImuReading {
            user_id: user_id.to_string(),
            timestamp,
            acc_x: self.acc[0],
            acc_y: self.acc[1],
            acc_z: self.acc[2],
            gyr_x: self.gyr[0],
            gyr_y: self.gyr[1],
            gyr_z: self.gyr[2],
        }
    }

    /// 转换为跌倒报文中的 `sensor_data` 字段
    pub fn sensor_data(&self) -> SensorData {
        SensorData {
            acceleration: Axis3 {
                x: self.acc[0],
                y: self.acc[1],
                z: self.acc[2],
            },
            gyroscope: Axis3 {
                x: self.gyr[0],
                y: self.gyr[1],
                z: self.gyr[2],
            },
        }
    }
}

impl From<&ImuReading> for SensorSample {
    fn from(reading: &ImuReading) -> Self {
        Self {
            acc: [reading.acc_x, reading.acc_y, reading.acc_z],
            gyr: [reading.gyr_x, reading.gyr_y, reading.gyr_z],
        }
    }
}
