//! 运动分析层错误类型定义

use thiserror::Error;

/// 分类器错误
///
/// 调用方（[`FallScorer`](crate::FallScorer)）把它降级为“本周期无判定”，从不向上传播。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    /// 模型不可用（未加载、推理失败等）
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),

    /// 输出不是合法概率
    #[error("Classifier returned invalid probability: {0}")]
    InvalidOutput(f64),

    /// 缓冲区尚未填满
    #[error("Feature buffer not full ({len}/{required})")]
    BufferNotFull { len: usize, required: usize },
}

/// 运动分析层错误类型
#[derive(Error, Debug)]
pub enum MotionError {
    /// 配置不合法
    #[error("Invalid motion config: {0}")]
    InvalidConfig(String),

    /// 分类器错误
    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MotionError::InvalidConfig("window_size must be > 0".into());
        assert_eq!(err.to_string(), "Invalid motion config: window_size must be > 0");

        let err: MotionError = ClassifierError::BufferNotFull {
            len: 10,
            required: 150,
        }
        .into();
        assert!(err.to_string().contains("10/150"));
    }
}
