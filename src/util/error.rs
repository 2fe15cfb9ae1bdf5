/// バッグ処理のエラー分類ユーティリティ。
use thiserror::Error;

/// バッグ読み込み・グラフ構築・モデル実行で発生するエラー。
#[derive(Debug, Error)]
pub enum MilError {
    /// Feature or edge data is missing, malformed or inconsistent with the configured dimension.
    #[error("data error in {location}: {reason}")]
    Data { location: String, reason: String },
    /// インスタンスを持たないバッグ
    #[error("bag {bag_id} has no instances")]
    EmptyBag { bag_id: String },
    /// Tensor shapes disagree with the model's weights.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        actual: String,
    },
    /// A recognized but unimplemented convolution or aggregator variant.
    #[error("unsupported {kind} variant '{name}': not yet implemented")]
    UnsupportedPolicy { kind: &'static str, name: String },
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type MilResult<T> = Result<T, MilError>;

impl MilError {
    pub(crate) fn data(location: impl ToString, reason: impl Into<String>) -> Self {
        Self::Data {
            location: location.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(
        context: &'static str,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Classifies the error by how far it propagates.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        classify_error(self)
    }
}

/// エラーの種類。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 当該バッグのみ中断（スキップし、リトライしない）
    BagLocal,
    /// 設定・モデルのエラー（実行全体を停止）
    Fatal,
}

/// エラーがバッグ単位か実行全体に致命的かを判定する。
#[must_use]
pub fn classify_error(error: &MilError) -> ErrorKind {
    match error {
        MilError::Data { .. } | MilError::EmptyBag { .. } | MilError::Csv(_) => {
            ErrorKind::BagLocal
        }
        // 特徴量ファイルが存在しない場合はI/Oエラーとして現れる
        MilError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => ErrorKind::BagLocal,
        MilError::ShapeMismatch { .. }
        | MilError::UnsupportedPolicy { .. }
        | MilError::Tensor(_)
        | MilError::Io(_)
        | MilError::Json(_) => ErrorKind::Fatal,
    }
}

/// バッグをスキップできるかどうか。
#[must_use]
pub fn is_bag_local(error: &MilError) -> bool {
    matches!(classify_error(error), ErrorKind::BagLocal)
}
