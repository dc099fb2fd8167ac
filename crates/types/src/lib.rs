//! # Upload Relay 共有型定義
//!
//! アップロード結果をクライアントとGatewayの間で共有するためのデータ構造。
//! `POST /upload` のJSONレスポンスと `GET /test` のレスポンスで使用する。

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// パート単位の結果
// ---------------------------------------------------------------------------

/// 1ファイルの配送結果の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// リモートストレージがオブジェクト作成を確認した
    Succeeded,
    /// 配送に失敗した（理由は `UploadOutcome::error`）
    Failed,
}

/// 1つのアップロードパートをリモートストレージへ配送した結果。
/// 作成後は不変。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// クライアントが送信した元のファイル名
    pub file_name: String,
    /// 配送状態
    pub status: OutcomeStatus,
    /// リモートオブジェクトID（成功時のみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// 失敗理由（失敗時のみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadOutcome {
    pub fn succeeded(file_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            status: OutcomeStatus::Succeeded,
            object_id: Some(object_id.into()),
            error: None,
        }
    }

    pub fn failed(file_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            status: OutcomeStatus::Failed,
            object_id: None,
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

// ---------------------------------------------------------------------------
// リクエスト単位の集計
// ---------------------------------------------------------------------------

/// 1リクエスト内の全パートの結果。
///
/// `outcomes` はパートの発見順。`succeeded + failed == outcomes.len()` は
/// `push` のみで要素を追加することで保たれる。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    outcomes: Vec<UploadOutcome>,
    succeeded: usize,
    failed: usize,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// 結果を発見順の末尾に追加する。
    pub fn push(&mut self, outcome: UploadOutcome) {
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn outcomes(&self) -> &[UploadOutcome] {
        &self.outcomes
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    /// 失敗した結果のみを発見順で返す。
    pub fn failures(&self) -> impl Iterator<Item = &UploadOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }
}

impl FromIterator<UploadOutcome> for BatchResult {
    fn from_iter<I: IntoIterator<Item = UploadOutcome>>(iter: I) -> Self {
        let mut result = BatchResult::new();
        for outcome in iter {
            result.push(outcome);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// API レスポンス
// ---------------------------------------------------------------------------

/// POST /upload のJSONレスポンス（`Accept: application/json` 指定時）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    /// プレーンテキスト応答と同じ要約文
    pub message: String,
    /// パートごとの結果
    pub result: BatchResult,
    /// パート発見後に発生したmultipartの構文エラー
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

/// GET /test のレスポンス。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// 認証情報が利用可能か
    pub ready: bool,
    /// 認証情報の状態の説明
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_keeps_counts_in_sync() {
        let mut result = BatchResult::new();
        result.push(UploadOutcome::succeeded("a.jpg", "id-a"));
        result.push(UploadOutcome::failed("b.mp4", "boom"));
        result.push(UploadOutcome::succeeded("c.png", "id-c"));

        assert_eq!(result.len(), 3);
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        assert!(!result.all_succeeded());
        let failed: Vec<_> = result.failures().map(|o| o.file_name.as_str()).collect();
        assert_eq!(failed, vec!["b.mp4"]);
    }

    #[test]
    fn test_outcome_json_shape() {
        let ok = serde_json::to_value(UploadOutcome::succeeded("a.jpg", "id-a")).unwrap();
        assert_eq!(ok["status"], "succeeded");
        assert_eq!(ok["object_id"], "id-a");
        assert!(ok.get("error").is_none());

        let ng = serde_json::to_value(UploadOutcome::failed("b.mp4", "rejected")).unwrap();
        assert_eq!(ng["status"], "failed");
        assert_eq!(ng["error"], "rejected");
        assert!(ng.get("object_id").is_none());
    }

    #[test]
    fn test_batch_result_roundtrip_preserves_order() {
        let result: BatchResult = vec![
            UploadOutcome::failed("first", "x"),
            UploadOutcome::succeeded("second", "id"),
        ]
        .into_iter()
        .collect();

        let json = serde_json::to_string(&result).unwrap();
        let back: BatchResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
        assert_eq!(back.outcomes()[0].file_name, "first");
    }
}
