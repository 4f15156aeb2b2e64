//! File backend - JSON ドキュメントによる弱いフォールバック
//!
//! 関心ごとに 1 ドキュメント（reservations / heartbeats / message_queue）。
//! 書き込みは一時ファイル → rename で原子的に置き換える。
//! ファイルロックはしないので、プロセス間では read と write の間に競合ウィンドウがある。

pub mod runtime_state;

pub use self::runtime_state::FileRuntimeState;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::ErrorKind;
use std::path::Path;
use ulid::Ulid;

use crate::domain::LeaseError;

pub const RESERVATIONS_FILE: &str = "reservations.json";
pub const HEARTBEATS_FILE: &str = "heartbeats.json";
pub const MESSAGE_QUEUE_FILE: &str = "message_queue.json";

/// Read a document; a missing or empty file is the default value.
pub(crate) async fn read_document<T>(path: &Path) -> Result<T, LeaseError>
where
    T: DeserializeOwned + Default,
{
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
        Err(err) => Err(err.into()),
    }
}

/// Replace a document atomically: write a sibling temp file, then rename.
pub(crate) async fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<(), LeaseError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document.json");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Ulid::new()));
    let bytes = serde_json::to_vec_pretty(value)?;
    if let Err(err) = tokio::fs::write(&tmp, &bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn missing_and_empty_documents_read_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        let value: Vec<String> = read_document(&path).await.unwrap();
        assert!(value.is_empty());

        tokio::fs::write(&path, b"  \n").await.unwrap();
        let value: BTreeMap<String, i64> = read_document(&path).await.unwrap();
        assert!(value.is_empty());
    }

    #[tokio::test]
    async fn write_replaces_and_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        write_document(&path, &vec![1, 2, 3]).await.unwrap();
        write_document(&path, &vec![4]).await.unwrap();

        let value: Vec<i64> = read_document(&path).await.unwrap();
        assert_eq!(value, vec![4]);

        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["doc.json".to_string()]);
    }

    #[tokio::test]
    async fn corrupt_document_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        tokio::fs::write(&path, b"{oops").await.unwrap();
        let result: Result<Vec<i64>, _> = read_document(&path).await;
        assert!(matches!(result, Err(LeaseError::Json(_))));
    }
}
