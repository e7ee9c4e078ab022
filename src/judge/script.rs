use std::path::Path;

use anyhow::Context;

/// Loads the batch-runner script shipped next to the worker binary.
///
/// The script is read once per judgement job; a missing or unreadable
/// script fails the affected case sets as UnknownError.
pub async fn load_judge_script(path: &Path) -> anyhow::Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read batch-runner script at {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reads_script_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho hi\n").unwrap();
        let script = load_judge_script(file.path()).await.unwrap();
        assert_eq!(script, b"#!/bin/sh\necho hi\n");
    }

    #[tokio::test]
    async fn missing_script_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_judge_script(&dir.path().join("judge.sh"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("batch-runner script"));
    }
}
