//! Case file loading
//!
//! 用例文件是 JSON 数组，每项一个轮次：
//! `{"conversation_id": "g1", "turn": 1, "question": "...", "expected_reply": "...", "inputs": {...}}`

use flowtest_core::{TestCase, validate_case_sequence};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Case file errors
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Case file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} contains no test cases")]
    Empty { path: PathBuf },

    #[error("Invalid case sequence in {path}: {}", .problems.join("; "))]
    Sequence { path: PathBuf, problems: Vec<String> },
}

/// 读取并校验用例文件
pub async fn load_cases(path: impl AsRef<Path>) -> Result<Vec<TestCase>, LoadError> {
    let path = path.as_ref();
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }
        Err(source) => {
            return Err(LoadError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let cases: Vec<TestCase> = serde_json::from_str(&content).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    if cases.is_empty() {
        return Err(LoadError::Empty {
            path: path.to_path_buf(),
        });
    }
    validate_case_sequence(&cases).map_err(|problems| LoadError::Sequence {
        path: path.to_path_buf(),
        problems,
    })?;

    info!(count = cases.len(), path = %path.display(), "Loaded test cases");
    Ok(cases)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CASES: &str = r#"[
        {"conversation_id": "g1", "turn": 1, "question": "Hi"},
        {"conversation_id": "g1", "turn": 2, "question": "And then?", "expected_reply": "More"},
        {"conversation_id": "g2", "turn": 1, "question": "Other", "inputs": {"lang": "en"}}
    ]"#;

    #[tokio::test]
    async fn test_load_cases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cases.json");
        std::fs::write(&path, CASES).unwrap();

        let cases = load_cases(&path).await.unwrap();
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[1].group, "g1");
        assert_eq!(cases[1].turn, 2);
        assert_eq!(cases[1].expected_reply.as_deref(), Some("More"));
        assert_eq!(cases[2].inputs["lang"], "en");
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = load_cases(dir.path().join("missing.json")).await.unwrap_err();
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_load_rejects_bad_json_and_empty_list() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            load_cases(&bad).await.unwrap_err(),
            LoadError::Parse { .. }
        ));

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "[]").unwrap();
        assert!(matches!(
            load_cases(&empty).await.unwrap_err(),
            LoadError::Empty { .. }
        ));
    }

    #[tokio::test]
    async fn test_load_rejects_turn_gap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gap.json");
        std::fs::write(
            &path,
            r#"[
                {"conversation_id": "g1", "turn": 1, "question": "a"},
                {"conversation_id": "g1", "turn": 3, "question": "b"}
            ]"#,
        )
        .unwrap();

        let err = load_cases(&path).await.unwrap_err();
        assert!(matches!(err, LoadError::Sequence { .. }));
        assert!(err.to_string().contains("gap.json"));
    }
}
