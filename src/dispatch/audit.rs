use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

#[derive(Serialize)]
struct AuditLine<'a> {
    timestamp: String,
    client_id: &'a str,
    review_id: &'a str,
    response: &'a Value,
}

/// Append-only JSON-lines file of raw submission responses.
pub struct ResponseLog {
    path: PathBuf,
    write: Mutex<()>,
}

impl ResponseLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write failures are logged and swallowed.
    pub async fn append(&self, client_id: &str, review_id: &str, response: &Value) {
        if let Err(err) = self.try_append(client_id, review_id, response).await {
            error!(
                target = "reviews.dispatch",
                path = %self.path.display(),
                error = %err,
                "failed to append response log"
            );
        }
    }

    async fn try_append(
        &self,
        client_id: &str,
        review_id: &str,
        response: &Value,
    ) -> std::io::Result<()> {
        let line = AuditLine {
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            client_id,
            review_id,
            response,
        };
        let mut encoded = serde_json::to_string(&line).map_err(std::io::Error::other)?;
        encoded.push('\n');

        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(encoded.as_bytes()).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn appends_one_json_line_per_response() {
        let dir = std::env::temp_dir().join(format!("response-log-{}", uuid::Uuid::new_v4()));
        let log = ResponseLog::new(dir.join("nested/server_responses.txt"));
        log.append("42", "r1", &json!({ "comment_id": "c1" })).await;
        log.append("42", "r2", &json!({ "error": "boom" })).await;

        let content = tokio::fs::read_to_string(log.path()).await.unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["review_id"], "r1");
        assert_eq!(lines[1]["response"]["error"], "boom");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
