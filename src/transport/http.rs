//! Request/response endpoints of the agent backend

use super::TransportError;
use crate::protocol::ChatRequest;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest attachment accepted by the backend
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

const ALLOWED_ATTACHMENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "text/plain",
];

/// Result of a liveness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentStatus {
    Online { detail: String },
    Offline { reason: String },
}

impl AgentStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, AgentStatus::Online { .. })
    }
}

/// A file validated for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub path: PathBuf,
    pub file_name: String,
    pub mime: String,
    pub size: u64,
}

/// Check type and size before anything is sent
pub fn validate_attachment(path: &Path) -> Result<Attachment, TransportError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransportError::invalid_request(format!("Not a file: {}", path.display())))?;

    let mime = mime_guess::from_path(path)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string();
    if !ALLOWED_ATTACHMENT_TYPES.contains(&mime.as_str()) {
        return Err(TransportError::invalid_request(format!(
            "Unsupported file type {mime} for {file_name}; supported: PDF, DOC, DOCX, TXT"
        )));
    }

    let size = std::fs::metadata(path)
        .map_err(|e| TransportError::invalid_request(format!("Cannot read {file_name}: {e}")))?
        .len();
    if size > MAX_ATTACHMENT_BYTES {
        return Err(TransportError::invalid_request(format!(
            "{file_name} exceeds the 10MB limit"
        )));
    }

    Ok(Attachment {
        path: path.to_path_buf(),
        file_name,
        mime,
        size,
    })
}

/// HTTP client for the backend's REST surface
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| TransportError::network(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `POST /chat`; the reply body is the agent's answer (or a placeholder)
    pub async fn submit_message(&self, session_id: &str, text: &str) -> Result<String, TransportError> {
        let request = ChatRequest {
            chat: text.to_string(),
            session_id: session_id.to_string(),
        };
        tracing::debug!(session_id = %session_id, "POST chat");
        let response = self
            .client
            .post(self.url("chat"))
            .json(&request)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        read_text(response).await
    }

    /// `POST /form/submit`
    pub async fn submit_form(&self, session_id: &str, form: &Value) -> Result<String, TransportError> {
        let body = crate::protocol::FormSubmission {
            session_id: session_id.to_string(),
            form: form.clone(),
        }
        .to_value();
        let response = self
            .client
            .post(self.url("form/submit"))
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        read_text(response).await
    }

    /// `GET /status`; any failure reads as offline
    pub async fn request_status(&self) -> AgentStatus {
        let response = match self.client.get(self.url("status")).send().await {
            Ok(response) => response,
            Err(e) => {
                return AgentStatus::Offline {
                    reason: TransportError::from_reqwest(&e).message,
                }
            }
        };
        match read_text(response).await {
            Ok(detail) => AgentStatus::Online { detail },
            Err(e) => AgentStatus::Offline { reason: e.message },
        }
    }

    /// `GET /models`
    pub async fn available_models(&self) -> Result<String, TransportError> {
        let response = self
            .client
            .get(self.url("models"))
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        read_text(response).await
    }

    /// Multipart `POST /upload-travel-plan`, field `files`
    pub async fn upload_attachment(
        &self,
        session_id: &str,
        paths: &[PathBuf],
    ) -> Result<String, TransportError> {
        if paths.is_empty() {
            return Err(TransportError::invalid_request("No files to upload"));
        }
        let attachments = paths
            .iter()
            .map(|p| validate_attachment(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut form = Form::new().text("sessionId", session_id.to_string());
        for attachment in &attachments {
            let bytes = tokio::fs::read(&attachment.path).await.map_err(|e| {
                TransportError::invalid_request(format!("Cannot read {}: {e}", attachment.file_name))
            })?;
            let part = Part::bytes(bytes)
                .file_name(attachment.file_name.clone())
                .mime_str(&attachment.mime)
                .map_err(|e| TransportError::invalid_request(e.to_string()))?;
            form = form.part("files", part);
        }

        tracing::info!(session_id = %session_id, files = attachments.len(), "Uploading attachments");
        let response = self
            .client
            .post(self.url("upload-travel-plan"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        read_text(response).await
    }

    /// `GET /result/{session}`: `Some` once the result is ready
    pub async fn poll_result(&self, session_id: &str) -> Result<Option<String>, TransportError> {
        let response = self
            .client
            .get(self.url(&format!("result/{session_id}")))
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            _ => {
                let text = read_text(response).await?;
                Ok((!text.trim().is_empty()).then_some(text))
            }
        }
    }

    /// `DELETE /sessions/{session}`
    pub async fn clear_session(&self, session_id: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .delete(self.url(&format!("sessions/{session_id}")))
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(&e))?;
        read_text(response).await.map(|_| ())
    }
}

async fn read_text(response: reqwest::Response) -> Result<String, TransportError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| TransportError::from_reqwest(&e))?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(TransportError::from_status(status.as_u16(), &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportErrorKind;
    use std::io::Write;

    #[test]
    fn test_url_joining() {
        let backend = HttpBackend::new("http://localhost:8080/api/traveling/", Duration::from_secs(5)).unwrap();
        assert_eq!(backend.url("chat"), "http://localhost:8080/api/traveling/chat");
        assert_eq!(
            backend.url("/result/s1"),
            "http://localhost:8080/api/traveling/result/s1"
        );
    }

    #[test]
    fn test_accepts_supported_types() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["plan.pdf", "plan.txt", "plan.docx", "plan.doc"] {
            let path = dir.path().join(name);
            std::fs::File::create(&path).unwrap().write_all(b"itinerary").unwrap();
            let attachment = validate_attachment(&path).unwrap();
            assert_eq!(attachment.file_name, name);
            assert_eq!(attachment.size, 9);
        }
    }

    #[test]
    fn test_rejects_unsupported_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        std::fs::write(&path, b"png").unwrap();
        let err = validate_attachment(&path).unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidRequest);
        assert!(err.message.contains("Unsupported file type"));
    }

    #[test]
    fn test_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(MAX_ATTACHMENT_BYTES + 1).unwrap();
        let err = validate_attachment(&path).unwrap_err();
        assert!(err.message.contains("10MB"));
    }

    #[test]
    fn test_missing_file() {
        let err = validate_attachment(Path::new("/nonexistent/plan.pdf")).unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::InvalidRequest);
    }
}
