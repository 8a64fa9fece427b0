//! Google Drive API client.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::Deserialize;
use url::Url;

use lexideck_common::{ContainerId, Error, FileId, Result};

use crate::remote::{ByteStream, DriveAbout, DriveApi, DriveFile, FileQuery, FOLDER_MIME_TYPE};

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// Fields requested for every file resource.
const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime,modifiedTime,parents,md5Checksum,trashed";
const LIST_FIELDS: &str =
    "files(id,name,mimeType,size,createdTime,modifiedTime,parents,md5Checksum,trashed),nextPageToken";

/// Response from listing files.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Error envelope returned by Google APIs.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Google Drive API client.
///
/// Stateless with respect to credentials: the access token is supplied per
/// call by the retrying wrapper.
pub struct DriveClient {
    http: Client,
    api_base: String,
    upload_base: String,
}

impl DriveClient {
    /// Create a client against the public Google endpoints.
    pub fn new() -> Result<Self> {
        Self::with_endpoints(DRIVE_API_BASE, DRIVE_UPLOAD_BASE)
    }

    /// Create a client against custom endpoints (emulators, proxies).
    pub fn with_endpoints(api_base: &str, upload_base: &str) -> Result<Self> {
        for base in [api_base, upload_base] {
            Url::parse(base)
                .map_err(|e| Error::Configuration(format!("Invalid endpoint {}: {}", base, e)))?;
        }

        let http = Client::builder()
            .user_agent("Lexideck/0.1")
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
        })
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    /// Handle API response with error checking.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::Network(format!("Failed to parse response: {}", e)));
        }

        Err(Self::error_for(status, response).await)
    }

    /// Map a failed response to the error taxonomy.
    ///
    /// A 401 or an `UNAUTHENTICATED` status field both count as an
    /// authentication failure.
    async fn error_for(status: StatusCode, response: reqwest::Response) -> Error {
        let body = response.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ApiErrorBody>(&body).ok();
        let unauthenticated = parsed
            .as_ref()
            .and_then(|b| b.error.status.as_deref())
            .is_some_and(|s| s == "UNAUTHENTICATED");
        let message = parsed
            .map(|b| b.error.message)
            .filter(|m| !m.is_empty())
            .unwrap_or(body);

        if status == StatusCode::UNAUTHORIZED || unauthenticated {
            Error::Authentication(format!("Invalid or expired token: {}", message))
        } else if status == StatusCode::NOT_FOUND {
            Error::NotFound(format!("Resource not found: {}", message))
        } else if status == StatusCode::FORBIDDEN {
            Error::PermissionDenied(message)
        } else {
            Error::Network(format!("API error: {} - {}", status, message))
        }
    }

    /// Build a multipart/related body carrying metadata and content.
    fn multipart_body(metadata: &serde_json::Value, data: &[u8], mime_type: &str) -> Result<(String, Vec<u8>)> {
        let boundary = format!("lexideck-{}", uuid::Uuid::new_v4().simple());
        let metadata_json = serde_json::to_string(metadata)?;

        let mut body = Vec::with_capacity(data.len() + metadata_json.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata_json.as_bytes());
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");

        body.extend_from_slice(format!("--{}--", boundary).as_bytes());

        Ok((boundary, body))
    }
}

#[async_trait]
impl DriveApi for DriveClient {
    fn name(&self) -> &str {
        "gdrive"
    }

    async fn list(&self, token: &str, query: &FileQuery) -> Result<Vec<DriveFile>> {
        let url = format!("{}/files", self.api_base);
        let q = query.to_drive_query();
        let page_size = if query.name.is_some() { "10" } else { "1000" };

        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, Self::bearer(token))
                .query(&[
                    ("q", q.as_str()),
                    ("fields", LIST_FIELDS),
                    ("pageSize", page_size),
                    ("spaces", "drive"),
                ]);

            if let Some(page) = &page_token {
                request = request.query(&[("pageToken", page.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to list files: {}", e)))?;

            let list_response: FileListResponse = self.handle_response(response).await?;
            all_files.extend(list_response.files);

            match list_response.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(all_files)
    }

    async fn create_folder(
        &self,
        token: &str,
        name: &str,
        parent: &ContainerId,
    ) -> Result<DriveFile> {
        let url = format!("{}/files", self.api_base);
        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent.as_str()],
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to create folder: {}", e)))?;

        self.handle_response(response).await
    }

    async fn create_file(
        &self,
        token: &str,
        name: &str,
        parent: &ContainerId,
        data: Vec<u8>,
        mime_type: &str,
    ) -> Result<DriveFile> {
        let url = format!("{}/files", self.upload_base);
        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent.as_str()],
        });
        let (boundary, body) = Self::multipart_body(&metadata, &data, mime_type)?;

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload file: {}", e)))?;

        self.handle_response(response).await
    }

    async fn download(&self, token: &str, file_id: &FileId) -> Result<Vec<u8>> {
        let url = format!("{}/files/{}", self.api_base, file_id);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to download file: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_for(status, response).await);
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| Error::Network(format!("Failed to read download response: {}", e)))
    }

    async fn download_stream(&self, token: &str, file_id: &FileId) -> Result<ByteStream> {
        let url = format!("{}/files/{}", self.api_base, file_id);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start download: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_for(status, response).await);
        }

        let stream = response
            .bytes_stream()
            .map(|result| result.map_err(|e| Error::Network(format!("Stream read error: {}", e))));

        Ok(Box::pin(stream))
    }

    async fn delete(&self, token: &str, file_id: &FileId) -> Result<()> {
        let url = format!("{}/files/{}", self.api_base, file_id);

        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete file: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::error_for(status, response).await)
        }
    }

    async fn about(&self, token: &str) -> Result<DriveAbout> {
        let url = format!("{}/about", self.api_base);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, Self::bearer(token))
            .query(&[("fields", "user(displayName,emailAddress),storageQuota(limit,usage)")])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to query account: {}", e)))?;

        self.handle_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_rejects_bad_endpoint() {
        assert!(matches!(
            DriveClient::with_endpoints("not a url", DRIVE_UPLOAD_BASE),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_client_trims_endpoint() {
        let client =
            DriveClient::with_endpoints("http://127.0.0.1:9000/drive/v3/", DRIVE_UPLOAD_BASE)
                .unwrap();
        assert_eq!(client.api_base, "http://127.0.0.1:9000/drive/v3");
        assert_eq!(client.name(), "gdrive");
    }

    #[test]
    fn test_multipart_body_layout() {
        let metadata = serde_json::json!({ "name": "a.txt", "parents": ["p"] });
        let (boundary, body) =
            DriveClient::multipart_body(&metadata, b"hi", "text/plain").unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(text.starts_with(&format!("--{}\r\n", boundary)));
        assert!(text.contains("\"name\":\"a.txt\""));
        assert!(text.contains("Content-Type: text/plain\r\n\r\nhi\r\n"));
        assert!(text.ends_with(&format!("--{}--", boundary)));
    }

    #[test]
    fn test_api_error_body_parsing() {
        let body = r#"{"error":{"code":401,"message":"Invalid Credentials","status":"UNAUTHENTICATED"}}"#;
        let parsed: ApiErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.error.status.as_deref(), Some("UNAUTHENTICATED"));
        assert_eq!(parsed.error.message, "Invalid Credentials");
    }
}
