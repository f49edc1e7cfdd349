//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps workflow submission, history, file transfer, interruption, memory
//! release and introspection (`/system_stats`, `/queue`, `/object_info`)
//! using [`reqwest`].

use serde::Deserialize;

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
    auth_token: Option<String>,
}

/// Response returned by the ComfyUI `/prompt` endpoint after
/// successfully queuing a workflow.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue.
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub node_errors: serde_json::Value,
}

/// Response of `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
}

impl UploadResponse {
    /// Reference usable as a `LoadImage` input (`subfolder/name` or `name`).
    pub fn reference(&self) -> String {
        if self.subfolder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.subfolder, self.name)
        }
    }
}

/// Subset of `GET /system_stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemStatsResponse {
    #[serde(default)]
    pub system: serde_json::Value,
    #[serde(default)]
    pub devices: Vec<DeviceStats>,
}

/// One compute device from `/system_stats`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceStats {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub vram_total: u64,
    #[serde(default)]
    pub vram_free: u64,
}

/// Subset of `GET /queue`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueResponse {
    #[serde(default)]
    pub queue_running: Vec<serde_json::Value>,
    #[serde(default)]
    pub queue_pending: Vec<serde_json::Value>,
}

impl QueueResponse {
    pub fn depth(&self) -> u32 {
        (self.queue_running.len() + self.queue_pending.len()) as u32
    }
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// ComfyUI returned a non-2xx status code.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// The workflow failed validation on the server (`node_errors`).
    #[error("Workflow rejected: {message}")]
    Rejected {
        message: String,
        node_errors: serde_json::Value,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8188`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Create an API client reusing an existing [`reqwest::Client`]
    /// (useful for connection pooling across multiple instances).
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            auth_token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` on every request.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Submit a workflow for execution.
    ///
    /// Sends `POST /prompt` with the workflow and client id. A response
    /// carrying non-empty `node_errors` (either as a 400 body or alongside a
    /// 200) becomes [`ComfyUIApiError::Rejected`].
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self.post("/prompt").json(&body).send().await?;
        let status = response.status();
        if status.as_u16() == 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(rejection_from_body(&text).unwrap_or(ComfyUIApiError::ApiError {
                status: 400,
                body: text,
            }));
        }

        let submitted: SubmitResponse = Self::parse_response(response).await?;
        if has_node_errors(&submitted.node_errors) {
            return Err(ComfyUIApiError::Rejected {
                message: "workflow failed validation".to_string(),
                node_errors: submitted.node_errors,
            });
        }
        Ok(submitted)
    }

    /// Interrupt the currently running execution immediately.
    ///
    /// Sends a `POST /interrupt` request.  This does not target a
    /// specific prompt -- it interrupts whatever is executing right now.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let response = self.post("/interrupt").send().await?;
        Self::check_status(response).await
    }

    /// Ask the server to unload models and free memory.
    pub async fn free(&self) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({ "unload_models": true, "free_memory": true });
        let response = self.post("/free").json(&body).send().await?;
        Self::check_status(response).await
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request.  The returned JSON
    /// contains output file references, node results, and timing data.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self.get(&format!("/history/{prompt_id}")).send().await?;
        Self::parse_response(response).await
    }

    /// Fetch a produced file via `GET /view`.
    pub async fn view(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .get("/view")
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", kind)])
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Upload an input file via multipart `POST /upload/image`.
    pub async fn upload_image(
        &self,
        file_name: &str,
        bytes: Vec<u8>,
        subfolder: &str,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("subfolder", subfolder.to_string())
            .text("type", "input")
            .text("overwrite", "true");

        let response = self.post("/upload/image").multipart(form).send().await?;
        Self::parse_response(response).await
    }

    pub async fn system_stats(&self) -> Result<SystemStatsResponse, ComfyUIApiError> {
        let response = self.get("/system_stats").send().await?;
        Self::parse_response(response).await
    }

    pub async fn queue(&self) -> Result<QueueResponse, ComfyUIApiError> {
        let response = self.get("/queue").send().await?;
        Self::parse_response(response).await
    }

    /// `GET /object_info` or `GET /object_info/{class_type}`.
    pub async fn object_info(
        &self,
        class_type: Option<&str>,
    ) -> Result<serde_json::Value, ComfyUIApiError> {
        let path = match class_type {
            Some(class) => format!("/object_info/{class}"),
            None => "/object_info".to_string(),
        };
        let response = self.get(&path).send().await?;
        Self::parse_response(response).await
    }

    // ---- private helpers ----

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(format!("{}{path}", self.api_url)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(format!("{}{path}", self.api_url)))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`ComfyUIApiError::ApiError`]
    /// containing the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ComfyUIApiError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ComfyUIApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    /// Assert the response has a success status code, discarding the body.
    async fn check_status(response: reqwest::Response) -> Result<(), ComfyUIApiError> {
        Self::ensure_success(response).await?;
        Ok(())
    }
}

fn has_node_errors(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => !map.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Null => false,
        _ => true,
    }
}

/// Interpret a 400 body of the form `{"error": {...}, "node_errors": {...}}`.
fn rejection_from_body(body: &str) -> Option<ComfyUIApiError> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let node_errors = value.get("node_errors").cloned().unwrap_or_default();
    let message = value
        .get("error")
        .and_then(|e| e.get("message").and_then(|m| m.as_str()).or_else(|| e.as_str()))
        .unwrap_or("workflow failed validation")
        .to_string();
    if value.get("error").is_none() && !has_node_errors(&node_errors) {
        return None;
    }
    Some(ComfyUIApiError::Rejected {
        message,
        node_errors,
    })
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}
