//! Function upload pipeline: multipart parsing, descriptor validation,
//! staging under a unique id, and the compile invocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::stream;
use thiserror::Error;
use tracing::info;

use crate::compiler::{CompileDriver, CompileError};
use crate::descriptor::Runtime;

const PART_CODE: &str = "code";
const PART_DESCRIPTOR: &str = "descriptor";
const ALLOWED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "DELETE", "PATCH"];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Content-Type must be multipart/form-data")]
    NotMultipart,
    #[error("no boundary in Content-Type")]
    NoBoundary,
    #[error("failed to parse multipart upload: {0}")]
    Multipart(#[from] multer::Error),
    #[error("Missing code or descriptor file")]
    MissingParts,
    #[error("more than one part named '{0}'")]
    DuplicatePart(&'static str),
    #[error("invalid descriptor: {details}")]
    InvalidDescriptor { details: String },
    #[error("failed to stage upload: {0}")]
    Staging(#[from] std::io::Error),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl UploadError {
    /// The `{status, message, details}` body upload clients receive.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let (message, details) = match self {
            Self::InvalidDescriptor { details } => ("Invalid descriptor", details.clone()),
            Self::Compile(err) => (
                "Compilation failed",
                format!("Compilation failed (error code: {})", err.code()),
            ),
            other => ("Upload failed", other.to_string()),
        };
        serde_json::json!({
            "status": "error",
            "message": message,
            "details": details,
        })
    }
}

/// Successful upload, as reported to the client.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub id: String,
    pub uri: String,
    pub method: String,
    pub info: String,
}

impl UploadReceipt {
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "message": "Function compiled and deployed",
            "uri": self.uri,
            "method": self.method,
            "info": self.info,
        })
    }
}

/// Descriptor fields checked before anything touches the filesystem.
#[derive(Debug)]
struct ValidatedDescriptor {
    runtime: Runtime,
}

fn invalid(details: impl Into<String>) -> UploadError {
    UploadError::InvalidDescriptor {
        details: details.into(),
    }
}

/// Syntactic descriptor validation. Runs before staging so a rejected upload
/// leaves no files behind.
fn validate_descriptor(raw: &[u8]) -> Result<ValidatedDescriptor, UploadError> {
    if raw.is_empty() {
        return Err(invalid("Descriptor is empty"));
    }
    if raw[0] != b'{' {
        return Err(invalid("Descriptor must be a JSON object starting with '{'"));
    }
    let value: serde_json::Value =
        serde_json::from_slice(raw).map_err(|_| invalid("Descriptor is not valid JSON"))?;

    let Some(runtime_value) = value.get("runtime") else {
        return Err(invalid("Missing required field: 'runtime'"));
    };
    let Some(runtime_tag) = runtime_value.as_str() else {
        return Err(invalid("Runtime must be a string"));
    };
    let runtime = Runtime::parse(runtime_tag).map_err(|_| {
        invalid(format!(
            "Invalid or unsupported runtime '{runtime_tag}'. Supported: {}",
            Runtime::TAGS.join(", ")
        ))
    })?;

    for field in ["memory", "timeout"] {
        if let Some(v) = value.get(field) {
            let numeric = v.as_u64().is_some() || v.as_f64().is_some_and(|f| f >= 0.0);
            if !numeric {
                return Err(invalid(format!("Field '{field}' must be a number")));
            }
        }
    }

    if let Some(method) = value.get("method") {
        let valid = method
            .as_str()
            .is_some_and(|m| ALLOWED_METHODS.contains(&m));
        if !valid {
            return Err(invalid(format!(
                "Invalid method. Supported: {}",
                ALLOWED_METHODS.join(", ")
            )));
        }
    }

    Ok(ValidatedDescriptor { runtime })
}

/// Extract the `code` and `descriptor` parts. Unrecognized parts are
/// ignored; a duplicated recognized part is malformed.
async fn parse_parts(
    content_type: &str,
    body: Bytes,
) -> Result<(Bytes, Bytes), UploadError> {
    if !content_type.contains("multipart/form-data") {
        return Err(UploadError::NotMultipart);
    }
    let boundary = multer::parse_boundary(content_type).map_err(|_| UploadError::NoBoundary)?;

    let one_shot = stream::once(async move { Ok::<Bytes, std::convert::Infallible>(body) });
    let mut multipart = multer::Multipart::new(one_shot, boundary);

    let mut code: Option<Bytes> = None;
    let mut descriptor: Option<Bytes> = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(PART_CODE) => {
                if code.is_some() {
                    return Err(UploadError::DuplicatePart(PART_CODE));
                }
                code = Some(field.bytes().await?);
            }
            Some(PART_DESCRIPTOR) => {
                if descriptor.is_some() {
                    return Err(UploadError::DuplicatePart(PART_DESCRIPTOR));
                }
                descriptor = Some(field.bytes().await?);
            }
            _ => {
                // Drain so the parser can advance past the part.
                let _ = field.bytes().await?;
            }
        }
    }

    match (code, descriptor) {
        (Some(code), Some(descriptor)) => Ok((code, descriptor)),
        _ => Err(UploadError::MissingParts),
    }
}

pub struct UploadPipeline {
    staging_dir: std::path::PathBuf,
    driver: CompileDriver,
    poll_interval: Duration,
    counter: AtomicU64,
}

impl UploadPipeline {
    #[must_use]
    pub fn new(
        staging_dir: impl Into<std::path::PathBuf>,
        driver: CompileDriver,
        poll_interval: Duration,
    ) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            driver,
            poll_interval,
            counter: AtomicU64::new(0),
        }
    }

    /// Unique staging id: wall-clock second, pipeline-local sequence, and a
    /// short pid so concurrent gateways cannot collide.
    fn mint_id(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let pid = std::process::id() % 1000;
        format!("func_{now}_{seq}_{pid}")
    }

    /// Run the full pipeline for one `POST /upload` body: parse, validate,
    /// stage, compile. The staging directory is shared and never cleared.
    pub async fn process(
        &self,
        content_type: &str,
        body: Bytes,
    ) -> Result<UploadReceipt, UploadError> {
        let (code, descriptor) = parse_parts(content_type, body).await?;
        let validated = validate_descriptor(&descriptor)?;

        let id = self.mint_id();
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let code_path = self
            .staging_dir
            .join(format!("{id}.{}", validated.runtime.extension()));
        tokio::fs::write(&code_path, &code).await?;
        let descriptor_path = self.staging_dir.join(format!("{id}_descriptor.json"));
        tokio::fs::write(&descriptor_path, &descriptor).await?;
        info!(%id, code = %code_path.display(), "upload staged");

        let deployment = self.driver.compile(&id).await?;

        Ok(UploadReceipt {
            uri: format!("/api/{id}"),
            id,
            method: deployment.method,
            info: format!(
                "Will be available in <{} seconds",
                self.poll_interval.as_secs()
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    const BOUNDARY: &str = "------------------------fngwtest";

    fn multipart_body(parts: &[(&str, &str, &[u8])]) -> (String, Bytes) {
        let content_type = format!("multipart/form-data; boundary={BOUNDARY}");
        let mut body = Vec::new();
        for (name, filename, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            if filename.is_empty() {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
            } else {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\r\n"
                    )
                    .as_bytes(),
                );
            }
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        (content_type, Bytes::from(body))
    }

    fn pipeline() -> (tempfile::TempDir, UploadPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let driver = CompileDriver::new(
            &staging,
            dir.path().join("out"),
            dir.path().join("sidecars"),
            Registry::new(dir.path().join("meta.db")),
        );
        let pipeline = UploadPipeline::new(staging, driver, Duration::from_secs(5));
        (dir, pipeline)
    }

    #[tokio::test]
    async fn wasm_upload_end_to_end() {
        let (dir, pipeline) = pipeline();
        let (ct, body) = multipart_body(&[
            ("code", "f.wasm", b"\0asm".as_slice()),
            ("descriptor", "d.json", br#"{"runtime":"wasm"}"#.as_slice()),
        ]);

        let receipt = pipeline.process(&ct, body).await.unwrap();
        assert_eq!(receipt.uri, format!("/api/{}", receipt.id));
        assert_eq!(receipt.method, "POST");
        assert!(receipt.info.contains("<5 seconds"));

        let module = dir
            .path()
            .join("out")
            .join(&receipt.id)
            .join("module.wasm");
        assert_eq!(std::fs::read(module).unwrap(), b"\0asm");

        let json = receipt.to_json();
        assert_eq!(json["status"], "success");
        assert_eq!(json["uri"], receipt.uri.as_str());
    }

    #[tokio::test]
    async fn missing_descriptor_part_is_rejected() {
        let (dir, pipeline) = pipeline();
        let (ct, body) = multipart_body(&[("code", "f.wasm", b"\0asm".as_slice())]);
        let err = pipeline.process(&ct, body).await.unwrap_err();
        assert!(matches!(err, UploadError::MissingParts));
        assert_eq!(err.to_json()["details"], "Missing code or descriptor file");
        // Nothing staged.
        assert!(!dir.path().join("staging").exists());
    }

    #[tokio::test]
    async fn zero_recognized_parts_is_rejected() {
        let (_dir, pipeline) = pipeline();
        let (ct, body) = multipart_body(&[("other", "", b"x".as_slice())]);
        assert!(matches!(
            pipeline.process(&ct, body).await.unwrap_err(),
            UploadError::MissingParts
        ));
    }

    #[tokio::test]
    async fn three_parts_with_duplicate_code_are_rejected() {
        let (_dir, pipeline) = pipeline();
        let (ct, body) = multipart_body(&[
            ("code", "a.wasm", b"1".as_slice()),
            ("code", "b.wasm", b"2".as_slice()),
            ("descriptor", "d.json", br#"{"runtime":"wasm"}"#.as_slice()),
        ]);
        assert!(matches!(
            pipeline.process(&ct, body).await.unwrap_err(),
            UploadError::DuplicatePart("code")
        ));
    }

    #[tokio::test]
    async fn invalid_descriptor_leaves_no_staging_files() {
        let (dir, pipeline) = pipeline();
        let (ct, body) = multipart_body(&[
            ("code", "f.wasm", b"\0asm".as_slice()),
            ("descriptor", "d.json", br#"{"memory":"big"}"#.as_slice()),
        ]);
        let err = pipeline.process(&ct, body).await.unwrap_err();
        let details = err.to_json()["details"].as_str().unwrap().to_owned();
        assert!(details.contains("runtime"), "details: {details}");
        assert!(!dir.path().join("staging").exists());
    }

    #[tokio::test]
    async fn non_multipart_content_type_is_rejected() {
        let (_dir, pipeline) = pipeline();
        assert!(matches!(
            pipeline
                .process("application/json", Bytes::from_static(b"{}"))
                .await
                .unwrap_err(),
            UploadError::NotMultipart
        ));
    }

    #[test]
    fn descriptor_validation_rules() {
        assert!(validate_descriptor(br#"{"runtime":"wasm"}"#).is_ok());
        assert!(validate_descriptor(br#"{"runtime":"c","memory":128,"timeout":5}"#).is_ok());
        assert!(
            validate_descriptor(br#"{"runtime":"wasm","method":"DELETE"}"#).is_ok()
        );

        let cases: [(&[u8], &str); 7] = [
            (b"".as_slice(), "empty"),
            (b"[1]".as_slice(), "starting with '{'"),
            (br#"{"name":"x"}"#.as_slice(), "runtime"),
            (br#"{"runtime":"cobol"}"#.as_slice(), "unsupported runtime"),
            (br#"{"runtime":"wasm","memory":"big"}"#.as_slice(), "'memory'"),
            (br#"{"runtime":"wasm","timeout":"-"}"#.as_slice(), "'timeout'"),
            (br#"{"runtime":"wasm","method":"BREW"}"#.as_slice(), "Invalid method"),
        ];
        for (raw, needle) in cases {
            let err = validate_descriptor(raw).unwrap_err();
            let UploadError::InvalidDescriptor { details } = err else {
                panic!("expected validation error");
            };
            assert!(details.contains(needle), "{details} missing {needle}");
        }
    }

    #[test]
    fn minted_ids_are_unique_and_well_formed() {
        let (_dir, pipeline) = pipeline();
        let a = pipeline.mint_id();
        let b = pipeline.mint_id();
        assert_ne!(a, b);
        assert!(a.starts_with("func_"));
        assert_eq!(a.split('_').count(), 4);
    }
}
