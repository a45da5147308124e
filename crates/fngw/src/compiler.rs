//! Compile driver: turns a staged upload into a deployable wasm artifact and
//! a registry row.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::descriptor::{Runtime, route_key};
use crate::registry::Registry;

const DEFAULT_METHOD: &str = "POST";
const SIDECAR_MEMORY_MIB: u32 = 128;
const SIDECAR_TIMEOUT_SECS: u32 = 5;

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("missing staged descriptor or code file for '{id}'")]
    Staging { id: String },
    #[error("cannot read staged descriptor: {0}")]
    Descriptor(#[source] std::io::Error),
    #[error("staged descriptor does not name a supported runtime")]
    Runtime,
    #[error("cannot create output directory: {0}")]
    OutputDir(#[source] std::io::Error),
    #[error("toolchain failed to launch: {0}")]
    Launch(#[source] std::io::Error),
    #[error("toolchain exited with code {code}")]
    Toolchain { code: i32 },
}

impl CompileError {
    /// Stable numeric code surfaced to upload clients.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Staging { .. } => 2,
            Self::Descriptor(_) => 3,
            Self::Runtime => 4,
            Self::OutputDir(_) => 5,
            Self::Launch(_) | Self::Toolchain { .. } => 7,
        }
    }
}

/// Outcome of a successful compile: the row the syncer will pick up.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub id: String,
    pub method: String,
    pub route_key: String,
    pub module: PathBuf,
}

/// The fields the driver needs from a staged descriptor.
#[derive(Debug, Deserialize)]
struct StagedDescriptor {
    runtime: String,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompileDriver {
    staging_dir: PathBuf,
    out_dir: PathBuf,
    sidecar_dir: PathBuf,
    registry: Registry,
}

/// Toolchain invocation for one runtime, or `None` for the verbatim-copy
/// path.
fn toolchain(runtime: Runtime, code: &Path, module: &Path) -> Option<Command> {
    let mut cmd;
    match runtime {
        Runtime::C => {
            cmd = Command::new("emcc");
            cmd.arg("-O2")
                .arg(code)
                .arg("-o")
                .arg(module)
                .args(["--no-entry", "-s", "STANDALONE_WASM"]);
        }
        Runtime::Cpp | Runtime::CppAlias => {
            cmd = Command::new("em++");
            cmd.arg("-O2")
                .arg(code)
                .arg("-o")
                .arg(module)
                .args(["--no-entry", "-s", "STANDALONE_WASM"]);
        }
        Runtime::Rust => {
            cmd = Command::new("rustc");
            cmd.args(["--target=wasm32-wasi", "-O", "-o"])
                .arg(module)
                .arg(code);
        }
        Runtime::Go | Runtime::TinyGo => {
            cmd = Command::new("tinygo");
            cmd.arg("build")
                .arg("-o")
                .arg(module)
                .args(["-target", "wasi"])
                .arg(code);
        }
        Runtime::Python => {
            cmd = Command::new("py2wasm");
            cmd.arg(code);
        }
        Runtime::Php => {
            cmd = Command::new("php-wasm-builder");
            cmd.arg(code).arg("-o").arg(module);
        }
        Runtime::Wasm => return None,
    }
    Some(cmd)
}

impl CompileDriver {
    #[must_use]
    pub fn new(
        staging_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        sidecar_dir: impl Into<PathBuf>,
        registry: Registry,
    ) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            out_dir: out_dir.into(),
            sidecar_dir: sidecar_dir.into(),
            registry,
        }
    }

    /// Locate the staged descriptor and code file for `id`.
    async fn find_staged(&self, id: &str) -> Result<(PathBuf, PathBuf), CompileError> {
        let descriptor_name = format!("{id}_descriptor.json");
        let mut descriptor = None;
        let mut code = None;

        let mut entries = tokio::fs::read_dir(&self.staging_dir)
            .await
            .map_err(|_| CompileError::Staging { id: id.to_owned() })?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(id) {
                continue;
            }
            if name == descriptor_name {
                descriptor = Some(entry.path());
            } else {
                code = Some(entry.path());
            }
            if descriptor.is_some() && code.is_some() {
                break;
            }
        }

        match (descriptor, code) {
            (Some(d), Some(c)) => Ok((d, c)),
            _ => Err(CompileError::Staging { id: id.to_owned() }),
        }
    }

    /// Compile the staged upload `id` into `<out>/<id>/module.wasm`, then
    /// record the sidecar and registry row. Staged files are left in place.
    pub async fn compile(&self, id: &str) -> Result<Deployment, CompileError> {
        let (descriptor_path, code_path) = self.find_staged(id).await?;

        let raw = tokio::fs::read(&descriptor_path)
            .await
            .map_err(CompileError::Descriptor)?;
        let staged: StagedDescriptor =
            serde_json::from_slice(&raw).map_err(|_| CompileError::Runtime)?;
        let runtime = Runtime::parse(&staged.runtime).map_err(|_| CompileError::Runtime)?;

        let out_dir = self.out_dir.join(id);
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(CompileError::OutputDir)?;
        let module = out_dir.join("module.wasm");

        info!(%id, %runtime, module = %module.display(), "compiling function");
        match toolchain(runtime, &code_path, &module) {
            Some(mut cmd) => {
                if runtime == Runtime::Python {
                    // py2wasm writes the artifact to stdout.
                    let out = std::fs::File::create(&module).map_err(CompileError::OutputDir)?;
                    cmd.stdout(Stdio::from(out));
                }
                let status = cmd.status().await.map_err(CompileError::Launch)?;
                if !status.success() {
                    return Err(CompileError::Toolchain {
                        code: status.code().unwrap_or(-1),
                    });
                }
            }
            None => {
                tokio::fs::copy(&code_path, &module)
                    .await
                    .map_err(CompileError::OutputDir)?;
            }
        }

        let method = staged
            .method
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_METHOD.to_owned());
        let deployment = Deployment {
            id: id.to_owned(),
            route_key: route_key(&method, &format!("/api/{id}")),
            method,
            module: module.clone(),
        };

        let row = serde_json::json!({
            "name": id,
            "runtime": "wasm",
            "module": module,
            "handler": id,
            "memory": SIDECAR_MEMORY_MIB,
            "timeout": SIDECAR_TIMEOUT_SECS,
        })
        .to_string();

        self.write_sidecar(id, &row).await;
        if let Err(err) = self.registry.ensure_schema().and_then(|()| {
            self.registry.upsert(&deployment.route_key, &row)
        }) {
            // The sidecar still names the artifact; the row can be replayed.
            warn!(%err, key = %deployment.route_key, "registry insert failed");
        } else {
            info!(key = %deployment.route_key, "function deployed");
        }

        Ok(deployment)
    }

    async fn write_sidecar(&self, id: &str, row: &str) {
        if let Err(err) = tokio::fs::create_dir_all(&self.sidecar_dir).await {
            warn!(%err, dir = %self.sidecar_dir.display(), "cannot create sidecar directory");
            return;
        }
        let path = self.sidecar_dir.join(format!("{id}.json"));
        if let Err(err) = tokio::fs::write(&path, format!("{row}\n")).await {
            warn!(%err, path = %path.display(), "cannot write sidecar");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        driver: CompileDriver,
        registry: Registry,
        staging: PathBuf,
        out: PathBuf,
        sidecars: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let out = dir.path().join("out");
        let sidecars = dir.path().join("sidecars");
        std::fs::create_dir_all(&staging).unwrap();
        let registry = Registry::new(dir.path().join("meta.db"));
        let driver = CompileDriver::new(&staging, &out, &sidecars, registry.clone());
        Fixture {
            _dir: dir,
            driver,
            registry,
            staging,
            out,
            sidecars,
        }
    }

    fn stage(fx: &Fixture, id: &str, descriptor: &str, code: &[u8]) {
        std::fs::write(fx.staging.join(format!("{id}_descriptor.json")), descriptor).unwrap();
        std::fs::write(fx.staging.join(format!("{id}.wasm")), code).unwrap();
    }

    #[tokio::test]
    async fn wasm_upload_is_copied_and_registered() {
        let fx = fixture();
        stage(&fx, "func_1_0_42", r#"{"runtime":"wasm","method":"GET"}"#, b"\0asm");

        let deployment = fx.driver.compile("func_1_0_42").await.unwrap();
        assert_eq!(deployment.method, "GET");
        assert_eq!(deployment.route_key, "GET:/api/func_1_0_42");

        let module = fx.out.join("func_1_0_42").join("module.wasm");
        assert_eq!(std::fs::read(&module).unwrap(), b"\0asm");
        assert!(fx.sidecars.join("func_1_0_42.json").exists());

        let rows = fx.registry.scan().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "GET:/api/func_1_0_42");
        let value: serde_json::Value = serde_json::from_str(&rows[0].value).unwrap();
        assert_eq!(value["runtime"], "wasm");
        assert_eq!(value["handler"], "func_1_0_42");
        assert_eq!(value["memory"], 128);
    }

    #[tokio::test]
    async fn method_defaults_to_post() {
        let fx = fixture();
        stage(&fx, "func_2_0_42", r#"{"runtime":"wasm"}"#, b"\0asm");
        let deployment = fx.driver.compile("func_2_0_42").await.unwrap();
        assert_eq!(deployment.route_key, "POST:/api/func_2_0_42");
    }

    #[tokio::test]
    async fn missing_code_file_is_a_staging_error() {
        let fx = fixture();
        std::fs::write(
            fx.staging.join("func_3_0_42_descriptor.json"),
            r#"{"runtime":"wasm"}"#,
        )
        .unwrap();
        let err = fx.driver.compile("func_3_0_42").await.unwrap_err();
        assert!(matches!(err, CompileError::Staging { .. }));
        assert_eq!(err.code(), 2);
    }

    #[tokio::test]
    async fn unknown_runtime_is_rejected() {
        let fx = fixture();
        stage(&fx, "func_4_0_42", r#"{"runtime":"cobol"}"#, b"x");
        let err = fx.driver.compile("func_4_0_42").await.unwrap_err();
        assert!(matches!(err, CompileError::Runtime));
        assert_eq!(err.code(), 4);
    }

    #[tokio::test]
    async fn staged_files_survive_compilation() {
        let fx = fixture();
        stage(&fx, "func_5_0_42", r#"{"runtime":"wasm"}"#, b"\0asm");
        fx.driver.compile("func_5_0_42").await.unwrap();
        assert!(fx.staging.join("func_5_0_42.wasm").exists());
        assert!(fx.staging.join("func_5_0_42_descriptor.json").exists());
    }

    #[test]
    fn toolchain_map_names_expected_programs() {
        let code = Path::new("/s/x.c");
        let module = Path::new("/o/module.wasm");
        let program = |r| {
            toolchain(r, code, module).map(|c| c.as_std().get_program().to_os_string())
        };
        assert_eq!(program(Runtime::C).unwrap(), "emcc");
        assert_eq!(program(Runtime::Cpp).unwrap(), "em++");
        assert_eq!(program(Runtime::CppAlias).unwrap(), "em++");
        assert_eq!(program(Runtime::Rust).unwrap(), "rustc");
        assert_eq!(program(Runtime::Go).unwrap(), "tinygo");
        assert_eq!(program(Runtime::TinyGo).unwrap(), "tinygo");
        assert_eq!(program(Runtime::Python).unwrap(), "py2wasm");
        assert_eq!(program(Runtime::Php).unwrap(), "php-wasm-builder");
        assert!(toolchain(Runtime::Wasm, code, module).is_none());
    }
}
