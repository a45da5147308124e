//! Function descriptors and route keys.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtimes a descriptor may name. `cpp`/`c++` and `go`/`tinygo` are
/// distinct tags that share a toolchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Runtime {
    C,
    Cpp,
    CppAlias,
    Rust,
    Go,
    TinyGo,
    Python,
    Php,
    Wasm,
}

#[derive(Debug, Error)]
#[error("unsupported runtime '{0}'")]
pub struct UnknownRuntime(pub String);

impl Runtime {
    /// All tags of the closed set, in the order uploads advertise them.
    pub const TAGS: [&'static str; 9] = [
        "c", "cpp", "c++", "rust", "go", "tinygo", "python", "php", "wasm",
    ];

    pub fn parse(tag: &str) -> Result<Self, UnknownRuntime> {
        match tag {
            "c" => Ok(Self::C),
            "cpp" => Ok(Self::Cpp),
            "c++" => Ok(Self::CppAlias),
            "rust" => Ok(Self::Rust),
            "go" => Ok(Self::Go),
            "tinygo" => Ok(Self::TinyGo),
            "python" => Ok(Self::Python),
            "php" => Ok(Self::Php),
            "wasm" => Ok(Self::Wasm),
            other => Err(UnknownRuntime(other.to_owned())),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp => "cpp",
            Self::CppAlias => "c++",
            Self::Rust => "rust",
            Self::Go => "go",
            Self::TinyGo => "tinygo",
            Self::Python => "python",
            Self::Php => "php",
            Self::Wasm => "wasm",
        }
    }

    /// Source file extension used when staging an upload.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::C => "c",
            Self::Cpp | Self::CppAlias => "cpp",
            Self::Rust => "rs",
            Self::Go | Self::TinyGo => "go",
            Self::Python => "py",
            Self::Php => "php",
            Self::Wasm => "wasm",
        }
    }
}

impl TryFrom<String> for Runtime {
    type Error = UnknownRuntime;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Runtime> for String {
    fn from(value: Runtime) -> Self {
        value.as_str().to_owned()
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route key as stored and synced: `"<METHOD>:<URI>"`, byte for byte.
#[must_use]
pub fn route_key(method: &str, uri: &str) -> String {
    format!("{method}:{uri}")
}

/// Byte caps of a descriptor's identity fields.
pub const MAX_METHOD_LEN: usize = 15;
pub const MAX_URI_LEN: usize = 127;
pub const MAX_NAME_LEN: usize = 63;

/// Truncate in place to at most `cap` bytes, backing off to a character
/// boundary.
fn truncate_at(value: &mut String, cap: usize) {
    if value.len() <= cap {
        return;
    }
    let mut end = cap;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}

/// A deployed function as carried by registry rows. `method` and `uri` are
/// absent from the stored JSON and filled in at lookup time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub name: String,
    pub runtime: Runtime,
    pub module: String,
    pub handler: String,
    #[serde(default)]
    pub memory: u32,
    #[serde(default)]
    pub timeout: u32,
}

impl FunctionDescriptor {
    /// An active route needs a module to execute and a handler to name.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.module.is_empty() && !self.handler.is_empty()
    }

    /// Truncate the identity fields to their caps, the same treatment the
    /// handoff body gets at its own bound. Applied wherever a descriptor is
    /// populated from unbounded input.
    pub fn enforce_caps(&mut self) {
        truncate_at(&mut self.method, MAX_METHOD_LEN);
        truncate_at(&mut self.uri, MAX_URI_LEN);
        truncate_at(&mut self.name, MAX_NAME_LEN);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_tags_round_trip() {
        for tag in Runtime::TAGS {
            assert_eq!(Runtime::parse(tag).unwrap().as_str(), tag);
        }
        assert!(Runtime::parse("java").is_err());
    }

    #[test]
    fn shared_toolchain_extensions() {
        assert_eq!(Runtime::Cpp.extension(), "cpp");
        assert_eq!(Runtime::CppAlias.extension(), "cpp");
        assert_eq!(Runtime::Go.extension(), "go");
        assert_eq!(Runtime::TinyGo.extension(), "go");
    }

    #[test]
    fn descriptor_from_registry_value() {
        let v = r#"{"name":"echo","runtime":"wasm","module":"/opt/functions/echo/module.wasm","handler":"echo","memory":128,"timeout":5}"#;
        let d: FunctionDescriptor = serde_json::from_str(v).unwrap();
        assert_eq!(d.runtime, Runtime::Wasm);
        assert_eq!(d.memory, 128);
        assert!(d.method.is_empty());
        assert!(d.is_complete());
    }

    #[test]
    fn descriptor_rejects_unknown_runtime() {
        let v = r#"{"runtime":"java","module":"/m","handler":"h"}"#;
        assert!(serde_json::from_str::<FunctionDescriptor>(v).is_err());
    }

    #[test]
    fn route_key_is_byte_exact() {
        assert_eq!(route_key("POST", "/echo"), "POST:/echo");
    }

    #[test]
    fn identity_fields_truncate_at_caps() {
        let mut d = FunctionDescriptor {
            method: "M".repeat(40),
            uri: format!("/{}", "u".repeat(200)),
            name: "n".repeat(100),
            runtime: Runtime::Wasm,
            module: "/m".to_owned(),
            handler: "h".to_owned(),
            memory: 0,
            timeout: 0,
        };
        d.enforce_caps();
        assert_eq!(d.method.len(), MAX_METHOD_LEN);
        assert_eq!(d.uri.len(), MAX_URI_LEN);
        assert_eq!(d.name.len(), MAX_NAME_LEN);

        // Already-bounded fields are untouched.
        let mut short = d.clone();
        short.method = "POST".to_owned();
        short.enforce_caps();
        assert_eq!(short.method, "POST");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut d = FunctionDescriptor {
            method: String::new(),
            uri: String::new(),
            name: "é".repeat(40),
            runtime: Runtime::Wasm,
            module: "/m".to_owned(),
            handler: "h".to_owned(),
            memory: 0,
            timeout: 0,
        };
        d.enforce_caps();
        assert!(d.name.len() <= MAX_NAME_LEN);
        assert!(d.name.is_char_boundary(d.name.len()));
    }
}
