//! Strict platform matching.

use std::str::FromStr;

use nestrun_shared::NestrunError;

/// Normalized os/architecture/variant triple.
///
/// Matching is strict: an image for another architecture or variant never
/// matches, and there is no fallback to a compatible platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(
        os: impl AsRef<str>,
        architecture: impl AsRef<str>,
        variant: Option<&str>,
    ) -> Self {
        let os = normalize_os(os.as_ref());
        let (architecture, variant) = normalize_arch(architecture.as_ref(), variant);
        Self {
            os,
            architecture,
            variant,
        }
    }

    /// Platform of the running process.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH, None)
    }

    pub fn from_oci(platform: &oci_spec::image::Platform) -> Self {
        Self::new(
            platform.os().to_string(),
            platform.architecture().to_string(),
            platform.variant().as_deref(),
        )
    }

    pub fn matches(&self, other: &Platform) -> bool {
        self == other
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

impl FromStr for Platform {
    type Err = NestrunError;

    /// Parse `os/arch[/variant]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self::new(os, arch, None)),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() => {
                Ok(Self::new(os, arch, Some(variant)))
            }
            _ => Err(NestrunError::Config(format!("invalid platform {:?}", s))),
        }
    }
}

fn normalize_os(os: &str) -> String {
    match os.to_ascii_lowercase().as_str() {
        "macos" => "darwin".to_string(),
        other => other.to_string(),
    }
}

fn normalize_arch(arch: &str, variant: Option<&str>) -> (String, Option<String>) {
    let arch = arch.to_ascii_lowercase();
    let variant = variant
        .filter(|v| !v.is_empty())
        .map(|v| v.to_ascii_lowercase());

    match arch.as_str() {
        "x86_64" | "x86-64" | "amd64" => {
            let variant = variant.filter(|v| v != "v1");
            ("amd64".to_string(), variant)
        }
        "aarch64" | "arm64" => {
            let variant = variant.filter(|v| v != "v8" && v != "8");
            ("arm64".to_string(), variant)
        }
        "armhf" => ("arm".to_string(), Some("v7".to_string())),
        "armel" => ("arm".to_string(), Some("v6".to_string())),
        "arm" => {
            let variant = match variant.as_deref() {
                None | Some("7") => Some("v7".to_string()),
                Some("5") | Some("6") | Some("8") => variant.map(|v| format!("v{}", v)),
                _ => variant,
            };
            ("arm".to_string(), variant)
        }
        "i386" | "x86" => ("386".to_string(), variant),
        _ => (arch, variant),
    }
}
