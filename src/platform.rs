use crate::error::{Error, Result};
use oci_spec::image::{Arch, Os, PlatformBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Target platform triple in `os/architecture[/variant]` form,
/// e.g. `linux/amd64` or `linux/arm/v7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

impl Platform {
    pub fn new(os: &str, architecture: &str) -> Self {
        Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: None,
        }
    }

    pub fn with_variant(os: &str, architecture: &str, variant: &str) -> Self {
        Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: Some(variant.to_string()),
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let mut iter = input.split('/');
        match (iter.next(), iter.next(), iter.next(), iter.next()) {
            (Some(os), Some(arch), variant, None) if !os.is_empty() && !arch.is_empty() => {
                Ok(Platform {
                    os: os.to_string(),
                    architecture: arch.to_string(),
                    variant: variant.filter(|v| !v.is_empty()).map(str::to_string),
                })
            }
            _ => Err(Error::InvalidPlatform(input.to_string())),
        }
    }

    /// Platform of the machine running the build, via [std::cfg] macro.
    pub fn host() -> Self {
        let (architecture, variant) = if cfg!(target_arch = "x86_64") {
            ("amd64", None)
        } else if cfg!(target_arch = "x86") {
            ("386", None)
        } else if cfg!(target_arch = "aarch64") {
            ("arm64", None)
        } else if cfg!(target_arch = "arm") {
            ("arm", Some("v7"))
        } else {
            ("unknown", None)
        };
        let os = if cfg!(target_os = "linux") {
            "linux"
        } else if cfg!(target_os = "windows") {
            "windows"
        } else if cfg!(target_os = "macos") {
            "darwin"
        } else {
            "unknown"
        };
        Platform {
            os: os.to_string(),
            architecture: architecture.to_string(),
            variant: variant.map(str::to_string),
        }
    }

    pub fn oci_arch(&self) -> Arch {
        match self.architecture.as_str() {
            "amd64" => Arch::Amd64,
            "arm64" => Arch::ARM64,
            "arm" => Arch::ARM,
            "386" => Arch::i386,
            other => Arch::Other(other.to_string()),
        }
    }

    pub fn oci_os(&self) -> Os {
        match self.os.as_str() {
            "linux" => Os::Linux,
            "windows" => Os::Windows,
            "darwin" => Os::Darwin,
            other => Os::Other(other.to_string()),
        }
    }

    /// Convert into the descriptor platform of the OCI image index.
    pub fn to_oci(&self) -> Result<oci_spec::image::Platform> {
        let mut builder = PlatformBuilder::default()
            .os(self.oci_os())
            .architecture(self.oci_arch());
        if let Some(variant) = &self.variant {
            builder = builder.variant(variant.clone());
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() -> Result<()> {
        let p = Platform::parse("linux/amd64")?;
        assert_eq!(p, Platform::new("linux", "amd64"));
        assert_eq!(p.to_string(), "linux/amd64");

        let p = Platform::parse("linux/arm/v7")?;
        assert_eq!(p, Platform::with_variant("linux", "arm", "v7"));
        assert_eq!(p.to_string(), "linux/arm/v7");

        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("linux/amd64/v2/extra").is_err());
        assert!(Platform::parse("/amd64").is_err());
        Ok(())
    }

    #[test]
    fn equality_includes_variant() -> Result<()> {
        let plain = Platform::parse("linux/arm")?;
        let v7 = Platform::parse("linux/arm/v7")?;
        assert_ne!(plain, v7);
        assert_eq!(plain, Platform::parse("linux/arm")?);
        Ok(())
    }

    #[test]
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    fn host_platform() {
        let host = Platform::host();
        assert_eq!(host.to_string(), "linux/amd64");
        assert_eq!(host.oci_arch(), Arch::Amd64);
        assert_eq!(host.oci_os(), Os::Linux);
    }
}
