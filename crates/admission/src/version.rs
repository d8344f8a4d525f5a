//! Version information for admission.

/// Crate version from Cargo.toml
pub const ADMISSION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the status server.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub admission: &'static str,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            admission: ADMISSION_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.admission, ADMISSION_VERSION);
    }

    #[test]
    fn version_info_serializes() {
        let info = VersionInfo { admission: "0.1.0" };
        insta::assert_json_snapshot!(info, @r#"
        {
          "admission": "0.1.0"
        }
        "#);
    }
}
