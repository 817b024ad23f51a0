//! Version information for the rused library

/// Current version of the rused library
pub const VERSION: &str = "1.0.2";

/// Platform information (OS/architecture)
pub fn platform() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}
