//! Privileged mediator backends
//!
//! A `Driver` accepts encoded control codes and frames and performs the
//! register I/O. The session never touches hardware itself.

use std::path::{Path, PathBuf};
use std::process::Command;

use cw_protocol::ControlCode;
use tracing::{debug, info};

/// A privileged I/O mediator with an install/open/close/delete lifecycle.
pub trait Driver: Send {
    fn name(&self) -> &str;

    /// Open a handle to an already installed mediator.
    fn open(&mut self) -> bool;

    fn is_open(&self) -> bool;

    /// Install the mediator from an extracted image.
    fn install(&mut self, image: &Path) -> std::result::Result<(), String>;

    /// Uninstall the mediator.
    fn delete(&mut self) -> bool;

    fn close(&mut self);

    /// Execute one control code. `output` is zeroed by the caller on failure.
    fn device_io_control(&mut self, code: ControlCode, input: &[u8], output: &mut [u8]) -> bool;
}

/// Supplies the mediator image when it is not already installed.
pub trait DriverImageProvider: Send + Sync {
    fn driver_image(&self) -> Option<Vec<u8>>;
}

/// No embedded image; only an installed mediator can be used.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDriverImage;

impl DriverImageProvider for NoDriverImage {
    fn driver_image(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Image read from a file at open time.
#[derive(Debug, Clone)]
pub struct FileDriverImage {
    path: PathBuf,
}

impl FileDriverImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DriverImageProvider for FileDriverImage {
    fn driver_image(&self) -> Option<Vec<u8>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => None,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Driver image not readable");
                None
            }
        }
    }
}

/// In-memory image, mostly for tests.
#[derive(Debug, Clone)]
pub struct BytesDriverImage(pub Vec<u8>);

impl DriverImageProvider for BytesDriverImage {
    fn driver_image(&self) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

/// A mediator that is never available.
#[derive(Debug, Default)]
pub struct NullDriver;

impl Driver for NullDriver {
    fn name(&self) -> &str {
        "none"
    }

    fn open(&mut self) -> bool {
        false
    }

    fn is_open(&self) -> bool {
        false
    }

    fn install(&mut self, _image: &Path) -> std::result::Result<(), String> {
        Err("No mediator available on this platform".into())
    }

    fn delete(&mut self) -> bool {
        false
    }

    fn close(&mut self) {}

    fn device_io_control(&mut self, _code: ControlCode, _input: &[u8], _output: &mut [u8]) -> bool {
        false
    }
}

/// Run a module tool (`modprobe`, `insmod`, `rmmod`) and report its stderr.
pub(crate) fn run_module_tool(tool: &str, args: &[&str]) -> std::result::Result<(), String> {
    match Command::new(tool).args(args).output() {
        Ok(output) if output.status.success() => {
            info!("{} {} succeeded", tool, args.join(" "));
            Ok(())
        }
        Ok(output) => Err(format!(
            "{} {} failed: {}",
            tool,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )),
        Err(e) => Err(format!("Could not run {}: {}", tool, e)),
    }
}

/// Whether a kernel module shows up in /proc/modules.
pub(crate) fn module_loaded(module: &str) -> bool {
    std::fs::read_to_string("/proc/modules")
        .map(|s| s.lines().any(|l| l.split_whitespace().next() == Some(module)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_no_image() {
        assert!(NoDriverImage.driver_image().is_none());
    }

    #[test]
    fn test_file_image() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"\x7fELF").unwrap();
        assert_eq!(FileDriverImage::new(file.path()).driver_image(), Some(b"\x7fELF".to_vec()));
        assert!(FileDriverImage::new("/nonexistent/corewatch.ko").driver_image().is_none());
    }

    #[test]
    fn test_null_driver_never_opens() {
        let mut d = NullDriver;
        assert!(!d.open());
        assert!(d.install(Path::new("/tmp/x")).is_err());
        let mut out = [0u8; 8];
        assert!(!d.device_io_control(cw_protocol::Function::ReadMsr.code(), &[0; 4], &mut out));
    }
}
