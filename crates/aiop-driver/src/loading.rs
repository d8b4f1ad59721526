//! Image loading
//!
//! Stages an AIOP image (and an optional argument blob) into page-aligned
//! private file mappings, registers them with the IOMMU, and drives the
//! tile through `load` and `run`.
//!
//! # Sequence
//!
//! ```text
//! validate ─▶ stage image ─▶ stage args? ─▶ DMA image ─▶ DMA args?
//!     ─▶ [open ─▶ reset? ─▶ load ─▶ run ─▶ close] ─▶ unwind
//! ```
//!
//! Every acquired resource is pushed on an unwind list which is drained in
//! reverse whatever the outcome. A failed reset is only reported as a
//! warning.

use crate::dma::DmaMapping;
use crate::error::{AiopError, Result};
use crate::platform::{close_quietly, FileFd, Platform, VirtAddr};
use crate::portal::FirmwareControl;
use crate::session::Accelerator;
use aiop_mc::layout::{staging_len, ARGS_MAX_LEN, IMAGE_MAX_LEN};
use aiop_mc::{LoadConfig, RunConfig};
use rustix::fs::{access, Access};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// What to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    /// AIOP image file
    pub image: PathBuf,
    /// Optional argument blob passed to `run`
    pub args: Option<PathBuf>,
    /// Reset the tile before loading
    pub reset: bool,
}

/// File lengths accepted by [`LoadRequest::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadPlan {
    /// Image length in bytes
    pub image_len: u32,
    /// Argument blob length in bytes
    pub args_len: Option<u32>,
}

impl LoadRequest {
    /// Load `image` without arguments or reset.
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            args: None,
            reset: false,
        }
    }

    /// Pass `args` to `run`.
    #[must_use]
    pub fn with_args(mut self, args: impl Into<PathBuf>) -> Self {
        self.args = Some(args.into());
        self
    }

    /// Reset the tile before loading.
    #[must_use]
    pub const fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Check both files without opening them.
    ///
    /// # Errors
    ///
    /// Returns [`AiopError::InvalidFile`] if a file is missing, not a
    /// regular file, unreadable, empty, or larger than its limit (8 MiB for
    /// the image, 512 bytes for the arguments).
    pub fn validate(&self) -> Result<LoadPlan> {
        let image_len = check_file(&self.image, IMAGE_MAX_LEN)?;
        let args_len = self
            .args
            .as_deref()
            .map(|args| check_file(args, ARGS_MAX_LEN))
            .transpose()?;
        Ok(LoadPlan {
            image_len,
            args_len,
        })
    }
}

fn check_file(path: &Path, max_len: u64) -> Result<u32> {
    let meta = std::fs::metadata(path).map_err(|e| AiopError::invalid_file(path, e.to_string()))?;
    if !meta.is_file() {
        return Err(AiopError::invalid_file(path, "not a regular file"));
    }
    access(path, Access::READ_OK)
        .map_err(|e| AiopError::invalid_file(path, format!("not readable: {e}")))?;
    let len = meta.len();
    if len == 0 {
        return Err(AiopError::invalid_file(path, "empty"));
    }
    if len > max_len {
        return Err(AiopError::invalid_file(
            path,
            format!("{len} bytes exceeds the {max_len}-byte limit"),
        ));
    }
    u32::try_from(len).map_err(|_| AiopError::invalid_file(path, "length overflows u32"))
}

/// A file opened and mapped for staging.
#[derive(Debug)]
struct StagedFile {
    fd: FileFd,
    addr: VirtAddr,
    len: usize,
}

/// Resource to give back during unwind.
#[derive(Debug)]
enum Held {
    Staged(StagedFile),
    Dma(DmaMapping),
}

impl<P: Platform> Accelerator<P> {
    /// Load and start an image.
    ///
    /// Succeeds only if validation, both DMA registrations, `load` and
    /// `run` succeed.
    ///
    /// # Errors
    ///
    /// Returns the first failure: validation, staging, DMA registration,
    /// session open, `load`, `run`, then session close. Everything staged is
    /// released before returning.
    pub fn load(&mut self, request: &LoadRequest) -> Result<()> {
        let plan = request.validate().inspect_err(|e| error!("{e}"))?;

        let mut held = Vec::new();
        let result = self.stage_and_start(request, plan, &mut held);
        self.unwind(held);

        match &result {
            Ok(()) => info!("AIOP image {} loaded", request.image.display()),
            Err(e) => error!("Loading {} failed: {e}", request.image.display()),
        }
        result
    }

    fn stage_and_start(
        &mut self,
        request: &LoadRequest,
        plan: LoadPlan,
        held: &mut Vec<Held>,
    ) -> Result<()> {
        let image_addr = self.stage(&request.image, plan.image_len, held)?;
        let args_addr = match (request.args.as_deref(), plan.args_len) {
            (Some(path), Some(len)) => Some(self.stage(path, len, held)?),
            _ => None,
        };

        let image_len = staging_len(plan.image_len as usize);
        let image_dma = self.dma.map(&self.platform, image_addr, image_len)?;
        let image_iova = image_dma.iova();
        held.push(Held::Dma(image_dma));
        info!("Image staged at {image_addr}, IOVA {image_iova}");

        let args_run = match (args_addr, plan.args_len) {
            (Some(addr), Some(len)) => {
                let args_dma = self.dma.map(&self.platform, addr, staging_len(len as usize))?;
                let iova = args_dma.iova();
                held.push(Held::Dma(args_dma));
                info!("Arguments staged at {addr}, IOVA {iova}");
                Some((iova.0, len))
            }
            _ => None,
        };

        let load = LoadConfig {
            iova: image_iova.0,
            size: plan.image_len,
            options: 0,
        };
        let run = RunConfig::all_cores(args_run);
        let reset = request.reset;

        self.with_channel("load", |fw, token| {
            if reset {
                match fw.reset(token) {
                    Ok(()) => info!("AIOP Tile Reset done"),
                    Err(e) => warn!(
                        "Reset before load failed: {e}; reset may not be supported on this hardware"
                    ),
                }
            }
            debug!("load: iova={:#x}, size={}", load.iova, load.size);
            fw.load(token, &load)?;
            info!("MC load successful");
            fw.run(token, &run)?;
            info!("MC run successful");
            Ok(())
        })
    }

    /// Open and map a file, then record it for unwind.
    fn stage(&self, path: &Path, len: u32, held: &mut Vec<Held>) -> Result<VirtAddr> {
        let fd = self.platform.open_file(path)?;
        debug!("Opened {} as {fd}", path.display());
        let len = staging_len(len as usize);
        let addr = match self.platform.map_file(fd, len) {
            Ok(addr) => addr,
            Err(e) => {
                close_quietly(&self.platform, fd);
                return Err(e);
            }
        };
        debug!("Mapped {len:#x} bytes of {fd} at {addr}");
        held.push(Held::Staged(StagedFile { fd, addr, len }));
        Ok(addr)
    }

    fn unwind(&mut self, held: Vec<Held>) {
        for item in held.into_iter().rev() {
            match item {
                Held::Dma(mapping) => self.dma.unmap(&self.platform, mapping),
                Held::Staged(file) => {
                    if let Err(e) = self.platform.unmap(file.addr, file.len) {
                        warn!("munmap of staged buffer {} failed: {e}", file.addr);
                    }
                    close_quietly(&self.platform, file.fd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn file_of(len: usize) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&vec![0xA5; len]).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn image_limit_is_inclusive() {
        let ok = file_of(8 * 1024 * 1024);
        assert_eq!(
            LoadRequest::new(ok.path()).validate().unwrap().image_len,
            8 * 1024 * 1024
        );
        let big = file_of(8 * 1024 * 1024 + 1);
        assert!(LoadRequest::new(big.path()).validate().is_err());
    }

    #[test]
    fn args_limit_is_inclusive() {
        let image = file_of(16);
        let ok = file_of(512);
        let plan = LoadRequest::new(image.path())
            .with_args(ok.path())
            .validate()
            .unwrap();
        assert_eq!(plan.args_len, Some(512));
        let big = file_of(513);
        let err = LoadRequest::new(image.path())
            .with_args(big.path())
            .validate()
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn empty_and_missing_files_are_rejected() {
        let empty = file_of(0);
        assert!(LoadRequest::new(empty.path()).validate().is_err());
        assert!(LoadRequest::new("/nonexistent/aiop.elf").validate().is_err());
        let dir = tempfile::tempdir().unwrap();
        assert!(LoadRequest::new(dir.path()).validate().is_err());
    }

    #[test]
    fn unreadable_args_are_rejected() {
        use std::os::unix::fs::PermissionsExt;

        let image = file_of(16);
        let args = file_of(32);
        std::fs::set_permissions(args.path(), std::fs::Permissions::from_mode(0o000)).unwrap();
        if std::fs::File::open(args.path()).is_ok() {
            // Privileged callers bypass permission bits.
            return;
        }
        let err = LoadRequest::new(image.path())
            .with_args(args.path())
            .validate()
            .unwrap_err();
        assert!(err.is_validation());
    }
}
