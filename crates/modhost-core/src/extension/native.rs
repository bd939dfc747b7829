//! Native extensions loaded with `libloading`.
//!
//! Each binary is copied into the scratch directory under a unique name
//! before it is opened. The host can then replace the file on disk while
//! the old generation is still mapped, and two generations of the same
//! extension never share an inode.

use std::ffi::c_void;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use libloading::Library;
use tracing::{debug, warn};

use super::abi::{
    BuildTag, Entry, RawModuleHeader, RawStr, SymbolAddress, SymbolSlot, SYM_BUILD_TAG,
    SYM_MOD_HANDLE, SYM_MOD_HEADER, SYM_MOD_VERSION,
};
use super::binary::{EntryPoint, ExtensionBinary, SymbolDependency, SymbolProvider};
use super::record::{ExtensionHeader, ExtensionId};
use crate::error::{Error, Result};
use crate::validation_err;

type VersionFn = unsafe extern "C" fn() -> RawStr;
type BuildTagFn = unsafe extern "C" fn() -> u32;
type HeaderFn = unsafe extern "C" fn() -> *const RawModuleHeader;

/// A shared object opened from a private copy.
pub struct NativeBinary {
    library: Option<Library>,
    location: PathBuf,
    tmp_path: PathBuf,
}

impl NativeBinary {
    /// Copy `path` into `tmp_dir` and open the copy.
    pub fn open(path: impl AsRef<Path>, tmp_dir: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Open {
                path: path.to_path_buf(),
                message: "Cannot open module file".to_string(),
            });
        }

        fs::create_dir_all(tmp_dir.as_ref())?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "extension".to_string());
        let tmp_path = tmp_dir
            .as_ref()
            .join(format!("{}.{}", uuid::Uuid::new_v4().simple(), file_name));

        fs::copy(path, &tmp_path).map_err(|e| Error::Open {
            path: path.to_path_buf(),
            message: format!("Failed to copy module file: {}", e),
        })?;

        // Remove the copy again if opening fails.
        let guard = scopeguard::guard(tmp_path, |tmp| {
            let _ = fs::remove_file(tmp);
        });

        let library = unsafe {
            Library::new(&*guard).map_err(|e| Error::Open {
                path: path.to_path_buf(),
                message: format!("Failed to load library: {}", e),
            })?
        };

        let tmp_path = scopeguard::ScopeGuard::into_inner(guard);
        debug!(category = "modules", path = %path.display(), tmp = %tmp_path.display(), "Opened native extension");

        Ok(Self {
            library: Some(library),
            location: path.to_path_buf(),
            tmp_path,
        })
    }

    /// Path of the private copy.
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    fn string_field(&self, raw: RawStr, field: &str) -> Result<Option<String>> {
        // SAFETY: header strings point into the library's static data.
        match unsafe { raw.to_owned_string() } {
            None => Ok(None),
            Some(Ok(s)) => Ok(Some(s)),
            Some(Err(e)) => Err(validation_err!(
                &self.location,
                "Invalid {} in module header: {}",
                field,
                e
            )),
        }
    }
}

impl SymbolProvider for NativeBinary {
    fn resolve(&self, symbol: &str) -> Option<SymbolAddress> {
        let library = self.library.as_ref()?;
        // SAFETY: we only read the symbol's address, not its contents.
        let sym = unsafe { library.get::<*const c_void>(symbol.as_bytes()) }.ok()?;
        SymbolAddress::new(*sym)
    }
}

impl ExtensionBinary for NativeBinary {
    fn location(&self) -> &Path {
        &self.location
    }

    fn version_tag(&self) -> Result<Option<String>> {
        let Some(addr) = self.resolve(SYM_MOD_VERSION) else {
            return Ok(None);
        };
        // SAFETY: exported by `declare_extension!` with this signature.
        let f: VersionFn = unsafe { std::mem::transmute(addr.as_ptr()) };
        let raw = unsafe { f() };
        self.string_field(raw, "version tag")
    }

    fn build_tag(&self) -> Option<BuildTag> {
        let addr = self.resolve(SYM_BUILD_TAG)?;
        // SAFETY: as above.
        let f: BuildTagFn = unsafe { std::mem::transmute(addr.as_ptr()) };
        Some(BuildTag::from_packed(unsafe { f() }))
    }

    fn header(&self) -> Result<Option<ExtensionHeader>> {
        let Some(addr) = self.resolve(SYM_MOD_HEADER) else {
            return Ok(None);
        };
        // SAFETY: as above; the header lives as long as the library.
        let f: HeaderFn = unsafe { std::mem::transmute(addr.as_ptr()) };
        let Some(raw) = (unsafe { f().as_ref() }) else {
            return Ok(None);
        };

        let lacking = |field: &str| validation_err!(&self.location, "Lacking mod_header->{}", field);
        let modversion = self
            .string_field(raw.modversion, "modversion")?
            .ok_or_else(|| lacking("modversion"))?;
        let name = self.string_field(raw.name, "name")?;
        let version = self.string_field(raw.version, "version")?;
        let description = self.string_field(raw.description, "description")?;
        let (Some(name), Some(version), Some(description)) = (name, version, description) else {
            return Err(validation_err!(&self.location, "Lacking sane header pointer"));
        };

        let mut dependencies = Vec::new();
        if !raw.symdep.is_null() {
            // SAFETY: `symdep` points at `symdep_len` rows owned by the library.
            let rows = unsafe { std::slice::from_raw_parts(raw.symdep, raw.symdep_len) };
            for row in rows {
                let Some(slot) = (unsafe { SymbolSlot::from_raw(row.slot) }) else {
                    break;
                };
                let symbol = self
                    .string_field(row.symbol, "dependency symbol")?
                    .ok_or_else(|| lacking("symdep symbol"))?;
                let provider = self
                    .string_field(row.module, "dependency module")?
                    .unwrap_or_default();
                dependencies.push(SymbolDependency {
                    symbol,
                    provider,
                    slot,
                });
            }
        }

        Ok(Some(ExtensionHeader {
            name,
            version,
            description,
            modversion,
            dependencies,
        }))
    }

    fn entry_point(&self, entry: Entry) -> Option<EntryPoint> {
        self.resolve(entry.symbol()).map(EntryPoint::Native)
    }

    fn publish_handle(&self, id: ExtensionId) {
        if let Some(addr) = self.resolve(SYM_MOD_HANDLE) {
            // SAFETY: `modhost_mod_handle` is a static AtomicU64.
            let handle = unsafe { &*(addr.as_ptr() as *const AtomicU64) };
            handle.store(id.raw(), Ordering::Release);
        }
    }
}

impl Drop for NativeBinary {
    fn drop(&mut self) {
        // Close before removing the private copy.
        drop(self.library.take());
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            warn!(category = "modules", tmp = %self.tmp_path.display(), error = %e, "Failed to remove temporary extension copy");
        }
    }
}

/// Delete leftover private copies from a previous run.
pub fn purge_temp_dir(tmp_dir: impl AsRef<Path>) -> Result<usize> {
    let tmp_dir = tmp_dir.as_ref();
    if !tmp_dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in fs::read_dir(tmp_dir)? {
        let path = entry?.path();
        if path.is_file() {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = NativeBinary::open(tmp.path().join("m_nope.so"), tmp.path().join("tmp"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Cannot open module file"));
    }

    #[test]
    fn test_open_garbage_cleans_up_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let bogus = tmp.path().join("m_bogus.so");
        fs::write(&bogus, b"not a shared object").unwrap();
        let scratch = tmp.path().join("tmp");

        assert!(NativeBinary::open(&bogus, &scratch).is_err());
        assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    }

    #[test]
    fn test_purge_temp_dir() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.so"), b"").unwrap();
        fs::write(tmp.path().join("b.so"), b"").unwrap();
        assert_eq!(purge_temp_dir(tmp.path()).unwrap(), 2);
        assert_eq!(purge_temp_dir(tmp.path().join("missing")).unwrap(), 0);
    }
}
