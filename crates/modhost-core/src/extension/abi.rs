//! Binary contract between the host and an extension.
//!
//! A native extension exports the following symbols (see
//! [`declare_extension!`](crate::declare_extension)):
//!
//! | symbol                | kind                                    | required |
//! |-----------------------|-----------------------------------------|----------|
//! | `modhost_mod_version` | `extern "C" fn() -> RawStr`             | yes      |
//! | `modhost_build_tag`   | `extern "C" fn() -> u32`                | no       |
//! | `modhost_mod_header`  | `extern "C" fn() -> *const RawModuleHeader` | yes  |
//! | `modhost_mod_init`    | entry point                             | yes      |
//! | `modhost_mod_load`    | entry point                             | yes      |
//! | `modhost_mod_unload`  | entry point                             | yes      |
//! | `modhost_mod_test`    | entry point                             | no       |
//! | `modhost_mod_handle`  | `static AtomicU64`                      | no       |

use std::ffi::{c_int, c_void};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Version tag every extension must carry verbatim.
pub const MOD_VERSION_TAG: &str = concat!("modhost-", env!("CARGO_PKG_VERSION"));

/// Toolchain baseline the host and its extensions are built against.
pub const HOST_BUILD_TAG: BuildTag = BuildTag::new(1, 85, 0);

pub const SYM_MOD_VERSION: &str = "modhost_mod_version";
pub const SYM_BUILD_TAG: &str = "modhost_build_tag";
pub const SYM_MOD_HEADER: &str = "modhost_mod_header";
pub const SYM_MOD_HANDLE: &str = "modhost_mod_handle";

/// Raw code returned by an entry point asking for a deferred unload.
pub const MOD_DELAY: c_int = 2;

/// Packed `major.minor.patch` toolchain tag (`0xMMmmpp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildTag(u32);

impl BuildTag {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self(((major as u32) << 16) | ((minor as u32) << 8) | patch as u32)
    }

    pub const fn from_packed(packed: u32) -> Self {
        Self(packed)
    }

    pub const fn packed(self) -> u32 {
        self.0
    }

    /// Major and minor must match; the patch level is ignored.
    pub fn is_compatible_with(self, other: BuildTag) -> bool {
        (self.0 & 0xffff00) == (other.0 & 0xffff00)
    }
}

impl fmt::Display for BuildTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return write!(f, "0");
        }
        let (major, minor, patch) = (self.0 >> 16, (self.0 >> 8) & 0xff, self.0 & 0xff);
        if patch == 0 {
            write!(f, "{major}.{minor}")
        } else {
            write!(f, "{major}.{minor}.{patch}")
        }
    }
}

/// Module-system version declared in an extension header.
///
/// Only the strings on the allow-list parse; ordering follows the
/// historical release order so later versions compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModsysVersion(u32);

impl ModsysVersion {
    pub const BETA5: Self = Self(0x320b5);
    pub const BETA6: Self = Self(0x320b6);
    pub const BETA7: Self = Self(0x320b7);
    pub const BETA8: Self = Self(0x320b8);
    pub const V3_2_3: Self = Self(0x32300);

    /// Accepts `"3.2.3"` and `"3.2-b<N>-<tag>"` for N in 5..=8.
    pub fn parse(version: &str) -> Option<Self> {
        if version == "3.2.3" {
            return Some(Self::V3_2_3);
        }
        let rest = version.strip_prefix("3.2-b")?;
        let (beta, tag) = rest.split_once('-').unwrap_or((rest, ""));
        if !tag.is_empty() && !tag.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match beta.parse::<u8>().ok()? {
            5 => Some(Self::BETA5),
            6 => Some(Self::BETA6),
            7 => Some(Self::BETA7),
            8 => Some(Self::BETA8),
            _ => None,
        }
    }

    /// Entry-point calling convention for this header shape.
    pub fn calling_convention(self) -> CallingConvention {
        if self >= Self::BETA8 {
            CallingConvention::Current
        } else {
            CallingConvention::Legacy
        }
    }

    /// Whether provider extensions are looked up next to the dependent's file.
    pub fn resolves_providers_by_sibling_path(self) -> bool {
        self >= Self::V3_2_3
    }
}

/// Calling convention selected once per extension at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Every entry point receives the extension context.
    Current,
    /// Test, init and load take no arguments; unload still gets the context.
    Legacy,
}

impl CallingConvention {
    pub fn passes_context(self, entry: Entry) -> bool {
        match self {
            CallingConvention::Current => true,
            CallingConvention::Legacy => entry == Entry::Unload,
        }
    }
}

/// Lifecycle entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Test,
    Init,
    Load,
    Unload,
}

impl Entry {
    pub fn symbol(self) -> &'static str {
        match self {
            Entry::Test => "modhost_mod_test",
            Entry::Init => "modhost_mod_init",
            Entry::Load => "modhost_mod_load",
            Entry::Unload => "modhost_mod_unload",
        }
    }
}

/// Tri-state result of a lifecycle entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleReturn {
    Success,
    Failure(i32),
    Delay,
}

impl ModuleReturn {
    pub fn from_code(code: c_int) -> Self {
        match code {
            MOD_DELAY => ModuleReturn::Delay,
            c if c < 0 => ModuleReturn::Failure(c),
            _ => ModuleReturn::Success,
        }
    }

    pub fn code(self) -> c_int {
        match self {
            ModuleReturn::Success => 0,
            ModuleReturn::Failure(c) if c < 0 => c,
            ModuleReturn::Failure(_) => -1,
            ModuleReturn::Delay => MOD_DELAY,
        }
    }
}

/// Borrowed UTF-8 string crossing the FFI boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawStr {
    pub ptr: *const u8,
    pub len: usize,
}

// SAFETY: a RawStr only ever points at immutable data owned by the extension.
unsafe impl Send for RawStr {}
unsafe impl Sync for RawStr {}

impl RawStr {
    pub const fn from_static(s: &'static str) -> Self {
        Self {
            ptr: s.as_ptr(),
            len: s.len(),
        }
    }

    pub const fn null() -> Self {
        Self {
            ptr: std::ptr::null(),
            len: 0,
        }
    }

    /// # Safety
    /// `ptr` must be null or valid for `len` bytes for the duration of the call.
    pub unsafe fn to_owned_string(&self) -> Option<Result<String, std::string::FromUtf8Error>> {
        if self.ptr.is_null() {
            return None;
        }
        let bytes = std::slice::from_raw_parts(self.ptr, self.len);
        Some(String::from_utf8(bytes.to_vec()))
    }
}

/// One symbol-dependency row in a native header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawSymbolDep {
    pub slot: *const AtomicPtr<c_void>,
    pub symbol: RawStr,
    pub module: RawStr,
}

unsafe impl Send for RawSymbolDep {}
unsafe impl Sync for RawSymbolDep {}

/// Native header block returned by `modhost_mod_header`.
#[repr(C)]
#[derive(Debug)]
pub struct RawModuleHeader {
    pub name: RawStr,
    pub version: RawStr,
    pub description: RawStr,
    pub modversion: RawStr,
    pub symdep: *const RawSymbolDep,
    pub symdep_len: usize,
}

unsafe impl Send for RawModuleHeader {}
unsafe impl Sync for RawModuleHeader {}

/// Owns a [`RawModuleHeader`] and the dependency rows it points into.
///
/// Used by [`declare_extension!`](crate::declare_extension) to build the
/// header lazily inside the extension.
pub struct HeaderStorage {
    _deps: Vec<RawSymbolDep>,
    header: RawModuleHeader,
}

impl HeaderStorage {
    pub fn new(
        name: &'static str,
        version: &'static str,
        description: &'static str,
        modversion: &'static str,
        deps: Vec<RawSymbolDep>,
    ) -> Self {
        let header = RawModuleHeader {
            name: RawStr::from_static(name),
            version: RawStr::from_static(version),
            description: RawStr::from_static(description),
            modversion: RawStr::from_static(modversion),
            symdep: if deps.is_empty() { std::ptr::null() } else { deps.as_ptr() },
            symdep_len: deps.len(),
        };
        Self { _deps: deps, header }
    }

    pub fn raw(&self) -> *const RawModuleHeader {
        &self.header
    }
}

/// Address of a resolved symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddress(NonNull<c_void>);

// SAFETY: addresses are plain code/data locations; using them is unsafe anyway.
unsafe impl Send for SymbolAddress {}
unsafe impl Sync for SymbolAddress {}

impl SymbolAddress {
    pub fn new(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr as *mut c_void).map(Self)
    }

    pub fn as_ptr(self) -> *const c_void {
        self.0.as_ptr()
    }
}

/// A pointer slot an extension wants filled with a resolved symbol.
#[derive(Debug, Clone, Copy)]
pub struct SymbolSlot(NonNull<AtomicPtr<c_void>>);

unsafe impl Send for SymbolSlot {}
unsafe impl Sync for SymbolSlot {}

impl SymbolSlot {
    pub fn from_static(slot: &'static AtomicPtr<c_void>) -> Self {
        Self(NonNull::from(slot))
    }

    /// # Safety
    /// `slot` must stay valid for as long as the owning binary is open.
    pub unsafe fn from_raw(slot: *const AtomicPtr<c_void>) -> Option<Self> {
        NonNull::new(slot as *mut AtomicPtr<c_void>).map(Self)
    }

    pub fn fill(&self, addr: SymbolAddress) {
        // SAFETY: the slot outlives the binary that declared it.
        unsafe { self.0.as_ref() }.store(addr.as_ptr() as *mut c_void, Ordering::Release);
    }

    pub fn get(&self) -> Option<SymbolAddress> {
        // SAFETY: as above.
        SymbolAddress::new(unsafe { self.0.as_ref() }.load(Ordering::Acquire))
    }
}

/// Native entry point taking the extension context.
pub type NativeEntryFn = unsafe extern "C" fn(*mut c_void) -> c_int;
/// Native entry point using the legacy zero-argument form.
pub type LegacyEntryFn = unsafe extern "C" fn() -> c_int;

/// Adapter used by exported entry points to call back into Rust.
///
/// # Safety
/// `info` must be the context pointer the host passed to the entry point.
pub unsafe fn call_entry(
    info: *mut c_void,
    entry: fn(&mut crate::extension::ModuleInfo<'_>) -> ModuleReturn,
) -> c_int {
    match info.cast::<crate::extension::ModuleInfo<'_>>().as_mut() {
        Some(info) => entry(info).code(),
        None => ModuleReturn::Failure(-1).code(),
    }
}

/// Export the symbols a native extension needs.
///
/// # Usage
/// ```ignore
/// use modhost_core::extension::{ModuleInfo, ModuleReturn};
/// use std::sync::atomic::AtomicPtr;
///
/// static CLOAK_HASH: AtomicPtr<std::ffi::c_void> = AtomicPtr::new(std::ptr::null_mut());
///
/// fn init(info: &mut ModuleInfo<'_>) -> ModuleReturn {
///     info.mark_official();
///     ModuleReturn::Success
/// }
/// fn load(_: &mut ModuleInfo<'_>) -> ModuleReturn { ModuleReturn::Success }
/// fn unload(_: &mut ModuleInfo<'_>) -> ModuleReturn { ModuleReturn::Success }
///
/// modhost_core::declare_extension! {
///     name: "m_cloak",
///     version: "1.0",
///     description: "host cloaking",
///     modversion: "3.2.3",
///     init: init,
///     load: load,
///     unload: unload,
///     dependencies: [("cloak_hash", "cloak_core", CLOAK_HASH)],
/// }
/// ```
#[macro_export]
macro_rules! declare_extension {
    (
        name: $name:expr,
        version: $version:expr,
        description: $description:expr,
        modversion: $modversion:expr,
        init: $init:path,
        load: $load:path,
        unload: $unload:path
        $(, test: $test:path)?
        $(, dependencies: [$(($sym:expr, $provider:expr, $slot:path)),* $(,)?])?
        $(,)?
    ) => {
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static modhost_mod_handle: ::std::sync::atomic::AtomicU64 =
            ::std::sync::atomic::AtomicU64::new(0);

        #[no_mangle]
        pub extern "C" fn modhost_mod_version() -> $crate::extension::abi::RawStr {
            $crate::extension::abi::RawStr::from_static($crate::extension::abi::MOD_VERSION_TAG)
        }

        #[no_mangle]
        pub extern "C" fn modhost_build_tag() -> u32 {
            $crate::extension::abi::HOST_BUILD_TAG.packed()
        }

        #[no_mangle]
        pub extern "C" fn modhost_mod_header() -> *const $crate::extension::abi::RawModuleHeader {
            static HEADER: ::std::sync::OnceLock<$crate::extension::abi::HeaderStorage> =
                ::std::sync::OnceLock::new();
            HEADER
                .get_or_init(|| {
                    $crate::extension::abi::HeaderStorage::new(
                        $name,
                        $version,
                        $description,
                        $modversion,
                        vec![$($($crate::extension::abi::RawSymbolDep {
                            slot: &$slot as *const _,
                            symbol: $crate::extension::abi::RawStr::from_static($sym),
                            module: $crate::extension::abi::RawStr::from_static($provider),
                        }),*)?],
                    )
                })
                .raw()
        }

        #[no_mangle]
        pub unsafe extern "C" fn modhost_mod_init(info: *mut ::std::ffi::c_void) -> ::std::ffi::c_int {
            $crate::extension::abi::call_entry(info, $init)
        }

        #[no_mangle]
        pub unsafe extern "C" fn modhost_mod_load(info: *mut ::std::ffi::c_void) -> ::std::ffi::c_int {
            $crate::extension::abi::call_entry(info, $load)
        }

        #[no_mangle]
        pub unsafe extern "C" fn modhost_mod_unload(info: *mut ::std::ffi::c_void) -> ::std::ffi::c_int {
            $crate::extension::abi::call_entry(info, $unload)
        }

        $(
            #[no_mangle]
            pub unsafe extern "C" fn modhost_mod_test(info: *mut ::std::ffi::c_void) -> ::std::ffi::c_int {
                $crate::extension::abi::call_entry(info, $test)
            }
        )?
    };
}
