//! Native engine loaded from a shared library.
//!
//! The library exports `fxvisor_engine_entry`, returning a static vtable:
//!
//! ```c
//! struct fxvisor_engine_vtable {
//!     uint32_t abi_version;
//!     void *(*create)(uint32_t sample_rate);
//!     void (*destroy)(void *engine);
//!     bool (*is_initialized)(void *engine);
//!     void (*set_parameter)(void *engine, uint32_t param, float value);
//!     void (*set_mod_enabled)(void *engine, bool enabled);
//!     void (*process)(void *engine, const float *in, float *out, size_t len);
//! };
//! ```
//!
//! Native code may fault on adversarial input. Host it with `ProcessLauncher`.

use std::ffi::c_void;
use std::path::Path;

use libloading::{Library, Symbol};

use super::fallback::SAMPLE_RATE;
use super::{Engine, EngineError, EngineKind, Parameter, ParameterSet};

/// Entry symbol every native engine library must export.
pub const ENTRY_SYMBOL: &str = "fxvisor_engine_entry";

/// ABI revision this crate speaks.
pub const ABI_VERSION: u32 = 1;

/// Function table exported by a native engine library.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NativeVTable {
    pub abi_version: u32,
    pub create: unsafe extern "C" fn(sample_rate: u32) -> *mut c_void,
    pub destroy: unsafe extern "C" fn(engine: *mut c_void),
    pub is_initialized: unsafe extern "C" fn(engine: *mut c_void) -> bool,
    pub set_parameter: unsafe extern "C" fn(engine: *mut c_void, param: u32, value: f32),
    pub set_mod_enabled: unsafe extern "C" fn(engine: *mut c_void, enabled: bool),
    pub process:
        unsafe extern "C" fn(engine: *mut c_void, input: *const f32, output: *mut f32, len: usize),
}

type EntryFn = unsafe extern "C" fn() -> *const NativeVTable;

/// Engine backed by a native vtable, usually from a loaded library.
pub struct NativeEngine {
    vtable: NativeVTable,
    handle: *mut c_void,
    params: ParameterSet,
    // Must outlive `handle` and every function pointer in `vtable`.
    _library: Option<Library>,
}

// SAFETY: the handle is owned exclusively by this value and the ABI contract
// requires engines to tolerate being driven from any single thread.
unsafe impl Send for NativeEngine {}

impl NativeEngine {
    /// Load and construct the engine from `path`.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        // SAFETY: runs the library's initializers; the caller chose this library.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            EngineError::Unavailable(format!(
                "failed to load native engine from {}: {}",
                path.display(),
                e
            ))
        })?;

        // SAFETY: symbol type matches the documented ABI contract.
        let vtable_ptr = unsafe {
            let entry: Symbol<EntryFn> = library.get(ENTRY_SYMBOL.as_bytes()).map_err(|e| {
                EngineError::Unavailable(format!(
                    "missing entry symbol `{}` in {}: {}",
                    ENTRY_SYMBOL,
                    path.display(),
                    e
                ))
            })?;
            entry()
        };

        let origin = path.display().to_string();
        // SAFETY: a non-null pointer points into the library, which `build` keeps alive.
        let vtable = unsafe { read_vtable(vtable_ptr, &origin) }?;
        // SAFETY: the vtable's functions live in `library`.
        unsafe { Self::build(vtable, Some(library), &origin) }
    }

    /// Construct the engine from a vtable linked into this binary.
    ///
    /// # Safety
    ///
    /// Every function in `vtable` must honor the ABI contract and stay valid
    /// for the life of the engine.
    pub unsafe fn from_vtable(vtable: NativeVTable) -> Result<Self, EngineError> {
        // SAFETY: forwarded from the caller.
        unsafe { Self::build(vtable, None, "static vtable") }
    }

    unsafe fn build(
        vtable: NativeVTable,
        library: Option<Library>,
        origin: &str,
    ) -> Result<Self, EngineError> {
        if vtable.abi_version != ABI_VERSION {
            return Err(EngineError::Unavailable(format!(
                "native engine `{}` ABI mismatch: expected {}, got {}",
                origin, ABI_VERSION, vtable.abi_version
            )));
        }

        // SAFETY: `create` comes from a vtable of the expected ABI revision.
        let handle = unsafe { (vtable.create)(SAMPLE_RATE as u32) };
        if handle.is_null() {
            return Err(EngineError::Unavailable(format!(
                "native engine `{}` failed to create an instance",
                origin
            )));
        }

        let mut engine = Self {
            vtable,
            handle,
            params: ParameterSet::default(),
            _library: library,
        };
        engine.push_parameters();
        log::info!("Native engine created from {}", origin);
        Ok(engine)
    }

    fn push_parameters(&mut self) {
        for param in Parameter::ALL {
            let value = self.params.get(param);
            // SAFETY: handle is live until Drop.
            unsafe { (self.vtable.set_parameter)(self.handle, param.id(), value) };
        }
        // SAFETY: handle is live until Drop.
        unsafe { (self.vtable.set_mod_enabled)(self.handle, self.params.mod_enabled) };
    }
}

/// Copy the vtable out of `ptr`, rejecting null.
///
/// # Safety
///
/// A non-null `ptr` must point to a valid `NativeVTable`.
unsafe fn read_vtable(
    ptr: *const NativeVTable,
    origin: &str,
) -> Result<NativeVTable, EngineError> {
    if ptr.is_null() {
        return Err(EngineError::Unavailable(format!(
            "native engine `{}` returned a null vtable",
            origin
        )));
    }
    // SAFETY: non-null, and valid per the caller.
    Ok(unsafe { *ptr })
}

impl Engine for NativeEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    fn is_initialized(&self) -> bool {
        // SAFETY: handle is live until Drop.
        unsafe { (self.vtable.is_initialized)(self.handle) }
    }

    fn set_parameter(&mut self, param: Parameter, value: f32) -> f32 {
        let stored = self.params.set(param, value);
        // SAFETY: handle is live until Drop; the value is already clamped.
        unsafe { (self.vtable.set_parameter)(self.handle, param.id(), stored) };
        stored
    }

    fn set_mod_enabled(&mut self, enabled: bool) {
        self.params.mod_enabled = enabled;
        // SAFETY: handle is live until Drop.
        unsafe { (self.vtable.set_mod_enabled)(self.handle, enabled) };
    }

    fn parameters(&self) -> ParameterSet {
        self.params
    }

    fn process_block(&mut self, block: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; block.len()];
        if block.is_empty() {
            return out;
        }
        // SAFETY: both buffers hold exactly `block.len()` samples.
        unsafe {
            (self.vtable.process)(self.handle, block.as_ptr(), out.as_mut_ptr(), block.len())
        };
        out
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        // SAFETY: handle came from `create` and is destroyed exactly once.
        unsafe { (self.vtable.destroy)(self.handle) };
    }
}
