use crate::config::{ConfigParam, ConfigValues};

/// Current ABI version. Host checks this against plugin's `fnhost_abi_version()`.
pub const FNHOST_ABI_VERSION: u32 = 1;

/// Symbol exporting a [`crate::function::Function`].
pub const CREATE_FUNCTION_SYMBOL: &[u8] = b"fnhost_create_function";
/// Symbol exporting a [`crate::function::PlainFunction`].
pub const CREATE_PLAIN_FUNCTION_SYMBOL: &[u8] = b"fnhost_create_plain_function";
/// Symbol exporting a custom [`crate::source::Source`].
pub const CREATE_SOURCE_SYMBOL: &[u8] = b"fnhost_create_source";
/// Symbol exporting a custom [`crate::sink::Sink`].
pub const CREATE_SINK_SYMBOL: &[u8] = b"fnhost_create_sink";

/// FFI return struct from `fnhost_create_*` functions.
#[repr(C)]
pub struct PluginCreateResult {
    /// Pointer to the created plugin object (Box<Box<dyn Trait>>).
    /// Null if creation failed.
    pub plugin_ptr: *mut (),
    /// Pointer to a heap-allocated error string.
    /// Null if creation succeeded.
    pub error_ptr: *mut u8,
    /// Length of the error string.
    pub error_len: usize,
}

/// Type signature for `fnhost_abi_version` symbol.
pub type AbiVersionFn = unsafe extern "C" fn() -> u32;

/// Type signature for `fnhost_config_params` symbol.
/// Returns a pointer to a boxed `Vec<ConfigParam>`. Caller takes ownership.
pub type ConfigParamsFn = unsafe extern "C" fn() -> *mut ();

/// Type signature for `fnhost_create_*` symbols.
/// Takes a pointer to engine-owned `ConfigValues` (plugin borrows, does not own).
pub type CreatePluginFn = unsafe extern "C" fn(*const ()) -> PluginCreateResult;

/// Helper: create a successful `PluginCreateResult` from a trait object.
pub fn plugin_ok<T: ?Sized>(plugin: Box<Box<T>>) -> PluginCreateResult {
    PluginCreateResult {
        plugin_ptr: Box::into_raw(plugin) as *mut (),
        error_ptr: std::ptr::null_mut(),
        error_len: 0,
    }
}

/// Helper: create a failed `PluginCreateResult` from an error message.
pub fn plugin_err(msg: &str) -> PluginCreateResult {
    let bytes = msg.as_bytes().to_vec();
    let len = bytes.len();
    let ptr = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
    PluginCreateResult {
        plugin_ptr: std::ptr::null_mut(),
        error_ptr: ptr,
        error_len: len,
    }
}

/// Helper: return config params from plugin to engine.
/// Engine will reconstruct as `Box<Vec<ConfigParam>>` and take ownership.
pub fn config_params_ok(params: Vec<ConfigParam>) -> *mut () {
    Box::into_raw(Box::new(params)) as *mut ()
}

/// Cast an FFI config pointer to a `&ConfigValues` reference.
///
/// # Safety
///
/// `ptr` must be a valid pointer to a `ConfigValues` value owned by the engine.
pub unsafe fn config_from_ptr<'a>(ptr: *const ()) -> &'a ConfigValues {
    unsafe { &*(ptr as *const ConfigValues) }
}

/// Macro: export `fnhost_abi_version` function.
#[macro_export]
macro_rules! fnhost_abi_version_fn {
    () => {
        #[unsafe(no_mangle)]
        pub extern "C" fn fnhost_abi_version() -> u32 {
            $crate::ffi::FNHOST_ABI_VERSION
        }
    };
}

/// Macro: export `fnhost_config_params` function with a manual list
/// (e.g. `fnhost_config_params_fn!([])` for functions with no user config).
#[macro_export]
macro_rules! fnhost_config_params_fn {
    ([$($param:expr),* $(,)?]) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn fnhost_config_params() -> *mut () {
            $crate::ffi::config_params_ok(vec![$($param),*])
        }
    };
}
