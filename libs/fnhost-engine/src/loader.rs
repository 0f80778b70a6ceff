//! Code loading.
//!
//! A [`FunctionLoader`] resolves the user callable (and optional custom source
//! and sink) of a function. Instances register with the loader on startup and
//! unregister on teardown; the loader may release the function's code once no
//! instance is left.
//!
//! Two implementations:
//! - [`SharedLibraryCache`] loads `.so` packages through the C ABI declared in
//!   `fnhost_api::ffi`;
//! - [`StaticLoader`] resolves class names against factories compiled into the
//!   host.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libloading::{Library, Symbol};

use fnhost_api::BoxFuture;
use fnhost_api::config::{ConfigParam, ConfigValues, ParamType, ParamValue};
use fnhost_api::context::Context;
use fnhost_api::error::{FunctionError, PluginError};
use fnhost_api::ffi::{
    AbiVersionFn, ConfigParamsFn, CreatePluginFn, PluginCreateResult, CREATE_FUNCTION_SYMBOL,
    CREATE_PLAIN_FUNCTION_SYMBOL, CREATE_SINK_SYMBOL, CREATE_SOURCE_SYMBOL, FNHOST_ABI_VERSION,
};
use fnhost_api::function::{Function, PlainFunction, UserFunction};
use fnhost_api::record::Record;
use fnhost_api::sink::{Sink, SinkRecord};
use fnhost_api::source::Source;

use crate::error::InstanceError;
use crate::sync::lock;

/// A loaded object together with its validated configuration.
pub struct Loaded<T> {
    pub object: T,
    pub config: ConfigValues,
}

impl<T> std::fmt::Debug for Loaded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loaded").field("config", &self.config).finish_non_exhaustive()
    }
}

pub trait FunctionLoader: Send + Sync {
    /// Register one instance of `function_id` whose code lives in `package`.
    fn register(&self, function_id: &str, instance: &str, package: &str) -> Result<(), InstanceError>;

    /// Resolve the user callable. The result is already verified to be one of
    /// the two supported shapes.
    fn load_function(
        &self,
        function_id: &str,
        class_name: &str,
        user_config: Option<&serde_json::Value>,
    ) -> Result<Loaded<UserFunction>, InstanceError>;

    fn load_source(
        &self,
        function_id: &str,
        class_name: &str,
        configs: Option<&serde_json::Value>,
    ) -> Result<Loaded<Box<dyn Source>>, InstanceError>;

    fn load_sink(
        &self,
        function_id: &str,
        class_name: &str,
        configs: Option<&serde_json::Value>,
    ) -> Result<Loaded<Box<dyn Sink>>, InstanceError>;

    /// Drop the registration made by `register`. Unknown pairs are ignored.
    fn unregister(&self, function_id: &str, instance: &str);
}

// ---------------------------------------------------------------------------
// Config parsing & validation
// ---------------------------------------------------------------------------

/// Validate `config` against declared parameters, or convert it loosely when
/// the plugin declares none.
pub fn build_config(config: Option<&serde_json::Value>, params: &[ConfigParam]) -> Result<ConfigValues, InstanceError> {
    if params.is_empty() {
        loose_config(config)
    } else {
        let parsed = parse_plugin_config(config, params)?;
        validate_and_build(&parsed, params)
    }
}

/// Convert declared parameters present in `config`.
///
/// Rejects keys not declared in `params`. Defaults and required checks are
/// handled by [`validate_and_build`].
pub fn parse_plugin_config(
    config: Option<&serde_json::Value>,
    params: &[ConfigParam],
) -> Result<HashMap<String, ParamValue>, InstanceError> {
    let obj = match config {
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => return Err(InstanceError::Config("plugin config must be a table".into())),
        None => return Ok(HashMap::new()),
    };

    let known: HashSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
    if let Some(key) = obj.keys().find(|k| !known.contains(k.as_str())) {
        return Err(InstanceError::Config(format!("unknown parameter '{key}'")));
    }

    let mut result = HashMap::new();
    for param in params {
        if let Some(v) = obj.get(&param.name) {
            result.insert(param.name.clone(), value_to_param_value(v, param)?);
        }
    }
    Ok(result)
}

/// Apply defaults and enforce required parameters.
pub fn validate_and_build(
    parsed: &HashMap<String, ParamValue>,
    params: &[ConfigParam],
) -> Result<ConfigValues, InstanceError> {
    let mut values = ConfigValues::new();
    for param in params {
        match (parsed.get(&param.name), &param.default) {
            (Some(v), _) => values.set(&param.name, v.clone()),
            (None, Some(default)) => values.set(&param.name, default.clone()),
            (None, None) if param.required => {
                return Err(InstanceError::Config(format!(
                    "missing required parameter '{}'",
                    param.name
                )));
            }
            (None, None) => {}
        }
    }
    Ok(values)
}

fn value_to_param_value(val: &serde_json::Value, param: &ConfigParam) -> Result<ParamValue, InstanceError> {
    let mismatch = |expected: &str| InstanceError::Config(format!("parameter '{}': expected {expected}", param.name));
    match param.param_type {
        ParamType::Bool => val.as_bool().map(ParamValue::Bool).ok_or_else(|| mismatch("bool")),
        ParamType::I64 => val.as_i64().map(ParamValue::I64).ok_or_else(|| mismatch("integer")),
        ParamType::U64 => {
            if let Some(u) = val.as_u64() {
                return Ok(ParamValue::U64(u));
            }
            match val.as_i64() {
                Some(i) => Err(InstanceError::Config(format!(
                    "parameter '{}': expected non-negative integer, got {i}",
                    param.name
                ))),
                None => Err(mismatch("integer")),
            }
        }
        ParamType::F64 => val.as_f64().map(ParamValue::F64).ok_or_else(|| mismatch("float")),
        ParamType::Str => Ok(ParamValue::Str(flatten_value(val))),
    }
}

/// Convert an undeclared config table key by key, typing each value by its
/// JSON shape.
fn loose_config(config: Option<&serde_json::Value>) -> Result<ConfigValues, InstanceError> {
    let mut values = ConfigValues::new();
    let obj = match config {
        Some(serde_json::Value::Object(map)) => map,
        Some(serde_json::Value::Null) | None => return Ok(values),
        Some(_) => return Err(InstanceError::Config("plugin config must be a table".into())),
    };
    for (key, val) in obj {
        let value = match val {
            serde_json::Value::Bool(b) => ParamValue::Bool(*b),
            serde_json::Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
                (Some(i), _, _) => ParamValue::I64(i),
                (None, Some(u), _) => ParamValue::U64(u),
                (_, _, Some(f)) => ParamValue::F64(f),
                _ => ParamValue::Str(n.to_string()),
            },
            other => ParamValue::Str(flatten_value(other)),
        };
        values.set(key.clone(), value);
    }
    Ok(values)
}

/// Scalars as-is, arrays and objects as JSON text.
fn flatten_value(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => val.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Shared libraries
// ---------------------------------------------------------------------------

/// An opened `.so` package with a verified ABI version.
struct PluginLib {
    path: PathBuf,
    lib: Library,
}

impl PluginLib {
    fn open(path: &Path) -> Result<Self, InstanceError> {
        let what = path.display().to_string();
        // Safety: loading runs the library's initializers; packages are trusted code.
        let lib = unsafe { Library::new(path) }.map_err(|e| InstanceError::load(&what, e))?;

        let abi_fn: Symbol<AbiVersionFn> = unsafe { lib.get(b"fnhost_abi_version") }
            .map_err(|e| InstanceError::load(&what, format!("missing fnhost_abi_version symbol: {e}")))?;
        let plugin_abi = unsafe { abi_fn() };
        if plugin_abi != FNHOST_ABI_VERSION {
            return Err(InstanceError::load(
                &what,
                format!("ABI version mismatch: plugin={plugin_abi}, host={FNHOST_ABI_VERSION}"),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            lib,
        })
    }

    fn create_fn(&self, symbol: &[u8]) -> Option<CreatePluginFn> {
        unsafe { self.lib.get::<CreatePluginFn>(symbol) }.ok().map(|s| *s)
    }

    fn config_params(&self) -> Vec<ConfigParam> {
        let Ok(params_fn) = (unsafe { self.lib.get::<ConfigParamsFn>(b"fnhost_config_params") }) else {
            return Vec::new();
        };
        let ptr = unsafe { params_fn() };
        if ptr.is_null() {
            return Vec::new();
        }
        // Safety: the export macro hands over a `Box<Vec<ConfigParam>>`.
        unsafe { *Box::from_raw(ptr as *mut Vec<ConfigParam>) }
    }

    /// Call a `fnhost_create_*` export with validated config.
    fn create(&self, create_fn: CreatePluginFn, config: &ConfigValues) -> Result<*mut (), InstanceError> {
        let result: PluginCreateResult = unsafe { create_fn(config as *const ConfigValues as *const ()) };
        if !result.plugin_ptr.is_null() {
            return Ok(result.plugin_ptr);
        }

        let msg = if !result.error_ptr.is_null() && result.error_len > 0 {
            // Safety: `plugin_err` leaked a boxed byte slice of this length.
            let bytes = unsafe { Box::from_raw(std::ptr::slice_from_raw_parts_mut(result.error_ptr, result.error_len)) };
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            "unknown error".to_string()
        };
        Err(InstanceError::load(self.path.display().to_string(), format!("create failed: {msg}")))
    }
}

// Wrappers keep the library mapped for as long as an object created from it
// is alive. Fields drop in declaration order: the object before the library.

struct LibFunction {
    inner: Box<dyn Function>,
    _lib: Arc<PluginLib>,
}

impl Function for LibFunction {
    fn process<'a>(
        &'a mut self,
        input: &'a [u8],
        ctx: &'a dyn Context,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, FunctionError>> {
        self.inner.process(input, ctx)
    }

    fn close(&mut self) -> Result<(), FunctionError> {
        self.inner.close()
    }
}

struct LibPlainFunction {
    inner: Box<dyn PlainFunction>,
    _lib: Arc<PluginLib>,
}

impl PlainFunction for LibPlainFunction {
    fn apply(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, FunctionError> {
        self.inner.apply(input)
    }

    fn close(&mut self) -> Result<(), FunctionError> {
        self.inner.close()
    }
}

struct LibSource {
    inner: Box<dyn Source>,
    _lib: Arc<PluginLib>,
}

impl Source for LibSource {
    fn open<'a>(&'a mut self, config: &'a ConfigValues, ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        self.inner.open(config, ctx)
    }

    fn read(&mut self) -> BoxFuture<'_, Result<Option<Record>, PluginError>> {
        self.inner.read()
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        self.inner.close()
    }
}

struct LibSink {
    inner: Box<dyn Sink>,
    _lib: Arc<PluginLib>,
}

impl Sink for LibSink {
    fn open<'a>(&'a mut self, config: &'a ConfigValues, ctx: &'a dyn Context) -> BoxFuture<'a, Result<(), PluginError>> {
        self.inner.open(config, ctx)
    }

    fn write(&mut self, record: SinkRecord) -> BoxFuture<'_, Result<(), PluginError>> {
        self.inner.write(record)
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), PluginError>> {
        self.inner.close()
    }
}

struct CachedPackage {
    lib: Arc<PluginLib>,
    instances: HashSet<String>,
}

/// Loads function packages from shared libraries, one library per function
/// id, shared by every registered instance of that function.
#[derive(Default)]
pub struct SharedLibraryCache {
    packages: Mutex<HashMap<String, CachedPackage>>,
}

impl SharedLibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instances registered for `function_id`.
    pub fn instance_count(&self, function_id: &str) -> usize {
        lock(&self.packages)
            .get(function_id)
            .map(|p| p.instances.len())
            .unwrap_or(0)
    }

    fn library(&self, function_id: &str) -> Result<Arc<PluginLib>, InstanceError> {
        lock(&self.packages)
            .get(function_id)
            .map(|p| p.lib.clone())
            .ok_or_else(|| InstanceError::load(function_id, "function is not registered"))
    }
}

impl FunctionLoader for SharedLibraryCache {
    fn register(&self, function_id: &str, instance: &str, package: &str) -> Result<(), InstanceError> {
        let mut packages = lock(&self.packages);
        if let Some(cached) = packages.get_mut(function_id) {
            if cached.lib.path != Path::new(package) {
                return Err(InstanceError::load(
                    package,
                    format!(
                        "function '{function_id}' is already registered from '{}'",
                        cached.lib.path.display()
                    ),
                ));
            }
            cached.instances.insert(instance.to_string());
            return Ok(());
        }

        let lib = PluginLib::open(Path::new(package))?;
        tracing::info!(function_id, package, "loaded function package");
        packages.insert(
            function_id.to_string(),
            CachedPackage {
                lib: Arc::new(lib),
                instances: HashSet::from([instance.to_string()]),
            },
        );
        Ok(())
    }

    fn load_function(
        &self,
        function_id: &str,
        class_name: &str,
        user_config: Option<&serde_json::Value>,
    ) -> Result<Loaded<UserFunction>, InstanceError> {
        let lib = self.library(function_id)?;
        let config = build_config(user_config, &lib.config_params())
            .map_err(|e| e.with_context(format!("function '{class_name}'")))?;

        let object = if let Some(create) = lib.create_fn(CREATE_FUNCTION_SYMBOL) {
            let ptr = lib.create(create, &config)?;
            // Safety: `fnhost_create_function` returns a `Box<Box<dyn Function>>`.
            let inner = unsafe { *Box::from_raw(ptr as *mut Box<dyn Function>) };
            UserFunction::Contextual(Box::new(LibFunction { inner, _lib: lib }))
        } else if let Some(create) = lib.create_fn(CREATE_PLAIN_FUNCTION_SYMBOL) {
            let ptr = lib.create(create, &config)?;
            // Safety: `fnhost_create_plain_function` returns a `Box<Box<dyn PlainFunction>>`.
            let inner = unsafe { *Box::from_raw(ptr as *mut Box<dyn PlainFunction>) };
            UserFunction::Plain(Box::new(LibPlainFunction { inner, _lib: lib }))
        } else {
            return Err(InstanceError::load(
                class_name,
                "package exports neither a function nor a plain function",
            ));
        };
        Ok(Loaded { object, config })
    }

    fn load_source(
        &self,
        function_id: &str,
        class_name: &str,
        configs: Option<&serde_json::Value>,
    ) -> Result<Loaded<Box<dyn Source>>, InstanceError> {
        let lib = self.library(function_id)?;
        let create = lib
            .create_fn(CREATE_SOURCE_SYMBOL)
            .ok_or_else(|| InstanceError::load(class_name, "package exports no source"))?;
        let config = build_config(configs, &[])?;
        let ptr = lib.create(create, &config)?;
        // Safety: `fnhost_create_source` returns a `Box<Box<dyn Source>>`.
        let inner = unsafe { *Box::from_raw(ptr as *mut Box<dyn Source>) };
        Ok(Loaded {
            object: Box::new(LibSource { inner, _lib: lib }),
            config,
        })
    }

    fn load_sink(
        &self,
        function_id: &str,
        class_name: &str,
        configs: Option<&serde_json::Value>,
    ) -> Result<Loaded<Box<dyn Sink>>, InstanceError> {
        let lib = self.library(function_id)?;
        let create = lib
            .create_fn(CREATE_SINK_SYMBOL)
            .ok_or_else(|| InstanceError::load(class_name, "package exports no sink"))?;
        let config = build_config(configs, &[])?;
        let ptr = lib.create(create, &config)?;
        // Safety: `fnhost_create_sink` returns a `Box<Box<dyn Sink>>`.
        let inner = unsafe { *Box::from_raw(ptr as *mut Box<dyn Sink>) };
        Ok(Loaded {
            object: Box::new(LibSink { inner, _lib: lib }),
            config,
        })
    }

    fn unregister(&self, function_id: &str, instance: &str) {
        let mut packages = lock(&self.packages);
        let Some(cached) = packages.get_mut(function_id) else {
            return;
        };
        cached.instances.remove(instance);
        if cached.instances.is_empty() {
            packages.remove(function_id);
            tracing::info!(function_id, "released function package");
        }
    }
}

// ---------------------------------------------------------------------------
// In-process factories
// ---------------------------------------------------------------------------

pub type FunctionFactory = Box<dyn Fn(&ConfigValues) -> Result<UserFunction, PluginError> + Send + Sync>;
pub type SourceFactory = Box<dyn Fn(&ConfigValues) -> Result<Box<dyn Source>, PluginError> + Send + Sync>;
pub type SinkFactory = Box<dyn Fn(&ConfigValues) -> Result<Box<dyn Sink>, PluginError> + Send + Sync>;

struct Entry<F> {
    params: Vec<ConfigParam>,
    factory: F,
}

/// Resolves class names against factories registered at startup.
#[derive(Default)]
pub struct StaticLoader {
    functions: HashMap<String, Entry<FunctionFactory>>,
    sources: HashMap<String, Entry<SourceFactory>>,
    sinks: HashMap<String, Entry<SinkFactory>>,
    registered: Mutex<HashMap<String, HashSet<String>>>,
}

impl StaticLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(
        mut self,
        class_name: impl Into<String>,
        params: Vec<ConfigParam>,
        factory: impl Fn(&ConfigValues) -> Result<UserFunction, PluginError> + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(
            class_name.into(),
            Entry {
                params,
                factory: Box::new(factory),
            },
        );
        self
    }

    pub fn with_source(
        mut self,
        class_name: impl Into<String>,
        factory: impl Fn(&ConfigValues) -> Result<Box<dyn Source>, PluginError> + Send + Sync + 'static,
    ) -> Self {
        self.sources.insert(
            class_name.into(),
            Entry {
                params: Vec::new(),
                factory: Box::new(factory),
            },
        );
        self
    }

    pub fn with_sink(
        mut self,
        class_name: impl Into<String>,
        factory: impl Fn(&ConfigValues) -> Result<Box<dyn Sink>, PluginError> + Send + Sync + 'static,
    ) -> Self {
        self.sinks.insert(
            class_name.into(),
            Entry {
                params: Vec::new(),
                factory: Box::new(factory),
            },
        );
        self
    }

    pub fn class_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn instance_count(&self, function_id: &str) -> usize {
        lock(&self.registered).get(function_id).map(HashSet::len).unwrap_or(0)
    }

    fn build<T, F>(
        entries: &HashMap<String, Entry<F>>,
        kind: &str,
        class_name: &str,
        raw: Option<&serde_json::Value>,
        create: impl Fn(&F, &ConfigValues) -> Result<T, PluginError>,
    ) -> Result<Loaded<T>, InstanceError> {
        let entry = entries
            .get(class_name)
            .ok_or_else(|| InstanceError::load(class_name, format!("unknown {kind} class")))?;
        let config = build_config(raw, &entry.params).map_err(|e| e.with_context(format!("{kind} '{class_name}'")))?;
        let object = create(&entry.factory, &config).map_err(|e| InstanceError::load(class_name, e))?;
        Ok(Loaded { object, config })
    }
}

impl FunctionLoader for StaticLoader {
    fn register(&self, function_id: &str, instance: &str, _package: &str) -> Result<(), InstanceError> {
        lock(&self.registered)
            .entry(function_id.to_string())
            .or_default()
            .insert(instance.to_string());
        Ok(())
    }

    fn load_function(
        &self,
        _function_id: &str,
        class_name: &str,
        user_config: Option<&serde_json::Value>,
    ) -> Result<Loaded<UserFunction>, InstanceError> {
        Self::build(&self.functions, "function", class_name, user_config, |f, c| f(c))
    }

    fn load_source(
        &self,
        _function_id: &str,
        class_name: &str,
        configs: Option<&serde_json::Value>,
    ) -> Result<Loaded<Box<dyn Source>>, InstanceError> {
        Self::build(&self.sources, "source", class_name, configs, |f, c| f(c))
    }

    fn load_sink(
        &self,
        _function_id: &str,
        class_name: &str,
        configs: Option<&serde_json::Value>,
    ) -> Result<Loaded<Box<dyn Sink>>, InstanceError> {
        Self::build(&self.sinks, "sink", class_name, configs, |f, c| f(c))
    }

    fn unregister(&self, function_id: &str, instance: &str) {
        let mut registered = lock(&self.registered);
        if let Some(instances) = registered.get_mut(function_id) {
            instances.remove(instance);
            if instances.is_empty() {
                registered.remove(function_id);
            }
        }
    }
}
