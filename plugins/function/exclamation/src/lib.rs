use fnhost_api::config::{ConfigParam, ConfigValues, ParamType, ParamValue};
use fnhost_api::error::FunctionError;
use fnhost_api::function::PlainFunction;

pub const CLASS_NAME: &str = "exclamation";

/// Appends a suffix (`!` unless configured) to every input.
pub struct Exclamation {
    suffix: Vec<u8>,
}

impl Exclamation {
    pub fn new(suffix: impl Into<Vec<u8>>) -> Self {
        Self { suffix: suffix.into() }
    }

    pub fn config_params() -> Vec<ConfigParam> {
        vec![suffix_param()]
    }

    pub fn from_config(config: &ConfigValues) -> Self {
        Self::new(config.get_str("suffix").unwrap_or("!"))
    }
}

fn suffix_param() -> ConfigParam {
    ConfigParam::optional("suffix", ParamType::Str, ParamValue::Str("!".into())).describe("Appended to every input")
}

impl PlainFunction for Exclamation {
    fn apply(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, FunctionError> {
        let mut out = Vec::with_capacity(input.len() + self.suffix.len());
        out.extend_from_slice(input);
        out.extend_from_slice(&self.suffix);
        Ok(Some(out))
    }
}

// ---------------------------------------------------------------------------
// FFI exports for dynamic (.so) loading
// ---------------------------------------------------------------------------

fnhost_api::fnhost_abi_version_fn!();
fnhost_api::fnhost_config_params_fn!([suffix_param()]);

/// # Safety
///
/// `config_ptr` must point to a valid `ConfigValues` owned by the engine.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fnhost_create_plain_function(config_ptr: *const ()) -> fnhost_api::ffi::PluginCreateResult {
    let config = unsafe { fnhost_api::ffi::config_from_ptr(config_ptr) };
    fnhost_api::ffi::plugin_ok(Box::new(Box::new(Exclamation::from_config(config)) as Box<dyn PlainFunction>))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_default_suffix() {
        let mut f = Exclamation::from_config(&ConfigValues::new());
        assert_eq!(f.apply(b"hello").unwrap(), Some(b"hello!".to_vec()));
    }

    #[test]
    fn appends_configured_suffix() {
        let mut config = ConfigValues::new();
        config.set("suffix", ParamValue::Str("?!".into()));
        let mut f = Exclamation::from_config(&config);
        assert_eq!(f.apply(b"what").unwrap(), Some(b"what?!".to_vec()));
    }
}
