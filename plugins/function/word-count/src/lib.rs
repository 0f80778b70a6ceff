use fnhost_api::BoxFuture;
use fnhost_api::context::{Context, LogLevel};
use fnhost_api::error::FunctionError;
use fnhost_api::function::Function;

pub const CLASS_NAME: &str = "word-count";

/// Counts words into the function's state table. Emits nothing.
#[derive(Default)]
pub struct WordCount;

impl WordCount {
    pub fn new() -> Self {
        Self
    }
}

impl Function for WordCount {
    fn process<'a>(
        &'a mut self,
        input: &'a [u8],
        ctx: &'a dyn Context,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, FunctionError>> {
        Box::pin(async move {
            let text = std::str::from_utf8(input)?;
            let state = ctx.state().ok_or("word-count needs a state table")?;

            let mut words = 0;
            for word in text.split_whitespace() {
                state.incr_counter(word.as_bytes(), 1).await?;
                words += 1;
            }
            ctx.record_metric("words", words as f64);
            ctx.log(LogLevel::Debug, &format!("counted {words} words"));
            Ok(None)
        })
    }
}

// ---------------------------------------------------------------------------
// FFI exports for dynamic (.so) loading
// ---------------------------------------------------------------------------

fnhost_api::fnhost_abi_version_fn!();
fnhost_api::fnhost_config_params_fn!([]);

/// # Safety
///
/// `_config_ptr` must point to a valid `ConfigValues` owned by the engine.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fnhost_create_function(_config_ptr: *const ()) -> fnhost_api::ffi::PluginCreateResult {
    fnhost_api::ffi::plugin_ok(Box::new(Box::new(WordCount::new()) as Box<dyn Function>))
}
