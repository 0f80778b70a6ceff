use crate::BoxFuture;
use crate::context::Context;
use crate::error::FunctionError;

/// Full-featured function shape: async, receives the invocation context.
///
/// Returning `Ok(None)` means "no output for this input".
pub trait Function: Send {
    fn process<'a>(
        &'a mut self,
        input: &'a [u8],
        ctx: &'a dyn Context,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, FunctionError>>;

    /// Release resources held by the function. Called once at teardown.
    fn close(&mut self) -> Result<(), FunctionError> {
        Ok(())
    }
}

/// Plain function shape: a synchronous transformation with no context.
pub trait PlainFunction: Send {
    fn apply(&mut self, input: &[u8]) -> Result<Option<Vec<u8>>, FunctionError>;

    fn close(&mut self) -> Result<(), FunctionError> {
        Ok(())
    }
}

/// A loaded user callable, already verified to match one of the two shapes.
pub enum UserFunction {
    Contextual(Box<dyn Function>),
    Plain(Box<dyn PlainFunction>),
}

impl UserFunction {
    pub fn shape(&self) -> &'static str {
        match self {
            UserFunction::Contextual(_) => "function",
            UserFunction::Plain(_) => "plain-function",
        }
    }

    pub async fn invoke(
        &mut self,
        input: &[u8],
        ctx: &dyn Context,
    ) -> Result<Option<Vec<u8>>, FunctionError> {
        match self {
            UserFunction::Contextual(f) => f.process(input, ctx).await,
            UserFunction::Plain(f) => f.apply(input),
        }
    }

    pub fn close(&mut self) -> Result<(), FunctionError> {
        match self {
            UserFunction::Contextual(f) => f.close(),
            UserFunction::Plain(f) => f.close(),
        }
    }
}

impl std::fmt::Debug for UserFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UserFunction").field(&self.shape()).finish()
    }
}
