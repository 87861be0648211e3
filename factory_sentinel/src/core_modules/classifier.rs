// THEORY:
// The classifier is a black box: given a backend identifier, a JPEG and an
// instruction prompt, it returns free-form text. This module only fixes the
// seam. Concrete HTTP clients live with the binaries that own credentials.
//
// Errors returned here are always *backend* errors (transport, auth, quota,
// not-found). A reply that arrives but cannot be read as a verdict is not the
// classifier's problem; that is decided later by the verdict codec.

use crate::error::BackendError;
use futures::future::BoxFuture;

/// The instruction sent with every frame.
pub const SAFETY_PROMPT: &str = "You are a Factory Safety Officer. Analyze this image. \
Return ONLY JSON: {\"status\": \"SAFE\" or \"DANGER\", \"issue\": \"short description\", \
\"confidence\": 0-100}";

/// The minimal request used to check that a backend is alive.
pub const PROBE_PROMPT: &str = "Hi";

pub trait Classifier: Send + Sync {
    /// Submits one JPEG frame with `prompt` to `backend` and returns the reply text.
    fn classify<'a>(
        &'a self,
        backend: &'a str,
        image_jpeg: &'a [u8],
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<String, BackendError>>;

    /// Sends a minimal text-only request to `backend`.
    fn probe<'a>(&'a self, backend: &'a str) -> BoxFuture<'a, Result<(), BackendError>>;

    /// Lists backend identifiers the service currently offers.
    fn list_backends(&self) -> BoxFuture<'_, Result<Vec<String>, BackendError>> {
        Box::pin(async { Err(BackendError::Unsupported) })
    }
}
