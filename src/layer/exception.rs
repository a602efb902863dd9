//! Turn error statuses into errors.
//!
//! Sits below Retry; converts an error status to [`Error::Status`], which
//! Retry re-runs until the budget is spent.

use crate::error::Error;
use crate::layer::{Call, Layer, Next};
use crate::response::Response;

pub(crate) struct ExceptionLayer;

impl Layer for ExceptionLayer {
    fn handle(&self, call: &mut Call<'_>, next: Next<'_>) -> Result<Response, Error> {
        let response = next.run(call)?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(Error::Status {
                status,
                response: Box::new(response),
            });
        }

        Ok(response)
    }
}
