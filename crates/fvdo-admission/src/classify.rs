//! Request validation and routing.
//!
//! A pure function over a request: either a parameter error or one of the
//! four dispatch routes. Operations outside the accepted set are
//! unrepresentable in [`RequestOp`], so the remaining checks are the
//! empty/non-empty payload rules and block alignment.

use fvdo_error::{Result, VdoError};
use fvdo_types::{Request, DEVICE_BLOCK_SIZE};

/// Where an accepted request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Flush or preflush the engine must process itself.
    FlushOwn,
    /// Flush or preflush delegated to the backing device: account it as
    /// acknowledged and remap.
    FlushPassthrough,
    /// Discard: admitted against both limiters.
    Discard,
    /// Read or write: admitted against the request limiter only.
    Data,
}

/// Validate `request` and pick its dispatch route.
///
/// `engine_owns_flushes` selects between the two flush routes; it is
/// derived from the instance's write policy.
pub fn classify(request: &Request, engine_owns_flushes: bool) -> Result<RequestClass> {
    if request.is_flush() {
        if request.payload_len != 0 {
            return Err(VdoError::InvalidRequest("flush requests must be empty"));
        }
        return Ok(if engine_owns_flushes {
            RequestClass::FlushOwn
        } else {
            RequestClass::FlushPassthrough
        });
    }

    if request.payload_len == 0 {
        return Err(VdoError::InvalidRequest("data requests must not be empty"));
    }
    if request.payload_len % DEVICE_BLOCK_SIZE != 0 {
        return Err(VdoError::InvalidRequest(
            "data payload must be a multiple of the device block size",
        ));
    }

    Ok(if request.is_discard() {
        RequestClass::Discard
    } else {
        RequestClass::Data
    })
}
