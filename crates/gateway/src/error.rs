//! Gateway-level error type.

use thiserror::Error;

use crate::fabric::FabricError;
use periscope_browser::DriverError;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("session create failed: {0}")]
    SessionCreateFailed(String),

    #[error("session unavailable")]
    SessionUnavailable,

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}
