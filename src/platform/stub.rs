//! Fallback for builds without a desktop integration.

use super::Collaborators;
use crate::error::Result;

pub fn request_permissions() -> Result<()> {
    Err(super::unsupported("desktop permission"))
}

pub fn collaborators() -> Result<Collaborators> {
    Err(super::unsupported("screen/input/speech"))
}
