// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Command batching and hazard tracking for a retained-mode graphics API layered on top of
//! Vulkan.
//!
//! # Brief summary
//!
//! - A [`Context`](crate::context::Context) receives state-change notifications and draw /
//!   dispatch calls from a frontend. It is the only object the frontend talks to.
//!
//! - State changes only mark [dirty bits](crate::dirty_bits). Right before a draw or dispatch,
//!   the handlers of the set bits run in ascending order and record whatever commands are needed
//!   to bring the device state up to date.
//!
//! - Commands are accumulated in two [command streams](crate::command_stream): one for commands
//!   that must be recorded outside of a render pass (copies, dispatches, barriers) and one for
//!   the currently open [render pass](crate::render_pass).
//!
//! - Every buffer and image touched by a command goes through the
//!   [hazard resolver](crate::hazard), which decides whether the access can be recorded as-is,
//!   whether the outside-render-pass stream must be flushed first, or whether the render pass
//!   must be closed.
//!
//! - Flushed streams are handed to the [submission scheduler](crate::submit), which decides when
//!   work goes to the device queue and tracks the [queue serials](crate::serial) needed to know
//!   when that work has completed.

use std::{error::Error, fmt};

#[macro_use]
mod tests;
pub(crate) mod macros;

pub mod command_stream;
pub mod context;
pub mod descriptor_set;
pub mod device;
pub mod dirty_bits;
pub mod driver_uniforms;
pub mod hazard;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod resource;
pub mod serial;
pub mod submit;
pub mod sync;

/// Represents memory size and offset values on a Vulkan device.
/// Analogous to the Rust `usize` type on the host.
pub use ash::vk::DeviceSize;

/// Error type returned by the device-level collaborators.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceError {
    /// A host memory allocation has failed.
    OutOfHostMemory,
    /// A device memory allocation has failed.
    OutOfDeviceMemory,
    /// The logical or physical device has been lost.
    DeviceLost,
    /// An unknown error has occurred.
    Unknown,
}

impl DeviceError {
    /// Returns whether the error leaves the device in an unusable state.
    #[inline]
    pub fn is_fatal(self) -> bool {
        matches!(self, DeviceError::DeviceLost | DeviceError::Unknown)
    }
}

impl Error for DeviceError {}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceError::OutOfHostMemory => "a host memory allocation has failed",
            DeviceError::OutOfDeviceMemory => "a device memory allocation has failed",
            DeviceError::DeviceLost => "the logical or physical device has been lost",
            DeviceError::Unknown => "an unknown error has occurred",
        })
    }
}

impl From<ash::vk::Result> for DeviceError {
    fn from(val: ash::vk::Result) -> DeviceError {
        match val {
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => DeviceError::OutOfHostMemory,
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => DeviceError::OutOfDeviceMemory,
            ash::vk::Result::ERROR_DEVICE_LOST => DeviceError::DeviceLost,
            _ => DeviceError::Unknown,
        }
    }
}

/// Error type returned when a memory allocation fails.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OomError {
    /// There is no memory available on the host (ie. the CPU, RAM, etc.).
    OutOfHostMemory,
    /// There is no memory available on the device (ie. video memory).
    OutOfDeviceMemory,
}

impl Error for OomError {}

impl fmt::Display for OomError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                OomError::OutOfHostMemory => "no memory available on the host",
                OomError::OutOfDeviceMemory => "no memory available on the graphical device",
            }
        )
    }
}

impl From<OomError> for DeviceError {
    #[inline]
    fn from(err: OomError) -> DeviceError {
        match err {
            OomError::OutOfHostMemory => DeviceError::OutOfHostMemory,
            OomError::OutOfDeviceMemory => DeviceError::OutOfDeviceMemory,
        }
    }
}

/// Error that can be returned by the public entry points of a [`Context`].
///
/// [`Context`]: crate::context::Context
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ContextError {
    /// The context was lost by an earlier operation. Nothing was recorded.
    ContextLost,
    /// A fatal device error happened during this operation. The context is now lost.
    Device(DeviceError),
    /// An allocation kept failing after every stage of the retry policy.
    Allocation(OomError),
    /// The operation is not supported with the current feature set. The context is unaffected.
    Unsupported(&'static str),
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ContextError::Device(err) => Some(err),
            ContextError::Allocation(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::ContextLost => f.write_str("the context has been lost"),
            ContextError::Device(_) => f.write_str("a fatal device error occurred"),
            ContextError::Allocation(_) => {
                f.write_str("a memory allocation failed after all retries")
            }
            ContextError::Unsupported(what) => write!(f, "unsupported operation: {}", what),
        }
    }
}

impl From<DeviceError> for ContextError {
    #[inline]
    fn from(err: DeviceError) -> ContextError {
        ContextError::Device(err)
    }
}

impl From<OomError> for ContextError {
    #[inline]
    fn from(err: OomError) -> ContextError {
        ContextError::Allocation(err)
    }
}

/// Used in `*CreateInfo` structs to make sure that they can be extended in the future without
/// breaking existing code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NonExhaustive(pub(crate) ());
