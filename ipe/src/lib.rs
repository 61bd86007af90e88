// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

#![warn(missing_docs)]

//! IPE is a frame-command compiler for the camera Image Processing Engine.
//!
//! This crate turns per-frame capture requests into firmware command-buffer programs.  Buffer
//! dimensions are negotiated once at pipeline setup.  After that, every request goes through the
//! zoom resolver, the program compiler, the reference-buffer manager and the bandwidth estimator
//! before the compiled packet is handed to a device driver.
//!
//! The compiler never touches hardware.  Cross-buffer addresses are expressed as patch
//! descriptors that the device driver resolves at submission time, and all collaborators (device
//! driver, property store, buffer manager, striping library) sit behind the traits in
//! [`backends`].

pub mod backends;
mod bandwidth;
mod blob;
mod caps;
mod cdm;
mod cmd;
mod compiler;
mod debug;
mod formats;
mod instance;
mod iq;
mod layout;
mod loopback;
mod negotiate;
mod node;
mod tuning;
mod types;
mod zoom;

pub use bandwidth::*;
pub use blob::*;
pub use caps::*;
pub use cdm::*;
pub use cmd::*;
pub use compiler::*;
pub use debug::*;
pub use formats::Format;
pub use instance::*;
pub use iq::*;
pub use layout::*;
pub use loopback::*;
pub use negotiate::*;
pub use node::*;
pub use tuning::*;
pub use types::*;
pub use zoom::*;
