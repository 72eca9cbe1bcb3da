// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Allocation support for crash handlers.
//!
//! The regular heap allocator may be holding its own lock at the instant a
//! fault interrupts a thread. Anything that allocates from inside the signal
//! handler would then deadlock. This crate provides a lock-free allocator that
//! carves memory out of freshly mapped pages, and a [SignalSafeAlloc] global
//! allocator wrapper that routes to it while the process-wide
//! [page allocator mode](enable_page_allocator) is engaged.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod mode;
pub mod os;
mod page;
mod utils;

pub use mode::*;
pub use page::*;

// Expose allocator_api2 for our users.
pub use allocator_api2::alloc::{AllocError, Allocator};
