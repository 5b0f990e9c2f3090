// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Generic links built on the runtime.

pub mod dup;
pub mod null;
pub mod null_src;

pub use dup::DupLink;
pub use null::NullLink;
pub use null_src::{NullSrc, NullSrcParams};
