// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod identifiers;
mod parameters;

pub use identifiers::*;
pub use parameters::*;
