// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod common;
mod join_tests;
mod pipeline_tests;
mod window_tests;
