// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants and configuration shared by the collector and both backends.

pub(crate) mod configuration;
pub mod constants;
pub(crate) mod log;
