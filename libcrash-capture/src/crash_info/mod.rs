// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod event;

pub use event::{event_id, make_signal_event, new_event};
