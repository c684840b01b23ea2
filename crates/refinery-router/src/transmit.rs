// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract with the upstream transmission sink. Enqueueing is
//! fire-and-forget: the sink owns its buffering and accounts for its own
//! drops, so there is nothing useful to return here.

use crate::types::Event;

pub trait Transmission: Send + Sync {
    fn enqueue_event(&self, event: Event);
}
