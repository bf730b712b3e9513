// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

pub mod metrics;
