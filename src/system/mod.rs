// Copyright (c) Viable Systems
// SPDX-License-Identifier: MIT

pub mod capture;
pub mod decoder;
pub mod reassembly;
pub mod sniffer;
pub mod stream;

pub use self::sniffer::Sniffer;
