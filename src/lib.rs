// SPDX-License-Identifier: MIT OR Apache-2.0
// SPDX-FileCopyrightText: 2025 1BitSquared <info@1bitsquared.com>

pub mod driver;
pub mod error;
pub mod firmware;
pub mod jtag;
pub mod probe;
pub mod protocol;
pub mod tap;
pub mod usb;
