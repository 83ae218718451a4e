// SPDX-License-Identifier: Apache-2.0

pub mod consumer;
pub mod debug;
pub mod fanout;
pub mod payload;
