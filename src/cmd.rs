// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Command vocabulary shared by every link.

use crate::msg::Prm;

pub const CREATE: u32 = 0x0000_0000;
pub const START: u32 = 0x0000_0001;
pub const STOP: u32 = 0x0000_0002;
pub const DELETE: u32 = 0x0000_0003;
/// A full buffer is available from the upstream link
pub const NEW_DATA: u32 = 0x0000_0004;
pub const GET_INFO: u32 = 0x0000_0005;
/// An empty buffer has been returned
pub const RELEASE_DATA: u32 = 0x0000_0006;
pub const PRINT_BUFFER_STATISTICS: u32 = 0x0000_0007;
/// Cross-core doorbell for the addressed link
pub const NOTIFY: u32 = 0x0000_0008;
/// Driver-defined command carrying a [`Control`] parameter
pub const CONTROL: u32 = 0x0000_0009;
pub const PRINT_STATISTICS: u32 = 0x0000_0FFF;

/// Link-private commands start here.
pub const LINK_PRIVATE_BASE: u32 = 0x0000_1000;

/// Terminates a task's dispatch loop. Never handed to a handler.
pub const EXIT: u32 = 0xFFFF_FFFF;

/// Parameter of [`CONTROL`]: a driver command id plus its opaque payload.
pub struct Control {
    pub id: u32,
    pub payload: Option<Prm>,
}

impl Control {
    pub fn new(id: u32, payload: Option<Prm>) -> Self {
        Self { id, payload }
    }
}

pub fn name(cmd: u32) -> &'static str {
    match cmd {
        CREATE => "CREATE",
        START => "START",
        STOP => "STOP",
        DELETE => "DELETE",
        NEW_DATA => "NEW_DATA",
        GET_INFO => "GET_INFO",
        RELEASE_DATA => "RELEASE_DATA",
        PRINT_BUFFER_STATISTICS => "PRINT_BUFFER_STATISTICS",
        NOTIFY => "NOTIFY",
        CONTROL => "CONTROL",
        PRINT_STATISTICS => "PRINT_STATISTICS",
        EXIT => "EXIT",
        _ => "PRIVATE",
    }
}
