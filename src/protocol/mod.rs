/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

#[macro_use]
pub(crate) mod resp;

pub(crate) mod codec;
pub(crate) mod command;
pub(crate) mod reply;

pub use codec::RespCodec;
pub use command::{Command, Priority, SendMode};
pub use reply::{Reply, ReplyKind};
pub(crate) use resp::FromResp;
pub use resp::RespValue;
