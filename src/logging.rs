/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The service logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs with at least three values. The first three are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as seconds since the Unix Epoch).
//! 3. The first seven characters of the Base64 encoding of the chain id.
//!
//! The rest of the values differ by event kind. For example, a commit is printed as:
//!
//! ```text
//! CommitBlock, 1701329264, Id5u7f6, fNGCJyk, 12
//! ```
//!
//! where the fourth value is the short id of the block and the fifth its index.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const PROPOSE_BLOCK: &str = "ProposeBlock";
pub const VERIFY_BLOCK: &str = "VerifyBlock";
pub const COLLECT_TX: &str = "CollectTx";
pub const VIEW_CHANGE_START: &str = "ViewChangeStart";
pub const VIEW_CHANGE_COMPLETE: &str = "ViewChangeComplete";
pub const START_CATCH_UP: &str = "StartCatchUp";
pub const END_CATCH_UP: &str = "EndCatchUp";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.chain_id.bytes()),
                first_seven_base64_chars(&event.block.bytes()),
                event.index
            )
        })
    }
}

impl Logger for ProposeBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ProposeBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.chain_id.bytes()),
                event.index,
                event.tx_count
            )
        })
    }
}

impl Logger for VerifyBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &VerifyBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                VERIFY_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.chain_id.bytes()),
                event.index,
                event.valid
            )
        })
    }
}

impl Logger for CollectTxEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &CollectTxEvent| {
            log::debug!(
                "{}, {}, {}, {}",
                COLLECT_TX,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.chain_id.bytes()),
                event.collected
            )
        })
    }
}

impl Logger for ViewChangeStartEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewChangeStartEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VIEW_CHANGE_START,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.chain_id.bytes()),
                event.leader_index
            )
        })
    }
}

impl Logger for ViewChangeCompleteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ViewChangeCompleteEvent| {
            log::info!(
                "{}, {}, {}, {}",
                VIEW_CHANGE_COMPLETE,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.chain_id.bytes()),
                event.new_leader
            )
        })
    }
}

impl Logger for StartCatchUpEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartCatchUpEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                START_CATCH_UP,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.chain_id.bytes()),
                event.from.map(|i| i.int() as i64).unwrap_or(-1),
                event.to,
                event.download
            )
        })
    }
}

impl Logger for EndCatchUpEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &EndCatchUpEvent| {
            log::info!(
                "{}, {}, {}, {}",
                END_CATCH_UP,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.chain_id.bytes()),
                event.reached.map(|i| i.int() as i64).unwrap_or(-1)
            )
        })
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    encoded.chars().take(7).collect()
}
