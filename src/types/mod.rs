/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types that are common across the sub-protocols of the ledger service.
//!
//! [basic] holds the "inert" newtypes that are sent around and inspected but have no active
//! behavior. [transaction] holds the client transaction and state change model, including the
//! domain-separated hashing discipline that signatures and instance-ID derivation rely on.
//! [block] holds the block, roster and chain configuration types.

pub mod basic;

pub mod transaction;

pub mod block;
