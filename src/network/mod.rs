//! Network module — the worker process group
//!
//! Workers communicate only through `Communicator` endpoints: collectives
//! for seeds, instructions and reports, tagged point-to-point transfers for
//! genome exchange.

mod comm;
mod exchange;
mod protocol;

pub use comm::{local_group, Communicator};
pub use exchange::exchange_genomes;
pub use protocol::{plan_exchange, SlotInstruction, SlotReport, Tag};
