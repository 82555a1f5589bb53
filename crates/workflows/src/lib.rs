//! Built-in workflow tasks.
//!
//! These are ordinary task implementations, written to the same contract
//! any downstream task crate follows: deterministic bodies, all side
//! effects through `call_host_tool`, the suspension sentinel propagated
//! with `?`. Linking this crate into the server binary is what registers
//! them.

pub mod domain_inventory;
pub mod research_brief;
pub mod send_report;

pub use domain_inventory::DomainInventory;
pub use research_brief::ResearchBrief;
pub use send_report::SendReport;
