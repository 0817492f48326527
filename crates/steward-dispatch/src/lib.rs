//! Steward Dispatch - task ledger, wait/notify coordination, adventure runs

pub mod coordinator;
pub mod ledger;
pub mod longpoll;
pub mod runner;

pub use coordinator::{DispatchCoordinator, WaitOutcome, Waiter};
pub use ledger::{Task, TaskLedger};
pub use runner::{AdventureRunner, PlanOnlySolver, RunOutcome, SolveOutcome, Solver};
