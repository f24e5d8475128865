pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod io;
pub mod remote;
pub mod storage;

pub use application::{LedgerError, LedgerService, LedgerStore};
pub use domain::*;
pub use remote::{CreditsApi, DynCreditsApi, HttpCreditsApi};
pub use storage::Repository;
