pub mod connection;
pub mod constants;
pub mod supervisor;
pub mod types;

pub use connection::{ConnectionSession, Established};
pub use supervisor::ConnectionSupervisor;
pub use types::{CycleOutcome, ReportBinding, SessionState};
