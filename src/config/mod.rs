pub mod io;
pub mod types;

pub use types::{ActivityConfig, ButtonsConfig, Config, ConnectionConfig, UhidConfig};
