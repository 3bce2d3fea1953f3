//! PipeWire side of the bridge: the two endpoint filter nodes and the main
//! loop that owns them.

mod endpoint;
mod manager;
mod ring;

pub use manager::run;
