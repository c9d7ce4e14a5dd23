pub mod engine;
pub mod gateway;
pub mod limits;
pub mod localtime;
pub mod model;
pub mod notify;
pub mod observability;
pub mod sweeper;
pub mod wal;
pub mod wire;
