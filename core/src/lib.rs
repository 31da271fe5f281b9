pub mod config;
pub mod phy;
pub mod scsi;
pub mod tickable;
pub mod types;
