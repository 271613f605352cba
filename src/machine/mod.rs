//! Machine model: cluster budgets, device views and legacy parallel configs

pub mod config;
pub mod resource;
pub mod view;

pub use config::ParallelConfig;
pub use resource::MachineResource;
pub use view::{DeviceType, MachineView};
