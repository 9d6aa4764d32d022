//! fleetd library - exposes modules for testing.

pub mod assets;
pub mod boot;
pub mod cmdline;
pub mod config;
pub mod devicemgr;
pub mod error;
pub mod gadget;
pub mod handlers;
pub mod hooks;
pub mod keys;
pub mod registration;
pub mod remodel;
pub mod reseal;
pub mod runner;
pub mod service;
pub mod store;
pub mod systems;

pub use devicemgr::{Backends, DeviceManager};
pub use runner::TaskRunner;
