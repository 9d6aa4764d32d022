//! Fleet Shared - types shared by the device control plane.
//!
//! Holds the durable state store, assertion records, device identity
//! and the installed-snap bookkeeping the daemon builds on.

pub mod asserts;
pub mod device;
pub mod error;
pub mod restart;
pub mod snap;
pub mod state;
pub mod systems;

pub use asserts::{Assertion, AssertionDb, Model, ModelGrade, Serial, StoreAssertion};
pub use device::DeviceState;
pub use error::{AssertsError, SnapError, StateError};
pub use restart::RestartType;
pub use state::{Change, ChangeId, State, StateData, StateGuard, Status, Task, TaskId, Unlocker};

/// Protocol version shared by daemon components
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
