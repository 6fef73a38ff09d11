//! BLE session management.
//!
//! The state machine, initializer, event re-subscription, device picker,
//! and the connection manager façade that ties them together.

pub mod events;
pub mod initializer;
pub mod manager;
pub mod picker;
pub mod state_machine;
pub mod uuids;

pub use events::EventManager;
pub use initializer::{DeviceInitializer, InitOutcome};
pub use manager::{ConnectionManager, ManagerOptions, NotificationHandlers};
pub use picker::{DevicePicker, PickerRequest};
pub use state_machine::{
    ConnectionState, ConnectionStateMachine, StateEvent, StateTimeouts, TransitionRecord,
    MAX_CONSECUTIVE_ERRORS,
};
