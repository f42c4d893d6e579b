//! # Graph Model
//!
//! Plain data shared by every layer: identifiers, lifecycle states, property
//! values and events.
//!
//! Design rule: no graph access here. This module is pure data: no
//! `RefCell`, no scheduling, no async.

pub mod id;
pub mod state;
pub mod value;
pub mod event;

pub use id::{BindingId, ClassId, EntityId, LinkId, ObserverId};
pub use state::ManagedState;
pub use value::{PropertyMap, Value};
pub use event::{names, ContainerChange, EventKind, ManagedEvent};
