//! Locations and their update orchestration.

pub mod context;
pub mod cycle;
pub mod effects;
pub mod events;
pub mod model;
pub mod strategies;
mod updater;

#[cfg(test)]
mod tests;

pub use cycle::{LocationCycle, ParticipantContext, Rescheduler};
pub use effects::{EffectSink, EventPersister, SaveHandler};
pub use events::{LocationEvent, LocationUpdate};
pub use model::{Location, LocationMessage, LocationSnapshot, LocationState, PauseReason, PauseUpdate};
pub use strategies::LocationCore;
pub use updater::{location_lock_key, LocationUpdater, UpdateOptions};
