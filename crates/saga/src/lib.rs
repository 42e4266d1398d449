//! Saga orchestration for the game service fleet.
//!
//! A saga is an ordered list of steps, each a command sent to one service.
//! The engine dispatches one step at a time and waits for the service's
//! status event before moving on. If a step fails, completed steps are
//! undone in reverse order with their inverse commands.
//!
//! - [`action`] holds the catalogue of step kinds and their inverses.
//! - [`model`] holds the saga state machine.
//! - [`engine`] persists transitions and publishes their messages.
//! - [`router`] and [`handlers`] connect the engine to the bus.
//! - [`scheduler`] re-dispatches or fails steps that time out.

pub mod action;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod model;
pub mod repository;
pub mod router;
pub mod scheduler;
pub mod state;
pub mod testing;

pub use action::{Action, ActionClass, Inverse, STATUS_ERROR, StepPolicy};
pub use engine::{CreateOutcome, EngineConfig, SagaEngine, StepOutcome};
pub use error::{Result, SagaError};
pub use events::{SagaStatusEvent, stage_create};
pub use handlers::{SagaCommandHandler, StatusEventHandler, spawn_consumers};
pub use model::{Effect, Saga, SagaBuilder, SagaDefinition, Step, StepDefinition, saga_type};
pub use repository::SagaRepository;
pub use router::{CorrelationRouter, Routed};
pub use scheduler::Scheduler;
pub use state::{SagaStatus, StepStatus};
