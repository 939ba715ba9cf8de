//! Berth runner
//!
//! The step executor and the external seams it drives: the service
//! controller (Docker Compose) and the deploy notifier (one HTTP POST).

pub mod error;
pub mod executor;
pub mod fakes;
pub mod interrupt;
pub mod lock;
pub mod notify;
pub mod service;

pub use error::{NotifyError, ServiceControlError, StepError, StepFailure};
pub use executor::{Executor, RunConfig, DEPLOY_VERSION_VAR, TARGET_HOST_VAR};
pub use interrupt::Interrupt;
pub use lock::RunLock;
pub use notify::{NotifyOutcome, NotifyPayload, Notifier};
pub use service::{ComposeConfig, ComposeController, ServiceController, ServiceDescriptor};
