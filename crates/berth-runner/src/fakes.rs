//! Recording fakes for the controller seam (testing only).

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::ServiceControlError;
use crate::service::{ServiceController, ServiceDescriptor};

/// Records every restart request; optionally fails each one.
#[derive(Debug, Default)]
pub struct RecordingServiceController {
    calls: Mutex<Vec<ServiceDescriptor>>,
    failure: Option<String>,
}

impl RecordingServiceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller whose every restart fails with `stderr`.
    pub fn failing(stderr: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failure: Some(stderr.into()),
        }
    }

    pub fn calls(&self) -> Vec<ServiceDescriptor> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ServiceController for RecordingServiceController {
    async fn restart(&self, service: &ServiceDescriptor) -> Result<(), ServiceControlError> {
        self.calls.lock().unwrap().push(service.clone());
        match &self.failure {
            Some(stderr) => Err(ServiceControlError::CommandFailed {
                command: format!("restart {}", service.name),
                code: Some(1),
                stderr: stderr.clone(),
            }),
            None => Ok(()),
        }
    }
}
