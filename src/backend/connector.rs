//! Turning a descriptor into a started backend.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::connection::{BackendConnection, ConnectionSettings};
use super::env::{EnvironmentBuilder, ProcessEnvironment};
use super::errors::BackendError;
use super::handle::BackendHandle;
use crate::config::BackendDescriptor;

/// Constructs and starts backends for the aggregator.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        descriptor: &BackendDescriptor,
    ) -> Result<BackendHandle, BackendError>;
}

/// Default connector: a real `BackendConnection` per descriptor.
pub struct ProcessConnector {
    env: Arc<dyn EnvironmentBuilder>,
    project: Option<String>,
    settings: ConnectionSettings,
}

impl ProcessConnector {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            env: Arc::new(ProcessEnvironment::new()),
            project: None,
            settings,
        }
    }

    pub fn with_environment(mut self, env: Arc<dyn EnvironmentBuilder>) -> Self {
        self.env = env;
        self
    }

    pub fn with_project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }
}

impl Default for ProcessConnector {
    fn default() -> Self {
        Self::new(ConnectionSettings::default())
    }
}

#[async_trait]
impl Connector for ProcessConnector {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        descriptor: &BackendDescriptor,
    ) -> Result<BackendHandle, BackendError> {
        let connection = Arc::new(BackendConnection::new(
            descriptor.clone(),
            self.env.clone(),
            self.project.clone(),
            self.settings,
        ));
        connection.start(cancel).await?;
        Ok(BackendHandle::from_connection(connection).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_propagates_start_failure() {
        let connector = ProcessConnector::default().with_project(Some("demo".into()));
        let descriptor = BackendDescriptor::stdio("ghost", "/nonexistent/assern-server", &[]);

        let err = connector
            .connect(&CancellationToken::new(), &descriptor)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::SpawnFailed { ref name, .. } if name == "ghost"));
    }
}
