//! Cloud drive provider seam
//!
//! Concrete vendors live outside the core; each one implements
//! `DriveProvider` and registers a builder in the factory keyed by the
//! drive's tagged type. The pipeline only ever sees the trait: the
//! sec-transfer probe calls `get_remote_file_info`, the upload stage calls
//! `upload_file`, and the file browser uses `list_remote_files`.

pub mod base;

pub use base::{binding_steps, escape_connection_string, process_password, BindingStep};

use crate::limits::RetryableError;
use crate::models::{Drive, DriveType, Task};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Drive layer errors.
#[derive(Error, Debug)]
pub enum DriveError {
    /// Config rejected by the provider
    #[error("drive validation failed: {0}")]
    Validation(String),

    /// Remote unreachable or returned a transient failure
    #[error("drive remote error: {0}")]
    Remote(String),

    /// The provider refused the upload (quota, policy, naming)
    #[error("upload refused: {0}")]
    Refused(String),

    #[error("drive io error: {0}")]
    Io(String),

    #[error("no drive bound for user {0}")]
    NotBound(i64),
}

impl RetryableError for DriveError {
    fn is_retryable(&self) -> bool {
        matches!(self, DriveError::Remote(_))
    }
}

/// Result of a sec-transfer probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub name: String,
    pub size: u64,
}

/// One entry in a remote listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub size: Option<u64>,
    pub is_dir: bool,
}

/// A bound, ready-to-use drive backend.
#[async_trait]
pub trait DriveProvider: Send + Sync {
    fn drive_type(&self) -> DriveType;

    /// Check the credentials blob against the live backend.
    async fn validate_config(&self) -> Result<(), DriveError>;

    /// Probe for an already-uploaded file; `Ok(None)` when absent.
    async fn get_remote_file_info(
        &self,
        file_name: &str,
        user_id: i64,
    ) -> Result<Option<RemoteFileInfo>, DriveError>;

    /// Stream the task's local file to the drive.
    async fn upload_file(&self, task: &Task, local_path: &Path) -> Result<(), DriveError>;

    async fn list_remote_files(
        &self,
        user_id: i64,
        path: &str,
    ) -> Result<Vec<RemoteEntry>, DriveError>;
}

impl std::fmt::Debug for dyn DriveProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DriveProvider({:?})", self.drive_type())
    }
}

/// Builds a provider from a drive row.
pub trait ProviderBuilder: Send + Sync {
    fn build(&self, drive: &Drive, remote_folder: &str) -> Result<Arc<dyn DriveProvider>, DriveError>;
}

impl<F> ProviderBuilder for F
where
    F: Fn(&Drive, &str) -> Result<Arc<dyn DriveProvider>, DriveError> + Send + Sync,
{
    fn build(&self, drive: &Drive, remote_folder: &str) -> Result<Arc<dyn DriveProvider>, DriveError> {
        self(drive, remote_folder)
    }
}

/// Factory keyed by drive type. The composition root registers vendors;
/// tests register fakes.
#[derive(Default)]
pub struct DriveProviderFactory {
    builders: HashMap<DriveType, Arc<dyn ProviderBuilder>>,
    remote_folder: String,
}

impl DriveProviderFactory {
    pub fn new(remote_folder: impl Into<String>) -> Self {
        Self {
            builders: HashMap::new(),
            remote_folder: remote_folder.into(),
        }
    }

    pub fn register(&mut self, drive_type: DriveType, builder: Arc<dyn ProviderBuilder>) {
        self.builders.insert(drive_type, builder);
    }

    pub fn supported_types(&self) -> Vec<DriveType> {
        let mut types: Vec<DriveType> = self.builders.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn create(&self, drive: &Drive) -> Result<Arc<dyn DriveProvider>, DriveError> {
        let builder = self.builders.get(&drive.drive_type).ok_or_else(|| {
            DriveError::Validation(format!(
                "unsupported drive type: {}",
                drive.drive_type.as_str()
            ))
        })?;
        builder.build(drive, &self.remote_folder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct NullProvider;

    #[async_trait]
    impl DriveProvider for NullProvider {
        fn drive_type(&self) -> DriveType {
            DriveType::WebDav
        }

        async fn validate_config(&self) -> Result<(), DriveError> {
            Ok(())
        }

        async fn get_remote_file_info(
            &self,
            _file_name: &str,
            _user_id: i64,
        ) -> Result<Option<RemoteFileInfo>, DriveError> {
            Ok(None)
        }

        async fn upload_file(&self, _task: &Task, _local_path: &Path) -> Result<(), DriveError> {
            Ok(())
        }

        async fn list_remote_files(
            &self,
            _user_id: i64,
            _path: &str,
        ) -> Result<Vec<RemoteEntry>, DriveError> {
            Ok(Vec::new())
        }
    }

    fn sample_drive(drive_type: DriveType) -> Drive {
        Drive {
            id: "d-1".into(),
            user_id: 7,
            name: "dav".into(),
            drive_type,
            credentials: json!({}),
            is_default: true,
        }
    }

    #[test]
    fn factory_dispatches_by_type() {
        let mut factory = DriveProviderFactory::new("/media");
        factory.register(
            DriveType::WebDav,
            Arc::new(|_: &Drive, _: &str| {
                Ok(Arc::new(NullProvider) as Arc<dyn DriveProvider>)
            }),
        );

        assert!(factory.create(&sample_drive(DriveType::WebDav)).is_ok());
        let err = factory.create(&sample_drive(DriveType::S3)).unwrap_err();
        assert!(matches!(err, DriveError::Validation(_)));
    }
}
