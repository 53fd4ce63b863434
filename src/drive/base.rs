//! Shared provider plumbing
//!
//! The binding-step tables drive the interactive config flow; the
//! credential helpers normalize what users paste into chat.

use crate::models::DriveType;

/// One prompt in the drive binding conversation.
#[derive(Debug, Clone, Copy)]
pub struct BindingStep {
    /// Key the answer is stored under in the session's temp data
    pub key: &'static str,
    pub prompt: &'static str,
    /// Secret answers are deleted from chat after capture
    pub secret: bool,
}

const WEBDAV_STEPS: &[BindingStep] = &[
    BindingStep {
        key: "url",
        prompt: "Enter the WebDAV server URL (https://...)",
        secret: false,
    },
    BindingStep {
        key: "username",
        prompt: "Enter the WebDAV username",
        secret: false,
    },
    BindingStep {
        key: "password",
        prompt: "Enter the WebDAV password",
        secret: true,
    },
];

const S3_STEPS: &[BindingStep] = &[
    BindingStep {
        key: "endpoint",
        prompt: "Enter the S3 endpoint URL",
        secret: false,
    },
    BindingStep {
        key: "bucket",
        prompt: "Enter the bucket name",
        secret: false,
    },
    BindingStep {
        key: "access_key_id",
        prompt: "Enter the access key id",
        secret: false,
    },
    BindingStep {
        key: "secret_access_key",
        prompt: "Enter the secret access key",
        secret: true,
    },
];

const SFTP_STEPS: &[BindingStep] = &[
    BindingStep {
        key: "host",
        prompt: "Enter the SFTP host (host or host:port)",
        secret: false,
    },
    BindingStep {
        key: "username",
        prompt: "Enter the SFTP username",
        secret: false,
    },
    BindingStep {
        key: "password",
        prompt: "Enter the SFTP password",
        secret: true,
    },
];

/// Binding conversation for a drive type, in prompt order.
pub fn binding_steps(drive_type: DriveType) -> &'static [BindingStep] {
    match drive_type {
        DriveType::WebDav => WEBDAV_STEPS,
        DriveType::S3 => S3_STEPS,
        DriveType::Sftp => SFTP_STEPS,
    }
}

/// Normalize a pasted password: trim whitespace and strip one layer of
/// surrounding quotes (chat clients add them when copying).
pub fn process_password(raw: &str) -> String {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| {
            trimmed
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
        })
        .unwrap_or(trimmed);
    stripped.to_string()
}

/// Percent-escape credentials for embedding in a connection string
/// userinfo segment.
pub fn escape_connection_string(component: &str) -> String {
    urlencoding::encode(component).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_has_steps_ending_in_a_secret() {
        for drive_type in DriveType::all() {
            let steps = binding_steps(*drive_type);
            assert!(!steps.is_empty());
            assert!(
                steps.iter().any(|s| s.secret),
                "{drive_type:?} must capture a secret"
            );
        }
    }

    #[test]
    fn password_normalization() {
        assert_eq!(process_password("  hunter2  "), "hunter2");
        assert_eq!(process_password("\"hunter2\""), "hunter2");
        assert_eq!(process_password("'hunter2'"), "hunter2");
        assert_eq!(process_password("\"hun'ter2\""), "hun'ter2");
        assert_eq!(process_password("plain"), "plain");
    }

    #[test]
    fn connection_string_escaping() {
        assert_eq!(escape_connection_string("p@ss:word"), "p%40ss%3Aword");
        assert_eq!(escape_connection_string("simple"), "simple");
    }
}
