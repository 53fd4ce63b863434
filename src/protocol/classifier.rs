//! Protocol error classifier
//!
//! Pure and table-driven: classification matches message substrings and
//! error codes, produces one of a closed set of kinds, and the queries over
//! kinds (`is_recoverable`, `should_reset_session`, `reconnect_strategy`)
//! are side-effect free so they can be exercised over literal inputs.

use super::transport::ClientError;
use std::time::Duration;

/// Closed set of error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    NotConnected,
    ConnectionLost,
    AuthKeyDuplicated,
    BinaryReader,
    Network,
    RpcError,
    Unknown,
}

/// Classify a client error by code and message substrings.
pub fn classify(err: &ClientError) -> ErrorKind {
    // 406 is the protocol's auth-key-duplicated code.
    if err.code == Some(406) {
        return ErrorKind::AuthKeyDuplicated;
    }

    let message = err.message.to_lowercase();

    if message.contains("auth_key_duplicated") {
        return ErrorKind::AuthKeyDuplicated;
    }
    if message.contains("readuint32le") || message.contains("readint32le") {
        return ErrorKind::BinaryReader;
    }
    if message.contains("etimedout")
        || message.contains("econnreset")
        || message.contains("timed out")
        || message.contains("timeout")
    {
        return ErrorKind::Timeout;
    }
    if message.contains("not connected") || message.contains("disconnected") {
        return ErrorKind::NotConnected;
    }
    if message.contains("connection lost")
        || message.contains("connection closed")
        || message.contains("connection_lost")
    {
        return ErrorKind::ConnectionLost;
    }
    if message.contains("enotfound")
        || message.contains("enetunreach")
        || message.contains("eai_again")
        || message.contains("network")
    {
        return ErrorKind::Network;
    }
    if err.code.is_some() || message.contains("rpc") {
        return ErrorKind::RpcError;
    }

    ErrorKind::Unknown
}

/// Only a duplicated auth key is unrecoverable.
pub fn is_recoverable(kind: ErrorKind) -> bool {
    kind != ErrorKind::AuthKeyDuplicated
}

/// Whether the underlying session should be destroyed before reconnecting.
pub fn should_reset_session(kind: ErrorKind, failure_count: u32) -> bool {
    match kind {
        ErrorKind::BinaryReader | ErrorKind::AuthKeyDuplicated => true,
        ErrorKind::Timeout => failure_count >= 3,
        _ => false,
    }
}

/// Shape of the next reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectType {
    /// Re-dial on the existing session
    Lightweight,
    /// Tear down and rebuild the session first
    Full,
}

/// Plan for the next reconnect attempt.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectStrategy {
    pub reconnect_type: ReconnectType,
    pub delay: Duration,
    pub max_retries: u32,
    pub should_retry: bool,
}

struct StrategyRow {
    reconnect_type: ReconnectType,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    max_retries: u32,
}

fn strategy_row(kind: ErrorKind) -> StrategyRow {
    match kind {
        ErrorKind::Timeout => StrategyRow {
            reconnect_type: ReconnectType::Lightweight,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 10,
        },
        ErrorKind::NotConnected => StrategyRow {
            reconnect_type: ReconnectType::Full,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 8,
        },
        ErrorKind::ConnectionLost => StrategyRow {
            reconnect_type: ReconnectType::Lightweight,
            base_delay: Duration::from_secs(1),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
            max_retries: 10,
        },
        ErrorKind::AuthKeyDuplicated => StrategyRow {
            reconnect_type: ReconnectType::Full,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            max_retries: 0,
        },
        ErrorKind::BinaryReader => StrategyRow {
            reconnect_type: ReconnectType::Full,
            base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(120),
            max_retries: 3,
        },
        ErrorKind::Network => StrategyRow {
            reconnect_type: ReconnectType::Lightweight,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 12,
        },
        ErrorKind::RpcError => StrategyRow {
            reconnect_type: ReconnectType::Lightweight,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        },
        ErrorKind::Unknown => StrategyRow {
            reconnect_type: ReconnectType::Full,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            max_retries: 5,
        },
    }
}

/// `delay = min(base * multiplier^failure_count, max)` over the per-kind
/// table; `should_retry` folds in recoverability and the retry budget.
pub fn reconnect_strategy(kind: ErrorKind, failure_count: u32) -> ReconnectStrategy {
    let row = strategy_row(kind);
    let factor = row.multiplier.powi(failure_count.min(16) as i32);
    let delay = row
        .base_delay
        .mul_f64(factor.max(1.0))
        .min(row.max_delay);

    ReconnectStrategy {
        reconnect_type: row.reconnect_type,
        delay,
        max_retries: row.max_retries,
        should_retry: is_recoverable(kind) && failure_count < row.max_retries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(message: &str) -> ClientError {
        ClientError::new(message)
    }

    #[test]
    fn classification_table() {
        assert_eq!(
            classify(&ClientError::with_code(406, "AUTH_KEY_DUPLICATED")),
            ErrorKind::AuthKeyDuplicated
        );
        assert_eq!(
            classify(&err("AUTH_KEY_DUPLICATED received")),
            ErrorKind::AuthKeyDuplicated
        );
        assert_eq!(
            classify(&err("TypeError: buf.readUInt32LE is not a function")),
            ErrorKind::BinaryReader
        );
        assert_eq!(classify(&err("connect ETIMEDOUT 1.2.3.4:443")), ErrorKind::Timeout);
        assert_eq!(classify(&err("read ECONNRESET")), ErrorKind::Timeout);
        assert_eq!(classify(&err("request timed out")), ErrorKind::Timeout);
        assert_eq!(classify(&err("client not connected")), ErrorKind::NotConnected);
        assert_eq!(classify(&err("connection lost on read")), ErrorKind::ConnectionLost);
        assert_eq!(classify(&err("getaddrinfo ENOTFOUND host")), ErrorKind::Network);
        assert_eq!(
            classify(&ClientError::with_code(420, "FLOOD_WAIT")),
            ErrorKind::RpcError
        );
        assert_eq!(classify(&err("something odd")), ErrorKind::Unknown);
    }

    #[test]
    fn code_406_beats_message_contents() {
        let error = ClientError::with_code(406, "request timed out");
        assert_eq!(classify(&error), ErrorKind::AuthKeyDuplicated);
    }

    #[test]
    fn recoverability() {
        assert!(!is_recoverable(ErrorKind::AuthKeyDuplicated));
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::NotConnected,
            ErrorKind::ConnectionLost,
            ErrorKind::BinaryReader,
            ErrorKind::Network,
            ErrorKind::RpcError,
            ErrorKind::Unknown,
        ] {
            assert!(is_recoverable(kind), "{kind:?} must be recoverable");
        }
    }

    #[test]
    fn session_reset_rules() {
        assert!(should_reset_session(ErrorKind::BinaryReader, 0));
        assert!(should_reset_session(ErrorKind::AuthKeyDuplicated, 0));
        assert!(!should_reset_session(ErrorKind::Timeout, 2));
        assert!(should_reset_session(ErrorKind::Timeout, 3));
        assert!(!should_reset_session(ErrorKind::Network, 10));
    }

    #[test]
    fn strategy_delay_grows_and_caps() {
        let first = reconnect_strategy(ErrorKind::Timeout, 0);
        let third = reconnect_strategy(ErrorKind::Timeout, 2);
        let late = reconnect_strategy(ErrorKind::Timeout, 9);

        assert_eq!(first.delay, Duration::from_secs(1));
        assert_eq!(third.delay, Duration::from_secs(4));
        assert_eq!(late.delay, Duration::from_secs(30));
        assert!(first.should_retry);
        assert!(!reconnect_strategy(ErrorKind::Timeout, 10).should_retry);
    }

    #[test]
    fn auth_key_duplicated_never_retries() {
        let strategy = reconnect_strategy(ErrorKind::AuthKeyDuplicated, 0);
        assert!(!strategy.should_retry);
        assert_eq!(strategy.reconnect_type, ReconnectType::Full);
    }

    #[cfg(test)]
    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // classify is total and pure over arbitrary inputs
            #[test]
            fn classify_is_total(message in ".{0,200}", code in proptest::option::of(0i32..1000)) {
                let error = ClientError { code, message };
                let first = classify(&error);
                let second = classify(&error);
                prop_assert_eq!(first, second);
            }

            #[test]
            fn delay_never_exceeds_cap(failures in 0u32..64) {
                for kind in [
                    ErrorKind::Timeout,
                    ErrorKind::NotConnected,
                    ErrorKind::ConnectionLost,
                    ErrorKind::BinaryReader,
                    ErrorKind::Network,
                    ErrorKind::RpcError,
                    ErrorKind::Unknown,
                ] {
                    let strategy = reconnect_strategy(kind, failures);
                    prop_assert!(strategy.delay <= Duration::from_secs(120));
                }
            }
        }
    }
}
