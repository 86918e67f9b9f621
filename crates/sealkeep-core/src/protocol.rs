//! Control channel message types
//!
//! One JSON object per line in each direction. A connection may carry any
//! number of request/response pairs; responses come back in request order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ErrorKind};
use crate::model::{GenerationOutcome, KeypairId, Keypair, Organization};

/// Request sent by a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Status,
    Login {
        email: String,
        password: String,
    },
    Logout,
    Lock,
    ListKeypairs {
        org: String,
    },
    GenerateKeypairs {
        #[serde(default)]
        org: Option<String>,
        #[serde(default)]
        all: bool,
    },
    RevokeKeypair {
        keypair_id: KeypairId,
    },
    Seal {
        org: String,
        path: String,
        /// Secret bytes, base64
        secret: String,
    },
    Open {
        org: String,
        path: String,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Login { .. } => "login",
            Self::Logout => "logout",
            Self::Lock => "lock",
            Self::ListKeypairs { .. } => "list_keypairs",
            Self::GenerateKeypairs { .. } => "generate_keypairs",
            Self::RevokeKeypair { .. } => "revoke_keypair",
            Self::Seal { .. } => "seal",
            Self::Open { .. } => "open",
        }
    }
}

/// Daemon response: a result payload or a structured error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn error(error: WireError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    /// Split into the payload or the error
    pub fn into_result(self) -> Result<Value, WireError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Error as carried over the channel: stable kind plus a non-leaking message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    /// Per-organization detail for partial failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<PartialReport>,
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WireError {}

impl From<&Error> for WireError {
    fn from(err: &Error) -> Self {
        let partial = match err {
            Error::PartialFailure(partial) => Some(PartialReport {
                succeeded: partial
                    .succeeded
                    .iter()
                    .map(|(org, outcome)| OrgOutcome {
                        org: org.clone(),
                        outcome: outcome.clone(),
                    })
                    .collect(),
                failed: partial
                    .failed
                    .iter()
                    .map(|(org, err)| OrgError {
                        org: org.clone(),
                        kind: err.kind(),
                        message: err.public_message(),
                    })
                    .collect(),
            }),
            _ => None,
        };

        Self {
            kind: err.kind(),
            message: err.public_message(),
            partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialReport {
    pub succeeded: Vec<OrgOutcome>,
    pub failed: Vec<OrgError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgOutcome {
    pub org: Organization,
    pub outcome: GenerationOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgError {
    pub org: Organization,
    pub kind: ErrorKind,
    pub message: String,
}

/// Session state as reported by `status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: String,
    #[serde(default)]
    pub email: Option<String>,
    pub version: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeypairList {
    pub org: Organization,
    pub keypairs: Vec<Keypair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateReport {
    pub results: Vec<OrgOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealReport {
    pub path: String,
    pub recipients: usize,
    pub signer: KeypairId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenReport {
    pub path: String,
    /// Plaintext, base64
    pub secret: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PartialFailure;
    use crate::model::{KeyType, OrgId};

    #[test]
    fn test_request_wire_format() {
        let req: Request =
            serde_json::from_str(r#"{"type":"generate_keypairs","all":true}"#).unwrap();
        assert!(matches!(
            req,
            Request::GenerateKeypairs { org: None, all: true }
        ));

        let json = serde_json::to_value(Request::ListKeypairs {
            org: "acme".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "list_keypairs");
        assert_eq!(json["org"], "acme");
    }

    #[test]
    fn test_error_response() {
        let resp = Response::error(WireError::from(&Error::NotAuthenticated));
        let line = serde_json::to_string(&resp).unwrap();
        assert!(!line.contains("result"));

        let back: Response = serde_json::from_str(&line).unwrap();
        let err = back.into_result().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotAuthenticated);
    }

    #[test]
    fn test_partial_failure_keeps_both_sides() {
        let ok = Organization {
            id: OrgId::new(),
            name: "a".to_string(),
        };
        let bad = Organization {
            id: OrgId::new(),
            name: "b".to_string(),
        };
        let err = Error::PartialFailure(PartialFailure {
            succeeded: vec![(
                ok.clone(),
                GenerationOutcome::Generated {
                    key_types: vec![KeyType::Signing, KeyType::Encryption],
                },
            )],
            failed: vec![(bad.clone(), Error::Transient("timeout to 10.1.1.1".to_string()))],
        });

        let wire = WireError::from(&err);
        let partial = wire.partial.unwrap();
        assert_eq!(partial.succeeded[0].org, ok);
        assert_eq!(partial.failed[0].org, bad);
        assert_eq!(partial.failed[0].kind, ErrorKind::Transient);
        assert!(!partial.failed[0].message.contains("10.1.1.1"));
    }
}
