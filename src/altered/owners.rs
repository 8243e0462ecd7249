use crate::altered::client::{AlteredClient, AlteredError, ensure_success};
use crate::models::Operation;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Failure of a single give call. Network failures and non-2xx answers are
/// treated the same way by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("give failed for {reference}: {status} - {body}")]
    Rejected {
        reference: String,
        status: u16,
        body: String,
    },
    #[error("give failed for {reference}: {message}")]
    Network { reference: String, message: String },
}

impl TransferError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            Self::Network { .. } => None,
        }
    }

    fn from_client(reference: &str, err: AlteredError) -> Self {
        match err {
            AlteredError::Status { status, body } => Self::Rejected {
                reference: reference.to_string(),
                status,
                body,
            },
            other => Self::Network {
                reference: reference.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Single-operation transfer against the remote API.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn give(
        &self,
        recipient_id: &str,
        operation: &Operation,
        token: &str,
    ) -> Result<(), TransferError>;
}

#[derive(Debug, Serialize)]
struct GiveRequest<'a> {
    user: String,
    quantity: u32,
    cards: [GiveCard<'a>; 1],
}

#[derive(Debug, Serialize)]
struct GiveCard<'a> {
    reference: &'a str,
    quantity: u32,
}

impl<'a> GiveRequest<'a> {
    fn new(recipient_id: &str, operation: &'a Operation) -> Self {
        Self {
            user: format!("/users/{recipient_id}"),
            quantity: operation.quantity,
            cards: [GiveCard {
                reference: &operation.identifier,
                quantity: operation.quantity,
            }],
        }
    }
}

#[async_trait]
impl TransferClient for AlteredClient {
    async fn give(
        &self,
        recipient_id: &str,
        operation: &Operation,
        token: &str,
    ) -> Result<(), TransferError> {
        let reference = operation.identifier.as_str();
        let response = self
            .http
            .post(self.api_url("owners/give"))
            .bearer_auth(token)
            .json(&GiveRequest::new(recipient_id, operation))
            .send()
            .await
            .map_err(|err| {
                TransferError::from_client(reference, AlteredError::Request(err.to_string()))
            })?;
        ensure_success(response)
            .await
            .map_err(|err| TransferError::from_client(reference, err))?;
        Ok(())
    }
}
