//! # Provider Error Classification
//!
//! Maps the provider's opaque error surface into a closed set of actionable
//! categories. This table is the single source of truth consulted by both
//! the ensure and delete paths; call sites never match on raw error codes.

use crate::client::ClientError;

/// Actionable categories of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// Operation accepted, not yet complete.
    AsyncOperationIncomplete,
    /// The owning resource group does not exist (yet).
    ResourceGroupNotFound,
    /// A parent resource of the account does not exist (yet).
    ParentNotFound,
    /// The account itself does not exist.
    ResourceNotFound,
    /// Ambiguous not-found code; needs a name-existence check to tell a
    /// missing account from a globally taken name.
    NotFound,
    /// The requested location is not a valid region.
    InvalidResourceLocation,
    /// The region exists but does not offer this resource type.
    LocationNotAvailable,
    /// Everything else.
    Unclassified,
}

impl CloudErrorKind {
    /// Not-found family treated as success on deletion: the account never
    /// existed, was already deleted, or its resource group is gone.
    pub fn is_not_found_family(self) -> bool {
        matches!(
            self,
            Self::NotFound
                | Self::ResourceNotFound
                | Self::ResourceGroupNotFound
                | Self::ParentNotFound
        )
    }
}

/// Classify a client error. Total: every error maps to exactly one category.
pub fn classify(err: &ClientError) -> CloudErrorKind {
    match err {
        ClientError::OperationInProgress => CloudErrorKind::AsyncOperationIncomplete,
        ClientError::Api { code, .. } => match code.as_str() {
            "ResourceGroupNotFound" => CloudErrorKind::ResourceGroupNotFound,
            "ParentResourceNotFound" => CloudErrorKind::ParentNotFound,
            "ResourceNotFound" => CloudErrorKind::ResourceNotFound,
            "NotFound" => CloudErrorKind::NotFound,
            "InvalidResourceLocation" => CloudErrorKind::InvalidResourceLocation,
            "LocationNotAvailableForResourceType" => CloudErrorKind::LocationNotAvailable,
            _ => CloudErrorKind::Unclassified,
        },
        ClientError::Transport(_) | ClientError::UnexpectedResponse(_) => {
            CloudErrorKind::Unclassified
        }
    }
}
