use ethics_review_core::ReviewError;

/// Failure of a lifecycle operation.
///
/// `Review` carries a definitive rejection the caller can act on (lookup miss,
/// precondition, lost race). `Store` is anything the database raised.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error(transparent)]
    Store(anyhow::Error),
}

impl ServiceError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Review(ReviewError::NotFound { .. }))
    }

    #[must_use]
    pub fn is_illegal_argument(&self) -> bool {
        matches!(self, Self::Review(ReviewError::IllegalArgument(_)))
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Review(ReviewError::Conflict(_)))
    }
}

// The store raises domain rejections (active-version conflicts, bad paging)
// inside `anyhow`; lift them back out so callers can match on them.
impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ReviewError>() {
            Ok(review) => Self::Review(review),
            Err(err) => Self::Store(err),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
