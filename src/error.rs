use thiserror::Error;

/// 统一的中继错误类型 / Unified relay error type
///
/// Fast-store (cache) failures never surface here: callers degrade to the
/// durable store and log instead. Only durable-store trouble becomes
/// `Internal`.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },

    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    /// 创建认证错误 / Create an authentication error
    pub fn unauthorized<T: Into<String>>(reason: T) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// 创建权限错误 / Create a permission error
    pub fn permission_denied<T: Into<String>>(reason: T) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// 创建验证错误 / Create a validation error
    pub fn validation<T: Into<String>>(reason: T) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// 创建资源未找到错误 / Create a not-found error
    pub fn not_found<T: Into<String>>(resource: T) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }
}
