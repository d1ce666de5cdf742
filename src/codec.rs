//! Wire messages for the `image_prediction.ImagePrediction/Predict` stream.
//!
//! The messages are declared directly with `prost` derives; the tonic client
//! and server stubs are generated by `build.rs`. Field tags match the
//! legacy two-field schema, so clients that predate the `error` field keep
//! decoding responses.

use crate::error::{ErrorKind, InferenceError};
use bytes::Bytes;

#[allow(clippy::all)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/image_prediction.ImagePrediction.rs"));
}

pub use generated::image_prediction_client::ImagePredictionClient;
pub use generated::image_prediction_server::{ImagePrediction, ImagePredictionServer};

/// One image to embed, tagged with a client-assigned id.
#[derive(Clone, PartialEq, prost::Message)]
pub struct PredictionRequest {
    #[prost(bytes = "bytes", tag = "1")]
    pub image: Bytes,
    #[prost(string, tag = "2")]
    pub model: String,
    #[prost(int64, tag = "3")]
    pub id: i64,
}

/// Embedding (or per-request error) for the request with the same id.
#[derive(Clone, PartialEq, prost::Message)]
pub struct VectorResponse {
    #[prost(float, repeated, tag = "1")]
    pub vector: Vec<f32>,
    #[prost(int64, tag = "2")]
    pub id: i64,
    #[prost(message, optional, tag = "3")]
    pub error: Option<ResponseError>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseError {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unspecified = 0,
    InvalidRequest = 1,
    ModelNotFound = 2,
    ModelUnavailable = 3,
    Overloaded = 4,
    InferenceFailure = 5,
    Cancelled = 6,
}

impl From<ErrorKind> for ErrorCode {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::InvalidRequest => ErrorCode::InvalidRequest,
            ErrorKind::ModelNotFound => ErrorCode::ModelNotFound,
            ErrorKind::ModelUnavailable => ErrorCode::ModelUnavailable,
            ErrorKind::Overloaded => ErrorCode::Overloaded,
            ErrorKind::InferenceFailure => ErrorCode::InferenceFailure,
            ErrorKind::Cancelled => ErrorCode::Cancelled,
        }
    }
}

impl ErrorCode {
    /// Domain kind for this code; `None` for `Unspecified`.
    pub fn kind(self) -> Option<ErrorKind> {
        match self {
            ErrorCode::Unspecified => None,
            ErrorCode::InvalidRequest => Some(ErrorKind::InvalidRequest),
            ErrorCode::ModelNotFound => Some(ErrorKind::ModelNotFound),
            ErrorCode::ModelUnavailable => Some(ErrorKind::ModelUnavailable),
            ErrorCode::Overloaded => Some(ErrorKind::Overloaded),
            ErrorCode::InferenceFailure => Some(ErrorKind::InferenceFailure),
            ErrorCode::Cancelled => Some(ErrorKind::Cancelled),
        }
    }
}

impl PredictionRequest {
    pub fn new(id: i64, model: impl Into<String>, image: impl Into<Bytes>) -> Self {
        Self {
            image: image.into(),
            model: model.into(),
            id,
        }
    }

    /// Checks the fields every request must carry before it is dispatched.
    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.model.is_empty() {
            return Err(InferenceError::invalid_request("model name is empty"));
        }
        if self.image.is_empty() {
            return Err(InferenceError::invalid_request("image is empty"));
        }
        Ok(())
    }
}

impl VectorResponse {
    pub fn success(id: i64, vector: Vec<f32>) -> Self {
        Self {
            vector,
            id,
            error: None,
        }
    }

    pub fn failure(id: i64, err: &InferenceError) -> Self {
        Self {
            vector: Vec::new(),
            id,
            error: Some(ResponseError {
                code: ErrorCode::from(err.kind) as i32,
                message: err.message.clone(),
            }),
        }
    }

    /// Builds the response for a finished task.
    pub fn from_result(id: i64, result: &Result<Vec<f32>, InferenceError>) -> Self {
        match result {
            Ok(vector) => Self::success(id, vector.clone()),
            Err(err) => Self::failure(id, err),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Error kind carried by this response, if it is an error response.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().and_then(|e| e.code().kind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_validate_rejects_empty_fields() {
        let err = PredictionRequest::new(1, "", vec![1u8]).validate().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        let err = PredictionRequest::new(2, "m", Vec::<u8>::new())
            .validate()
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);

        assert!(PredictionRequest::new(3, "m", vec![0u8, 1, 2]).validate().is_ok());
    }

    #[test]
    fn test_failure_response_carries_kind() {
        let resp = VectorResponse::failure(7, &InferenceError::model_not_found("x"));
        assert_eq!(resp.id, 7);
        assert!(resp.vector.is_empty());
        assert_eq!(resp.error_kind(), Some(ErrorKind::ModelNotFound));
    }

    #[test]
    fn test_legacy_response_decodes_as_success() {
        // Only tags 1 and 2 set, as a legacy two-field encoder would produce
        let legacy = VectorResponse::success(9, vec![0.5]).encode_to_vec();
        let decoded = VectorResponse::decode(legacy.as_slice()).unwrap();
        assert_eq!(decoded.id, 9);
        assert_eq!(decoded.vector, vec![0.5]);
        assert!(!decoded.is_error());
    }

    #[test]
    fn test_unknown_code_has_no_kind() {
        let resp = VectorResponse {
            vector: vec![],
            id: 1,
            error: Some(ResponseError {
                code: 42,
                message: String::new(),
            }),
        };
        assert!(resp.is_error());
        assert_eq!(resp.error_kind(), None);
    }
}
