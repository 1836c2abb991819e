//! Error types for flex-collector
//!
//! Every failure in the collection core is scoped to the smallest unit that
//! caused it: a fetch error fails one fetched unit, a stage error fails the
//! API that declared it, a compute error drops one attribute.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// 파이프라인 스테이지 컴파일 에러
#[derive(Error, Debug)]
pub enum StageError {
    /// 정규식 패턴 컴파일 실패
    #[error("Invalid regex pattern '{pattern}' in {directive}: {source}")]
    InvalidPattern {
        directive: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Math 표현식 파싱 실패
    #[error("Invalid math expression '{name}' = '{expression}': {reason}")]
    InvalidExpression {
        name: String,
        expression: String,
        reason: String,
    },

    /// 잘못된 지시자 설정
    #[error("Invalid directive {directive}: {reason}")]
    InvalidDirective {
        directive: &'static str,
        reason: String,
    },
}

impl StageError {
    /// Build an `InvalidPattern` error for the given directive
    pub fn pattern(directive: &'static str, pattern: &str, source: regex::Error) -> Self {
        StageError::InvalidPattern {
            directive,
            pattern: pattern.to_string(),
            source,
        }
    }
}

/// 단일 속성 계산 에러
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ComputeError {
    /// 참조한 속성이 샘플에 없음
    #[error("Attribute '{0}' not found in sample")]
    UnknownAttribute(String),

    /// 숫자로 변환할 수 없는 값
    #[error("Attribute '{0}' is not numeric")]
    NonNumeric(String),

    /// 0으로 나눔
    #[error("Division by zero")]
    DivisionByZero,

    /// 결과가 유한한 수가 아님
    #[error("Expression produced a non-finite result")]
    NonFinite,

    /// 표현식 평가 실패 (숫자가 아닌 결과 등)
    #[error("Expression evaluation failed: {0}")]
    Evaluation(String),

    /// 값 파서 정규식 불일치
    #[error("Value of '{0}' did not match the value parser")]
    NoMatch(String),
}

/// 소스 수집(fetch) 에러
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP 클라이언트 초기화 실패
    #[error("Failed to initialize HTTP client: {0}")]
    HttpClientInit(#[source] reqwest::Error),

    /// HTTP 요청 실패
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[source] reqwest::Error),

    /// HTTP 응답 읽기 실패
    #[error("Failed to read HTTP response: {0}")]
    HttpResponse(#[source] reqwest::Error),

    /// HTTP 상태 코드 에러
    #[error("HTTP error status: {0}")]
    HttpStatus(u16),

    /// 잘못된 URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// JSON 파싱 에러
    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// Jolokia 에러 응답
    #[error("Jolokia error (status {status}): {message}")]
    Jolokia { status: u16, message: String },

    /// 타임아웃
    /// The value is the configured timeout in milliseconds, if known.
    #[error("Request timed out{}", .0.map(|ms| format!(" after {}ms", ms)).unwrap_or_default())]
    Timeout(Option<u64>),

    /// 연결 실패
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// 파일 또는 프로세스 I/O 실패
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 명령 실행 실패 (0이 아닌 종료 코드)
    #[error("Command '{command}' exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    /// dial 검사 실패
    #[error("Dial check to {address} failed: {reason}")]
    Dial { address: String, reason: String },

    /// 캐시(datastore)에 해당 항목 없음
    #[error("No cached data for '{0}'")]
    MissingCache(String),

    /// 지원되지 않는 소스
    #[error("Unsupported source: {0}")]
    Unsupported(String),

    /// 수집 작업이 panic 또는 취소로 끝남
    #[error("Collection task failed: {0}")]
    TaskFailed(String),

    /// 소스 선택자가 설정되지 않음
    #[error("API '{0}' has no source selector")]
    NoSource(String),
}

impl FetchError {
    /// 재시도 가능한 에러인지 확인
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::HttpRequest(_)
                | FetchError::HttpResponse(_)
                | FetchError::Timeout(..)
                | FetchError::ConnectionFailed(_)
                | FetchError::HttpStatus(500..=599)
        )
    }

    /// HTTP 상태 코드 추출
    pub fn http_status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus(code) => Some(*code),
            FetchError::Jolokia { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Create a Timeout error with known duration
    pub fn timeout_with_duration(ms: u64) -> Self {
        FetchError::Timeout(Some(ms))
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not expose the configured timeout duration
            FetchError::Timeout(None)
        } else if err.is_connect() {
            FetchError::ConnectionFailed(err.to_string())
        } else if err.is_request() {
            FetchError::HttpRequest(err)
        } else {
            FetchError::HttpResponse(err)
        }
    }
}

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Fetch error
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Pipeline compile error
    #[error("Stage error: {0}")]
    Stage(#[from] StageError),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, public_message, log_message) = match self {
            AppError::Config(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error",
                e.to_string(),
            ),
            AppError::Fetch(e) => (StatusCode::BAD_GATEWAY, "Upstream error", e.to_string()),
            AppError::Stage(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Stage error",
                e.to_string(),
            ),
            AppError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error", e),
        };

        tracing::error!(status = %status, error = %log_message, "Request failed");

        (status, public_message).into_response()
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;
