//! 에러 타입 정의

use thiserror::Error;

/// termxfer 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 디코드 에러: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("프레이밍 에러: {0}")]
    Framing(String),

    #[error("CRC 불일치: expected {expected:02X?}, computed {computed:02X?}")]
    Integrity { expected: Vec<u8>, computed: Vec<u8> },

    #[error("프로토콜 위반: {0}")]
    ProtocolViolation(String),

    #[error("사용자 취소")]
    UserCancelled,

    #[error("크기 제한 초과: {name} ({size} bytes > {limit} bytes)")]
    LimitExceeded { name: String, size: u64, limit: u64 },

    #[error("유효하지 않은 값: {0}")]
    Validation(String),

    #[error("상대방이 세션을 중단함")]
    PeerAborted,

    #[error("원격 에러: {0}")]
    Remote(String),

    #[error("이미 전송 중")]
    Busy,

    #[error("활성 세션 없음")]
    NoSession,

    #[error("연결 종료")]
    ConnectionClosed,
}

impl Error {
    /// 세션을 중단시켜야 하는 에러인지
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::ProtocolViolation(_))
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
