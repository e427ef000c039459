//! 에러 타입 정의

use thiserror::Error;

/// shmcache 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("{op} 실패 ({name}): {source}")]
    Os {
        op: &'static str,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("유효하지 않은 설정: {0}")]
    InvalidConfig(String),

    #[error("경로가 너무 김: {len} bytes (최대 {max})")]
    PathTooLong { len: usize, max: usize },

    #[error("세그먼트 ID가 너무 김: {len} bytes (최대 {max})")]
    SegmentIdTooLong { len: usize, max: usize },

    #[error("메시지 크기 초과: {size} bytes (최대 {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("요청 채널 가득 참")]
    ChannelFull,

    #[error("요청 채널 사용 불가: {0}")]
    ChannelUnavailable(String),

    #[error("세그먼트 풀 닫힘")]
    PoolClosed,

    #[error("세그먼트 획득 타임아웃")]
    AcquireTimeout,

    #[error("반환되지 않은 세그먼트: {count}개")]
    LeasesOutstanding { count: usize },

    #[error("대기 타임아웃: {signal} (segment={segment_id})")]
    WaitTimeout {
        segment_id: String,
        signal: &'static str,
    },

    #[error("유효하지 않은 세그먼트: {segment_id} ({reason})")]
    InvalidSegment { segment_id: String, reason: String },

    #[error("만료된 요청: segment={segment_id}, expected seq={expected}, got {got}")]
    StaleRequest {
        segment_id: String,
        expected: u64,
        got: u64,
    },

    #[error("전송 중단: segment={segment_id}")]
    TransferAborted { segment_id: String },

    #[error("전송 길이 부족: expected {expected}, got {got}")]
    ShortTransfer { expected: u64, got: u64 },

    #[error("CRC 불일치: expected {expected:08X}, got {got:08X}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("응답 전송 실패: {0}")]
    Sink(#[source] std::io::Error),
}

impl Error {
    /// 마지막 OS 에러로 `Error::Os` 생성
    pub(crate) fn last_os(op: &'static str, name: &str) -> Self {
        Error::Os {
            op,
            name: name.to_string(),
            source: std::io::Error::last_os_error(),
        }
    }

    /// 같은 이름의 IPC 객체가 이미 있어 생성에 실패했는지
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Os { source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists
        )
    }

    /// 타임아웃 계열 에러 여부
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::WaitTimeout { .. } | Error::AcquireTimeout)
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
