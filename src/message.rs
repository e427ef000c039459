//! 요청 메시지 정의
//!
//! 프록시 → 캐시 방향의 유일한 메시지. 응답은 세그먼트로 전달되므로
//! 채널에는 요청만 흐른다.

use serde::{Deserialize, Serialize};

use crate::{Error, Result, MAX_PATH_LEN, MAX_SEGMENT_ID_LEN};

/// 인코딩된 요청의 최대 크기 (수신 버퍼 크기)
pub const MAX_REQUEST_SIZE: usize = 1152;

/// 캐시 조회 요청
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRequest {
    /// 요청 경로
    pub path: String,

    /// 응답을 기록할 세그먼트 ID
    pub segment_id: String,

    /// 세그먼트 페이로드 크기
    pub segment_size: u64,

    /// 요청자 프로세스 ID
    pub requester_id: u32,

    /// 세그먼트 임대 순번 (만료 요청 식별)
    pub lease_seq: u64,
}

impl CacheRequest {
    /// 새 요청 생성 (길이 검증 포함)
    pub fn new(
        path: impl Into<String>,
        segment_id: impl Into<String>,
        segment_size: usize,
        lease_seq: u64,
    ) -> Result<Self> {
        let request = Self {
            path: path.into(),
            segment_id: segment_id.into(),
            segment_size: segment_size as u64,
            requester_id: std::process::id(),
            lease_seq,
        };
        request.validate()?;
        Ok(request)
    }

    /// 문자열 길이 한도 검증
    pub fn validate(&self) -> Result<()> {
        if self.path.len() >= MAX_PATH_LEN {
            return Err(Error::PathTooLong {
                len: self.path.len(),
                max: MAX_PATH_LEN - 1,
            });
        }
        if self.segment_id.len() >= MAX_SEGMENT_ID_LEN {
            return Err(Error::SegmentIdTooLong {
                len: self.segment_id.len(),
                max: MAX_SEGMENT_ID_LEN - 1,
            });
        }
        Ok(())
    }

    /// 바이트로 직렬화
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_REQUEST_SIZE {
            return Err(Error::MessageTooLarge {
                size: bytes.len(),
                max: MAX_REQUEST_SIZE,
            });
        }
        Ok(bytes)
    }

    /// 바이트에서 역직렬화
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_REQUEST_SIZE {
            return Err(Error::MessageTooLarge {
                size: bytes.len(),
                max: MAX_REQUEST_SIZE,
            });
        }
        let request: Self = bincode::deserialize(bytes)?;
        request.validate()?;
        Ok(request)
    }
}
