//! # shmcache
//!
//! 공유 메모리 기반 프록시 ↔ 캐시 파일 전달
//!
//! ## 핵심 특징
//! - **세그먼트 풀**: 프록시가 고정 크기 공유 세그먼트 N개를 소유, 요청마다 하나씩 임대
//! - **요청 채널**: POSIX 메시지 큐로 (경로, 세그먼트 ID, 크기) 전달
//! - **청크 전송**: 세마포어 세 개로 producer/consumer가 교대로 버퍼를 채우고 비움
//! - **타임아웃**: 모든 대기는 제한 시간이 있고, 실패 시 세그먼트를 안전하게 회수
//! - **무결성**: 청크마다 CRC32 검증

pub mod channel;
pub mod config;
pub mod error;
pub mod frontend;
pub mod message;
pub mod pool;
pub mod proxy;
pub mod segment;
pub mod shm;
pub mod stats;
pub mod storage;
pub mod transfer;
pub mod worker;

pub use channel::{local_channel, MessageQueue, MqSender, RequestReceiver, RequestSender};
pub use config::Config;
pub use error::{Error, Result};
pub use message::CacheRequest;
pub use pool::{Lease, SegmentPool};
pub use proxy::{CacheProxy, ResponseHeader, ResponseSink};
pub use segment::{ResultStatus, SegmentId};
pub use stats::TransferStats;
pub use storage::{DirectoryStorage, IndexedStorage, Storage, StoredFile};
pub use worker::CacheWorkerPool;

/// 기본 세그먼트 수
pub const DEFAULT_SEGMENT_COUNT: usize = 8;

/// 기본 세그먼트 크기 (바이트)
pub const DEFAULT_SEGMENT_SIZE: usize = 5712;

/// 최소 세그먼트 크기 (바이트)
pub const MIN_SEGMENT_SIZE: usize = 824;

/// 요청 경로 최대 길이
pub const MAX_PATH_LEN: usize = 1024;

/// 세그먼트 ID 최대 길이 (파생 세마포어 이름 포함)
pub const MAX_SEGMENT_ID_LEN: usize = 64;

/// 캐시 워커 최대 수
pub const MAX_PRODUCER_THREADS: usize = 100;

/// 프록시 워커 최대 수
pub const MAX_CONSUMER_THREADS: usize = 200;

/// 캐시 조회 지연 상한 (마이크로초)
pub const MAX_CACHE_DELAY_US: u64 = 2_500_000;

/// 기본 요청 채널 이름
pub const DEFAULT_CHANNEL_NAME: &str = "/cache_mq";

/// 기본 IPC 이름 접두사
pub const DEFAULT_NAMESPACE: &str = "shmcache";

/// 잘못된 인자/설정 종료 코드
pub const EXIT_CONFIG: i32 = 2;

/// 시작 실패(IPC 자원 생성 등) 종료 코드
pub const EXIT_STARTUP: i32 = 3;

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// 테스트마다 겹치지 않는 IPC 객체 이름 (`/` 시작)
    pub fn unique_name(tag: &str) -> String {
        format!("/{}", unique_namespace(tag))
    }

    /// 테스트마다 겹치지 않는 세그먼트 이름 접두사
    pub fn unique_namespace(tag: &str) -> String {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("t{}_{}_{}", std::process::id(), n, tag)
    }
}
