//! 전송 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 요청/전송 통계 (스레드 간 공유)
#[derive(Debug)]
pub struct TransferStats {
    start_time: Instant,
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
}

/// 통계 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// 처리한 요청 수
    pub requests: u64,
    /// 캐시 히트
    pub hits: u64,
    /// 캐시 미스
    pub misses: u64,
    /// 전송한 청크 수
    pub chunks: u64,
    /// 전송한 바이트
    pub bytes: u64,
    /// 실패한 요청 (채널/전송/타임아웃 포함)
    pub failures: u64,
    /// 그 중 타임아웃
    pub timeouts: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            requests: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// 청크 한 개 전송 기록
    pub fn record_chunk(&self, size: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    /// 실패 기록
    pub fn record_failure(&self, timeout: bool) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    /// 전체 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes.load(Ordering::Relaxed) as f64 / elapsed
    }

    /// 히트율
    pub fn hit_rate(&self) -> f64 {
        let s = self.snapshot();
        let resolved = s.hits + s.misses;
        if resolved == 0 {
            return 0.0;
        }
        s.hits as f64 / resolved as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Elapsed: {:.2}s | Requests: {} | Hits: {} | Misses: {} | Chunks: {} | Bytes: {} | Throughput: {:.2} MB/s | Failures: {} (timeouts {})",
            self.elapsed().as_secs_f64(),
            s.requests,
            s.hits,
            s.misses,
            s.chunks,
            s.bytes,
            self.throughput() / 1_000_000.0,
            s.failures,
            s.timeouts,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = TransferStats::new();
        stats.record_request();
        stats.record_request();
        stats.record_hit();
        stats.record_miss();
        stats.record_chunk(1024);
        stats.record_chunk(452);
        stats.record_failure(true);

        let s = stats.snapshot();
        assert_eq!(s.requests, 2);
        assert_eq!(s.chunks, 2);
        assert_eq!(s.bytes, 1476);
        assert_eq!(s.failures, 1);
        assert_eq!(s.timeouts, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
        assert!(stats.summary().contains("Hits: 1"));
    }
}
