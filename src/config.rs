//! 프록시/캐시 설정

use std::time::Duration;

use crate::{
    Error, Result, DEFAULT_CHANNEL_NAME, DEFAULT_NAMESPACE, DEFAULT_SEGMENT_COUNT,
    DEFAULT_SEGMENT_SIZE, MAX_CACHE_DELAY_US, MAX_CONSUMER_THREADS, MAX_PRODUCER_THREADS,
    MAX_SEGMENT_ID_LEN, MIN_SEGMENT_SIZE,
};

/// shmcache 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 세그먼트 수 (1 이상)
    pub segment_count: usize,

    /// 세그먼트 페이로드 크기 (바이트)
    pub segment_size: usize,

    /// 캐시 워커 스레드 수 (1 ~ 100)
    pub producer_threads: usize,

    /// 프록시 워커 스레드 수 (1 ~ 200)
    pub consumer_threads: usize,

    /// 조회 지연 (마이크로초, 백프레셔 테스트용)
    pub cache_delay_us: u64,

    /// 프로토콜 신호 대기 타임아웃 (밀리초)
    pub wait_timeout_ms: u64,

    /// 요청 채널 수신 폴링 주기 (밀리초)
    /// 워커가 종료 플래그를 확인하는 간격
    pub receive_poll_ms: u64,

    /// 종료 시 세그먼트 반환 대기 시간 (밀리초)
    pub shutdown_grace_ms: u64,

    /// 요청 채널 이름 (POSIX 메시지 큐)
    pub channel_name: String,

    /// 요청 채널 최대 대기 메시지 수
    pub channel_capacity: usize,

    /// 세그먼트/세마포어 이름 접두사
    pub namespace: String,

    /// 시작 시 같은 이름으로 남은 IPC 객체를 지우고 새로 생성
    /// 꺼져 있으면 이름 충돌 시 시작 실패
    pub reclaim_stale: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_count: DEFAULT_SEGMENT_COUNT,
            segment_size: DEFAULT_SEGMENT_SIZE,
            producer_threads: 8,
            consumer_threads: 8,
            cache_delay_us: 0,
            wait_timeout_ms: 5000,            // 5초
            receive_poll_ms: 100,
            shutdown_grace_ms: 2000,
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            // 비특권 사용자의 기본 mq 한도(msg_max=10)
            channel_capacity: 10,
            namespace: DEFAULT_NAMESPACE.to_string(),
            reclaim_stale: false,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 신호 대기 타임아웃
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// 채널 수신 폴링 주기
    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms.max(1))
    }

    /// 종료 유예 시간
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// 조회 지연
    pub fn cache_delay(&self) -> Duration {
        Duration::from_micros(self.cache_delay_us)
    }

    /// 설정 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.segment_count < 1 {
            return Err(Error::InvalidConfig(
                "세그먼트 수는 1 이상이어야 함".into(),
            ));
        }
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::InvalidConfig(format!(
                "세그먼트 크기는 {} 이상이어야 함 (got {})",
                MIN_SEGMENT_SIZE, self.segment_size
            )));
        }
        if !(1..=MAX_PRODUCER_THREADS).contains(&self.producer_threads) {
            return Err(Error::InvalidConfig(format!(
                "캐시 워커 수는 1~{} 범위 (got {})",
                MAX_PRODUCER_THREADS, self.producer_threads
            )));
        }
        if !(1..=MAX_CONSUMER_THREADS).contains(&self.consumer_threads) {
            return Err(Error::InvalidConfig(format!(
                "프록시 워커 수는 1~{} 범위 (got {})",
                MAX_CONSUMER_THREADS, self.consumer_threads
            )));
        }
        if self.cache_delay_us > MAX_CACHE_DELAY_US {
            return Err(Error::InvalidConfig(format!(
                "조회 지연은 {}us 이하 (got {})",
                MAX_CACHE_DELAY_US, self.cache_delay_us
            )));
        }
        if self.wait_timeout_ms == 0 {
            return Err(Error::InvalidConfig("대기 타임아웃은 0보다 커야 함".into()));
        }
        // 지연이 타임아웃 이상이면 모든 요청이 프록시 쪽에서 만료됨
        if self.cache_delay_us >= self.wait_timeout_ms.saturating_mul(1000) {
            return Err(Error::InvalidConfig(format!(
                "조회 지연({}us)은 대기 타임아웃({}ms)보다 짧아야 함",
                self.cache_delay_us, self.wait_timeout_ms
            )));
        }
        if self.channel_capacity == 0 {
            return Err(Error::InvalidConfig("채널 용량은 1 이상이어야 함".into()));
        }
        if !is_ipc_name(&self.channel_name) {
            return Err(Error::InvalidConfig(format!(
                "채널 이름은 '/'로 시작하는 단일 구성요소여야 함: {}",
                self.channel_name
            )));
        }
        if self.namespace.is_empty()
            || !self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidConfig(format!(
                "네임스페이스는 영숫자/'_'/'-'만 허용: {:?}",
                self.namespace
            )));
        }
        // "/<ns>_seg_<index>_ready" 가 세그먼트 ID 한도 안에 들어가야 함
        let longest = crate::segment::segment_name(&self.namespace, self.segment_count - 1);
        if longest.len() + 6 >= MAX_SEGMENT_ID_LEN {
            return Err(Error::InvalidConfig(format!(
                "네임스페이스가 너무 김: {}",
                self.namespace
            )));
        }
        Ok(())
    }

    /// 저사양 기기용 설정
    pub fn low_spec() -> Self {
        Self {
            segment_count: 4,
            segment_size: 4096,
            producer_threads: 2,
            consumer_threads: 4,
            wait_timeout_ms: 10000,
            ..Self::default()
        }
    }

    /// 고처리량 설정
    pub fn high_throughput() -> Self {
        Self {
            segment_count: 64,
            segment_size: 256 * 1024,         // 256KB
            producer_threads: 32,
            consumer_threads: 64,
            wait_timeout_ms: 3000,
            ..Self::default()
        }
    }

    /// 테스트용 설정 (짧은 타임아웃, 고유 네임스페이스)
    pub fn for_testing(namespace: impl Into<String>) -> Self {
        Self {
            segment_count: 2,
            segment_size: 1024,
            producer_threads: 2,
            consumer_threads: 2,
            wait_timeout_ms: 2000,
            receive_poll_ms: 20,
            shutdown_grace_ms: 200,
            namespace: namespace.into(),
            ..Self::default()
        }
    }
}

/// POSIX IPC 객체 이름 규칙: "/name", 추가 '/' 없음
pub(crate) fn is_ipc_name(name: &str) -> bool {
    name.len() > 1 && name.starts_with('/') && !name[1..].contains('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
        assert!(Config::low_spec().validate().is_ok());
        assert!(Config::high_throughput().validate().is_ok());
        assert!(Config::for_testing("cfg_test").validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = Config::default();
        config.segment_size = MIN_SEGMENT_SIZE - 1;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.segment_count = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.producer_threads = 101;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.consumer_threads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache_delay_us = MAX_CACHE_DELAY_US + 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.channel_name = "no_slash".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.namespace = "bad/name".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_delay_must_be_shorter_than_timeout() {
        let mut config = Config::default();
        config.wait_timeout_ms = 2000;
        config.cache_delay_us = 2_000_000;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        config.cache_delay_us = 1_999_999;
        assert!(config.validate().is_ok());

        // 최대 지연은 기본 타임아웃과 함께 쓸 수 있음
        let mut config = Config::default();
        config.cache_delay_us = MAX_CACHE_DELAY_US;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_reclaim_is_opt_in() {
        assert!(!Config::default().reclaim_stale);
        assert!(!Config::for_testing("cfg_reclaim").reclaim_stale);
    }

    #[test]
    fn test_rejects_bad_names() {
        let mut config = Config::default();
        config.channel_name = "/a/b".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.namespace = "bad/name".into();
        assert!(config.validate().is_err());
    }
}
