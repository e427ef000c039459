//! 프록시측 요청 처리 (consumer)
//!
//! 클라이언트 요청 하나마다:
//! 세그먼트 획득 → 요청 전송 → metadata-ready 대기 → 청크 중계 → 세그먼트 반환

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::RequestSender;
use crate::message::CacheRequest;
use crate::pool::SegmentPool;
use crate::segment::ResultStatus;
use crate::stats::TransferStats;
use crate::transfer::ConsumerTransfer;
use crate::{Config, Error, Result};

/// 클라이언트 응답 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHeader {
    /// 성공, 전체 크기
    Ok(u64),
    /// 파일 없음 (본문 없음)
    FileNotFound,
    /// 서버 내부 실패
    Error,
}

/// 프록시 워커의 출력 대상 (클라이언트 연결)
pub trait ResponseSink {
    fn send_header(&mut self, header: ResponseHeader) -> io::Result<()>;

    fn send(&mut self, data: &[u8]) -> io::Result<()>;
}

/// 프록시 컨텍스트
///
/// 시작 시 한 번 만들고 모든 프록시 워커가 참조로 공유한다.
pub struct CacheProxy {
    pool: SegmentPool,
    sender: Box<dyn RequestSender>,
    wait_timeout: Duration,
    stats: Arc<TransferStats>,
}

impl CacheProxy {
    pub fn new(
        pool: SegmentPool,
        sender: Box<dyn RequestSender>,
        config: &Config,
        stats: Arc<TransferStats>,
    ) -> Self {
        Self {
            pool,
            sender,
            wait_timeout: config.wait_timeout(),
            stats,
        }
    }

    /// 요청 하나 처리. 클라이언트에 보낸 본문 바이트 수를 반환한다.
    ///
    /// 에러가 나도 세그먼트는 반환된다. 헤더를 아직 보내지 않았다면
    /// 호출자가 `ResponseHeader::Error`를 보낼 책임이 있다.
    pub fn handle<S>(&self, path: &str, sink: &mut S) -> Result<u64>
    where
        S: ResponseSink + ?Sized,
    {
        self.stats.record_request();
        let result = self.fetch(path, sink);
        if let Err(e) = &result {
            self.stats.record_failure(e.is_timeout());
            warn!("요청 실패 ({}): {}", path, e);
        }
        result
    }

    fn fetch<S>(&self, path: &str, sink: &mut S) -> Result<u64>
    where
        S: ResponseSink + ?Sized,
    {
        let lease = self.pool.acquire()?;
        debug!("{} -> {} (seq={})", path, lease.id(), lease.seq());

        let request = CacheRequest::new(path, lease.id(), self.pool.segment_size(), lease.seq())?;
        // 실패 시 lease drop으로 세그먼트 반환
        self.sender.send(&request)?;

        let mut transfer = ConsumerTransfer::new(lease.segment(), self.wait_timeout);
        let total = match transfer.wait_metadata()? {
            ResultStatus::Found(total) => total,
            _ => {
                self.stats.record_miss();
                sink.send_header(ResponseHeader::FileNotFound)
                    .map_err(Error::Sink)?;
                return Ok(0);
            }
        };

        self.stats.record_hit();
        if let Err(e) = sink.send_header(ResponseHeader::Ok(total)) {
            transfer.abort();
            return Err(Error::Sink(e));
        }

        let stats = &self.stats;
        let relayed = transfer.relay(|chunk| {
            sink.send(chunk)?;
            stats.record_chunk(chunk.len());
            Ok(())
        })?;

        debug!(
            "전송 완료: {} ({} bytes via {})",
            path,
            relayed,
            lease.id()
        );
        Ok(relayed)
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// 세그먼트 풀 정리 (새 요청 차단 → 반환 대기 → OS 자원 해제)
    pub fn shutdown(&self, grace: Duration) -> Result<()> {
        self.pool.destroy(grace)
    }
}

/// 응답을 메모리에 모으는 sink
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferedResponse {
    pub header: Option<ResponseHeader>,
    pub body: Vec<u8>,
}

impl ResponseSink for BufferedResponse {
    fn send_header(&mut self, header: ResponseHeader) -> io::Result<()> {
        self.header = Some(header);
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.body.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{local_channel, LocalSender, MessageQueue, MqSender};
    use crate::storage::MemoryStorage;
    use crate::testutil::unique_namespace;
    use crate::worker::CacheWorkerPool;
    use rand::RngCore;

    struct Harness {
        proxy: Arc<CacheProxy>,
        _workers: CacheWorkerPool,
    }

    fn harness(config: Config, storage: MemoryStorage) -> Harness {
        let pool = SegmentPool::from_config(&config).unwrap();
        let (tx, rx) = local_channel(config.channel_capacity);
        let workers = CacheWorkerPool::start(
            &config,
            Arc::new(rx),
            Arc::new(storage),
            Arc::new(TransferStats::new()),
        )
        .unwrap();
        let proxy = CacheProxy::new(pool, Box::new(tx), &config, Arc::new(TransferStats::new()));
        Harness {
            proxy: Arc::new(proxy),
            _workers: workers,
        }
    }

    /// 헤더 이후 본문 전송에서 실패하는 sink
    struct BrokenClient {
        header: Option<ResponseHeader>,
    }

    impl ResponseSink for BrokenClient {
        fn send_header(&mut self, header: ResponseHeader) -> io::Result<()> {
            self.header = Some(header);
            Ok(())
        }

        fn send(&mut self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
    }

    #[test]
    fn test_hit_relays_exact_bytes() {
        let mut data = vec![0u8; 10_000];
        rand::thread_rng().fill_bytes(&mut data);
        let mut storage = MemoryStorage::new();
        storage.insert("/photo.jpg", data.clone());

        let h = harness(Config::for_testing(unique_namespace("hit")), storage);
        let mut response = BufferedResponse::default();
        let sent = h.proxy.handle("/photo.jpg", &mut response).unwrap();

        assert_eq!(sent, 10_000);
        assert_eq!(response.header, Some(ResponseHeader::Ok(10_000)));
        assert_eq!(response.body, data);
        assert_eq!(h.proxy.pool().available(), h.proxy.pool().capacity());
    }

    #[test]
    fn test_miss_has_empty_body() {
        for size in [824usize, 1024, 4096] {
            let mut config = Config::for_testing(unique_namespace("miss"));
            config.segment_size = size;
            let h = harness(config, MemoryStorage::new());

            let mut response = BufferedResponse::default();
            assert_eq!(h.proxy.handle("/nope", &mut response).unwrap(), 0);
            assert_eq!(response.header, Some(ResponseHeader::FileNotFound));
            assert!(response.body.is_empty());
        }
    }

    #[test]
    fn test_concurrent_requests_share_pool() {
        let mut storage = MemoryStorage::new();
        for i in 0..6 {
            storage.insert(format!("/file{}", i), vec![i as u8; 1500 + i * 700]);
        }
        let mut config = Config::for_testing(unique_namespace("conc"));
        config.channel_capacity = 16;
        let h = harness(config, storage);

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let proxy = h.proxy.clone();
                std::thread::spawn(move || {
                    let mut response = BufferedResponse::default();
                    proxy.handle(&format!("/file{}", i), &mut response).unwrap();
                    assert_eq!(response.body, vec![i as u8; 1500 + i * 700]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let pool = h.proxy.pool();
        assert_eq!(pool.available(), pool.capacity());
        assert_eq!(h.proxy.stats().snapshot().hits, 6);
    }

    #[test]
    fn test_sink_failure_releases_segment() {
        let mut storage = MemoryStorage::new();
        storage.insert("/big", vec![5u8; 8192]);
        let h = harness(Config::for_testing(unique_namespace("brk")), storage);

        let mut client = BrokenClient { header: None };
        let err = h.proxy.handle("/big", &mut client).unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(client.header, Some(ResponseHeader::Ok(8192)));
        assert_eq!(h.proxy.pool().leased(), 0);

        // 중단 후에도 세그먼트는 다음 요청에 정상 사용
        let mut response = BufferedResponse::default();
        h.proxy.handle("/big", &mut response).unwrap();
        assert_eq!(response.body.len(), 8192);
    }

    #[test]
    fn test_channel_failure_releases_segment() {
        let config = Config::for_testing(unique_namespace("chf"));
        let pool = SegmentPool::from_config(&config).unwrap();
        let (tx, rx): (LocalSender, _) = local_channel(1);
        drop(rx);
        let proxy = CacheProxy::new(pool, Box::new(tx), &config, Arc::new(TransferStats::new()));

        let mut response = BufferedResponse::default();
        let err = proxy.handle("/a", &mut response).unwrap_err();
        assert!(matches!(err, Error::ChannelUnavailable(_)));
        assert_eq!(response.header, None);
        assert_eq!(proxy.pool().leased(), 0);
        assert_eq!(proxy.stats().snapshot().failures, 1);
    }

    #[test]
    fn test_no_producer_times_out() {
        let mut config = Config::for_testing(unique_namespace("nop"));
        config.wait_timeout_ms = 50;
        let pool = SegmentPool::from_config(&config).unwrap();
        let (tx, _rx) = local_channel(4);
        let proxy = CacheProxy::new(pool, Box::new(tx), &config, Arc::new(TransferStats::new()));

        let mut response = BufferedResponse::default();
        let err = proxy.handle("/a", &mut response).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(proxy.pool().leased(), 0);
        assert_eq!(proxy.stats().snapshot().timeouts, 1);
    }

    #[test]
    fn test_over_message_queue() {
        let namespace = unique_namespace("mqe2e");
        let mut config = Config::for_testing(namespace.clone());
        config.channel_name = format!("/{}_mq", namespace);

        let queue = MessageQueue::create(&config.channel_name, config.channel_capacity).unwrap();
        let mut storage = MemoryStorage::new();
        storage.insert("/doc.txt", b"shared memory payload".to_vec());
        let _workers = CacheWorkerPool::start(
            &config,
            Arc::new(queue),
            Arc::new(storage),
            Arc::new(TransferStats::new()),
        )
        .unwrap();

        let pool = SegmentPool::from_config(&config).unwrap();
        let sender = MqSender::new(&config.channel_name).unwrap();
        let proxy = CacheProxy::new(pool, Box::new(sender), &config, Arc::new(TransferStats::new()));

        let mut response = BufferedResponse::default();
        proxy.handle("/doc.txt", &mut response).unwrap();
        assert_eq!(response.body, b"shared memory payload");
    }

    #[test]
    fn test_shutdown_rejects_new_requests() {
        let h = harness(
            Config::for_testing(unique_namespace("shut")),
            MemoryStorage::new(),
        );
        h.proxy.shutdown(Duration::from_millis(50)).unwrap();

        let mut response = BufferedResponse::default();
        assert!(matches!(
            h.proxy.handle("/a", &mut response),
            Err(Error::PoolClosed)
        ));
    }
}
