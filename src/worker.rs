//! 캐시 워커 풀 (producer)
//!
//! 워커 스레드 M개가 요청 채널에서 요청을 하나씩 꺼내 세그먼트에 연결하고,
//! 저장소를 조회한 뒤 청크 전송 프로토콜을 producer로 수행한다.
//! 세그먼트 반환은 임대자인 프록시의 몫이다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::channel::RequestReceiver;
use crate::message::CacheRequest;
use crate::segment::{ResultStatus, SegmentMap};
use crate::stats::TransferStats;
use crate::storage::Storage;
use crate::transfer::{read_retrying, ProducerTransfer};
use crate::{Config, Error, Result};

/// 워커 공유 컨텍스트
struct WorkerContext {
    receiver: Arc<dyn RequestReceiver>,
    storage: Arc<dyn Storage>,
    stats: Arc<TransferStats>,
    running: Arc<AtomicBool>,
    wait_timeout: Duration,
    poll: Duration,
}

/// 캐시 워커 풀
pub struct CacheWorkerPool {
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<TransferStats>,
}

impl CacheWorkerPool {
    /// `config.producer_threads`개의 워커 시작
    pub fn start(
        config: &Config,
        receiver: Arc<dyn RequestReceiver>,
        storage: Arc<dyn Storage>,
        stats: Arc<TransferStats>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let ctx = Arc::new(WorkerContext {
            receiver,
            storage,
            stats: stats.clone(),
            running: running.clone(),
            wait_timeout: config.wait_timeout(),
            poll: config.receive_poll(),
        });

        let mut pool = Self {
            handles: Vec::with_capacity(config.producer_threads),
            running,
            stats,
        };
        for worker_id in 0..config.producer_threads {
            let ctx = ctx.clone();
            let handle = thread::Builder::new()
                .name(format!("cache-worker-{}", worker_id))
                .spawn(move || worker_loop(worker_id, &ctx));
            match handle {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(Error::Io(e));
                }
            }
        }

        info!("캐시 워커 {}개 시작", config.producer_threads);
        Ok(pool)
    }

    /// 종료 요청 (워커는 현재 요청을 마친 뒤 다음 폴링에서 빠져나감)
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// 종료 요청 후 모든 워커 합류
    pub fn shutdown(&mut self) {
        self.stop();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("캐시 워커 패닉");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 살아있는 워커 수
    pub fn worker_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }
}

impl Drop for CacheWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(worker_id: usize, ctx: &WorkerContext) {
    debug!("캐시 워커 {} 대기 시작", worker_id);

    while ctx.running.load(Ordering::SeqCst) {
        let request = match ctx.receiver.receive(ctx.poll) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                warn!("요청 수신 에러 (worker {}): {}", worker_id, e);
                thread::sleep(ctx.poll);
                continue;
            }
        };

        ctx.stats.record_request();
        debug!(
            "캐시 워커 {}: {} -> {} (pid={}, seq={})",
            worker_id, request.path, request.segment_id, request.requester_id, request.lease_seq
        );

        if let Err(e) = serve_request(&request, ctx.storage.as_ref(), ctx.wait_timeout, &ctx.stats) {
            ctx.stats.record_failure(e.is_timeout());
            warn!(
                "요청 처리 실패 (worker {}, path={}, segment={}): {}",
                worker_id, request.path, request.segment_id, e
            );
        }
    }

    debug!("캐시 워커 {} 종료", worker_id);
}

/// 요청 하나를 처리: 세그먼트 연결 → 조회 → metadata-ready → 청크 스트리밍 → 연결 해제
pub fn serve_request(
    request: &CacheRequest,
    storage: &dyn Storage,
    wait_timeout: Duration,
    stats: &TransferStats,
) -> Result<()> {
    let segment = SegmentMap::attach(&request.segment_id, request.segment_size as usize)?;

    // 조기 확인. 실제 쓰기 권한은 ProducerTransfer가 writer로 다시 확인한다
    let header = segment.header();
    if !header.is_leased() || header.lease_seq() != request.lease_seq {
        return Err(Error::StaleRequest {
            segment_id: request.segment_id.clone(),
            expected: header.lease_seq(),
            got: request.lease_seq,
        });
    }

    let mut producer = ProducerTransfer::new(&segment, request.lease_seq, wait_timeout);

    let found = match storage.lookup(&request.path) {
        Ok(found) => found,
        Err(e) => {
            warn!("저장소 조회 실패 ({}): {}", request.path, e);
            None
        }
    };

    let Some(mut file) = found else {
        producer.publish(ResultStatus::NotFound)?;
        stats.record_miss();
        debug!("캐시 미스: {}", request.path);
        return Ok(());
    };

    producer.publish(ResultStatus::Found(file.size))?;
    stats.record_hit();

    let mut sent = 0u64;
    while let Some(len) = producer.push_chunk(|buf| read_retrying(&mut file.reader, buf))? {
        stats.record_chunk(len);
        sent += len as u64;
    }
    producer.finish()?;

    debug!(
        "캐시 히트: {} ({}/{} bytes via {})",
        request.path, sent, file.size, request.segment_id
    );
    Ok(())
}
