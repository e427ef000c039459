//! 세그먼트 풀
//!
//! - `ResourcePool<T>`: 고정 용량 자원 풀 (차단 획득, 타임아웃, close)
//! - `SegmentPool`: 공유 세그먼트 N개를 소유하는 풀
//! - `Lease`: 세그먼트 임대 토큰, drop 시 자동 반환

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::segment::{segment_name, SegmentId, SegmentMap};
use crate::{Config, Error, Result};

/// 풀 내부 상태 (뮤텍스 보호)
#[derive(Debug)]
struct PoolState<T> {
    free: VecDeque<T>,
    leased: usize,
    closed: bool,
}

/// 고정 용량 자원 풀
///
/// 획득 대기자는 `available` 조건변수에서 잠든다. 순서는 보장하지 않는다.
#[derive(Debug)]
pub struct ResourcePool<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
    returned: Condvar,
    capacity: usize,
}

impl<T> ResourcePool<T> {
    /// 자원 목록으로 풀 생성
    pub fn new(items: Vec<T>) -> Self {
        let capacity = items.len();
        Self {
            state: Mutex::new(PoolState {
                free: items.into(),
                leased: 0,
                closed: false,
            }),
            available: Condvar::new(),
            returned: Condvar::new(),
            capacity,
        }
    }

    /// 자원 획득 (`timeout`이 None이면 무기한 대기)
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(item) = state.free.pop_front() {
                state.leased += 1;
                return Ok(item);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out()
                        && state.free.is_empty()
                    {
                        return Err(if state.closed {
                            Error::PoolClosed
                        } else {
                            Error::AcquireTimeout
                        });
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// 자원 반환
    ///
    /// 닫힌 풀에도 반환은 허용된다 (drain 대기자가 깨어남).
    pub fn release(&self, item: T) {
        let mut state = self.state.lock();
        state.free.push_back(item);
        state.leased = state.leased.saturating_sub(1);
        drop(state);

        self.available.notify_one();
        self.returned.notify_all();
    }

    /// 새 획득 차단, 대기 중인 획득자 모두 깨움
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// 임대 중인 자원이 모두 돌아올 때까지 최대 `grace` 대기 후
    /// 남아있는 free 자원을 모두 꺼낸다.
    ///
    /// 반환값: (꺼낸 자원, 아직 반환되지 않은 수)
    pub fn drain(&self, grace: Duration) -> (Vec<T>, usize) {
        let deadline = Instant::now() + grace;
        let mut state = self.state.lock();
        while state.leased > 0 {
            if self.returned.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        let items = state.free.drain(..).collect();
        (items, state.leased)
    }

    /// 전체 용량
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 현재 free 자원 수
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// 현재 임대 중인 자원 수
    pub fn leased(&self) -> usize {
        self.state.lock().leased
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// 임대 기록
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub seq: u64,
    pub since: Instant,
}

/// 공유 세그먼트 풀
#[derive(Debug)]
pub struct SegmentPool {
    pool: ResourcePool<SegmentMap>,
    ids: Vec<SegmentId>,
    leases: DashMap<SegmentId, LeaseInfo>,
    segment_size: usize,
}

impl SegmentPool {
    /// `capacity`개의 세그먼트를 `segment_size` 페이로드로 생성
    ///
    /// 하나라도 실패하면 이미 생성된 세그먼트는 모두 정리된다.
    pub fn new(namespace: &str, capacity: usize, segment_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("세그먼트 수는 1 이상이어야 함".into()));
        }

        let mut segments = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let id = segment_name(namespace, index);
            segments.push(SegmentMap::create(&id, segment_size)?);
        }
        let ids = segments.iter().map(|s| s.id().to_string()).collect();

        info!(
            "세그먼트 풀 초기화: {}개 x {} bytes (namespace={})",
            capacity, segment_size, namespace
        );

        Ok(Self {
            pool: ResourcePool::new(segments),
            ids,
            leases: DashMap::new(),
            segment_size,
        })
    }

    /// 설정에서 풀 생성
    ///
    /// `reclaim_stale`이 켜져 있으면 같은 이름으로 남은 세그먼트와 신호를
    /// 먼저 제거한다. 꺼져 있으면 이름 충돌은 `AlreadyExists` 에러.
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.reclaim_stale {
            for index in 0..config.segment_count {
                let id = segment_name(&config.namespace, index);
                SegmentMap::unlink_names(&id)?;
            }
            warn!(
                "남은 세그먼트 이름 정리: namespace={} ({}개)",
                config.namespace, config.segment_count
            );
        }
        Self::new(&config.namespace, config.segment_count, config.segment_size)
    }

    /// 세그먼트 획득 (free 세그먼트가 생길 때까지 대기)
    pub fn acquire(&self) -> Result<Lease<'_>> {
        let segment = self.pool.acquire(None)?;
        Ok(self.lease(segment))
    }

    /// 최대 `timeout` 동안 세그먼트 획득 시도
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Lease<'_>> {
        let segment = self.pool.acquire(Some(timeout))?;
        Ok(self.lease(segment))
    }

    fn lease(&self, segment: SegmentMap) -> Lease<'_> {
        let seq = segment.header().begin_lease();
        self.leases.insert(
            segment.id().to_string(),
            LeaseInfo {
                seq,
                since: Instant::now(),
            },
        );
        debug!("세그먼트 획득: {} (seq={})", segment.id(), seq);

        Lease {
            pool: self,
            segment: Some(segment),
            seq,
        }
    }

    /// 세그먼트 반환: 상태 리셋 후 free 목록으로
    pub fn release(&self, lease: Lease<'_>) {
        drop(lease);
    }

    fn give_back(&self, segment: SegmentMap) {
        let stale = segment.reset();
        if stale > 0 {
            debug!("세그먼트 {}: 잔여 신호 {}개 제거", segment.id(), stale);
        }
        self.leases.remove(segment.id());
        debug!("세그먼트 반환: {}", segment.id());
        self.pool.release(segment);
    }

    /// 풀 종료
    ///
    /// 새 획득을 막고 `grace` 동안 임대 반환을 기다린 뒤 모든 OS 자원을 해제한다.
    /// 기한 내 돌아오지 않은 세그먼트는 이름만 즉시 제거하고
    /// `LeasesOutstanding`을 반환한다 (매핑은 임대 종료 시 해제).
    pub fn destroy(&self, grace: Duration) -> Result<()> {
        self.pool.close();
        let (segments, outstanding) = self.pool.drain(grace);
        let released = segments.len();
        drop(segments);

        if outstanding > 0 {
            for entry in self.leases.iter() {
                warn!(
                    "세그먼트 강제 회수: {} (seq={}, {:.1}s 임대 중)",
                    entry.key(),
                    entry.value().seq,
                    entry.value().since.elapsed().as_secs_f64()
                );
                if let Err(e) = SegmentMap::unlink_names(entry.key()) {
                    warn!("세그먼트 이름 제거 실패: {}", e);
                }
            }
            return Err(Error::LeasesOutstanding { count: outstanding });
        }

        info!("세그먼트 풀 해제 완료: {}개", released);
        Ok(())
    }

    /// 전체 세그먼트 수 (free + leased)
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// 세그먼트 페이로드 크기
    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn available(&self) -> usize {
        self.pool.available()
    }

    pub fn leased(&self) -> usize {
        self.pool.leased()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// 전체 세그먼트 ID
    pub fn segment_ids(&self) -> &[SegmentId] {
        &self.ids
    }

    /// 현재 임대 중인 세그먼트 ID
    pub fn leased_ids(&self) -> Vec<SegmentId> {
        self.leases.iter().map(|e| e.key().clone()).collect()
    }
}

/// 세그먼트 임대 토큰
///
/// drop 시 세그먼트가 풀로 정확히 한 번 반환된다.
pub struct Lease<'a> {
    pool: &'a SegmentPool,
    segment: Option<SegmentMap>,
    seq: u64,
}

impl<'a> Lease<'a> {
    /// 임대된 세그먼트
    pub fn segment(&self) -> &SegmentMap {
        // segment는 drop 전까지 항상 Some
        self.segment
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease used after release"))
    }

    pub fn id(&self) -> &str {
        self.segment().id()
    }

    /// 이번 임대의 순번
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// 명시적 반환
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(segment) = self.segment.take() {
            self.pool.give_back(segment);
        }
    }
}

impl std::fmt::Debug for Lease<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("segment", &self.segment.as_ref().map(|s| s.id()))
            .field("seq", &self.seq)
            .finish()
    }
}
