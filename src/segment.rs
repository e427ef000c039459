//! 공유 세그먼트 정의
//!
//! 세그먼트 영역 레이아웃:
//!
//! ```text
//! [SegmentHeader (64 B)][payload (capacity B)]
//! ```
//!
//! 헤더는 포인터가 없는 고정 레이아웃이며 모든 필드가 atomic 이다.
//! 동기화 신호는 헤더에 내장하지 않고 세그먼트 ID에서 파생한
//! 이름있는 세마포어 3개로 참조한다.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::shm::{NamedSemaphore, SharedRegion};
use crate::{Error, Result, MAX_SEGMENT_ID_LEN};

/// 세그먼트 ID (공유 메모리 객체 이름)
pub type SegmentId = String;

/// 헤더 매직 넘버 ("SHMC")
pub const SEGMENT_MAGIC: u32 = 0x434D_4853;

/// 헤더 크기 (페이로드 시작 오프셋)
pub const HEADER_SIZE: usize = 64;

const STATUS_UNRESOLVED: u32 = 0;
const STATUS_FOUND: u32 = 1;
const STATUS_NOT_FOUND: u32 = 2;

/// 세그먼트 ID 생성: "/<namespace>_seg_<index>"
pub fn segment_name(namespace: &str, index: usize) -> SegmentId {
    format!("/{}_seg_{}", namespace, index)
}

/// 조회 결과 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// 아직 캐시가 결과를 기록하지 않음
    Unresolved,
    /// 캐시 히트 (전체 크기)
    Found(u64),
    /// 캐시 미스
    NotFound,
}

/// 헤더 flags 비트
const FLAG_LEASED: u32 = 1;
const FLAG_ABORTED: u32 = 2;

/// 임대 해제 시 writer 반환을 기다리는 최대 시간
const WRITER_RELEASE_WAIT: Duration = Duration::from_millis(500);

/// 청크 스탬프: 어느 임대의 몇 번째 청크인지
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStamp {
    pub seq: u64,
    /// 1부터 시작. 0은 청크 없음
    pub no: u32,
    pub len: usize,
    pub crc: u32,
}

/// writer 획득 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Granted,
    /// 다른 writer가 아직 반환하지 않음
    Busy,
    /// 임대가 바뀌었거나 중단됨
    Lost,
}

/// 공유 세그먼트 헤더
///
/// 캐시 워커는 `writer`를 자기 임대 순번으로 획득한 동안에만 헤더와
/// 페이로드에 쓴다. 임대 해제는 LEASED를 내린 뒤 writer 반환을 기다리므로
/// 이전 임대의 워커가 다음 임대에 쓰는 일이 없다.
#[repr(C)]
pub struct SegmentHeader {
    magic: AtomicU32,
    flags: AtomicU32,
    status: AtomicU32,
    chunk_no: AtomicU32,
    lease_seq: AtomicU64,
    /// 쓰기 권한을 가진 임대 순번 (0 = 없음)
    writer: AtomicU64,
    total_size: AtomicU64,
    /// 메타데이터를 게시한 임대 순번
    meta_seq: AtomicU64,
    chunk_len: AtomicU32,
    chunk_crc: AtomicU32,
    chunk_seq: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<SegmentHeader>() == HEADER_SIZE);

impl SegmentHeader {
    fn init(&self) {
        self.clear();
        self.flags.store(0, Ordering::SeqCst);
        self.lease_seq.store(0, Ordering::SeqCst);
        self.writer.store(0, Ordering::SeqCst);
        self.magic.store(SEGMENT_MAGIC, Ordering::Release);
    }

    /// 임대별 필드 초기화
    fn clear(&self) {
        self.status.store(STATUS_UNRESOLVED, Ordering::Relaxed);
        self.total_size.store(0, Ordering::Relaxed);
        self.meta_seq.store(0, Ordering::Relaxed);
        self.chunk_no.store(0, Ordering::Relaxed);
        self.chunk_len.store(0, Ordering::Relaxed);
        self.chunk_crc.store(0, Ordering::Relaxed);
        self.chunk_seq.store(0, Ordering::Release);
    }

    pub fn magic(&self) -> u32 {
        self.magic.load(Ordering::Acquire)
    }

    pub fn is_leased(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_LEASED != 0
    }

    /// 새 임대 시작: 순번 증가 후 반환
    ///
    /// 순번을 먼저 올리고 LEASED를 세운다. LEASED를 본 쪽은 새 순번을 본다.
    pub(crate) fn begin_lease(&self) -> u64 {
        self.clear();
        let seq = self.lease_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.flags.store(FLAG_LEASED, Ordering::SeqCst);
        seq
    }

    /// 임대 해제 1단계: 이후 writer 획득은 모두 실패
    pub(crate) fn revoke_lease(&self) {
        self.flags.fetch_and(!FLAG_LEASED, Ordering::SeqCst);
    }

    /// 임대 해제 마지막 단계: 플래그와 임대별 필드 초기화
    pub(crate) fn end_lease(&self) {
        self.flags.store(0, Ordering::SeqCst);
        self.clear();
    }

    pub fn lease_seq(&self) -> u64 {
        self.lease_seq.load(Ordering::SeqCst)
    }

    /// `seq` 임대가 아직 살아있고 중단되지 않았는지
    pub fn is_owned_by(&self, seq: u64) -> bool {
        let flags = self.flags.load(Ordering::SeqCst);
        flags & FLAG_LEASED != 0
            && flags & FLAG_ABORTED == 0
            && self.lease_seq.load(Ordering::SeqCst) == seq
    }

    /// 현재 writer 순번 (0 = 없음)
    pub fn writer(&self) -> u64 {
        self.writer.load(Ordering::SeqCst)
    }

    /// `seq` 임대의 writer 획득 시도
    ///
    /// 획득 후 소유권을 다시 확인한다. 임대 해제 쪽은 LEASED를 내린 뒤
    /// writer를 확인하므로 둘 중 한쪽은 반드시 상대를 본다.
    pub(crate) fn try_claim_writer(&self, seq: u64) -> Claim {
        if !self.is_owned_by(seq) {
            return Claim::Lost;
        }
        if self
            .writer
            .compare_exchange(0, seq, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Claim::Busy;
        }
        if self.is_owned_by(seq) {
            Claim::Granted
        } else {
            self.release_writer(seq);
            Claim::Lost
        }
    }

    /// writer 반환 (`seq`가 현재 writer일 때만)
    pub(crate) fn release_writer(&self, seq: u64) {
        let _ = self
            .writer
            .compare_exchange(seq, 0, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn status(&self) -> ResultStatus {
        match self.status.load(Ordering::Acquire) {
            STATUS_FOUND => ResultStatus::Found(self.total_size.load(Ordering::Acquire)),
            STATUS_NOT_FOUND => ResultStatus::NotFound,
            _ => ResultStatus::Unresolved,
        }
    }

    pub(crate) fn set_status(&self, status: ResultStatus) {
        match status {
            ResultStatus::Found(size) => {
                self.total_size.store(size, Ordering::Relaxed);
                self.status.store(STATUS_FOUND, Ordering::Release);
            }
            ResultStatus::NotFound => {
                self.total_size.store(0, Ordering::Relaxed);
                self.status.store(STATUS_NOT_FOUND, Ordering::Release);
            }
            ResultStatus::Unresolved => {
                self.status.store(STATUS_UNRESOLVED, Ordering::Release);
            }
        }
    }

    /// 조회 결과 기록 후 `seq`로 스탬프
    pub(crate) fn publish_metadata(&self, seq: u64, status: ResultStatus) {
        self.set_status(status);
        self.meta_seq.store(seq, Ordering::Release);
    }

    /// 메타데이터를 게시한 임대 순번 (0 = 미게시)
    pub fn meta_seq(&self) -> u64 {
        self.meta_seq.load(Ordering::Acquire)
    }

    /// 현재 청크 스탬프
    pub fn chunk(&self) -> ChunkStamp {
        let no = self.chunk_no.load(Ordering::Acquire);
        ChunkStamp {
            seq: self.chunk_seq.load(Ordering::Acquire),
            no,
            len: self.chunk_len.load(Ordering::Acquire) as usize,
            crc: self.chunk_crc.load(Ordering::Acquire),
        }
    }

    /// 청크 기록. `len`은 u32 범위여야 한다.
    pub(crate) fn set_chunk(&self, seq: u64, no: u32, len: usize, crc: u32) {
        self.chunk_len.store(len as u32, Ordering::Relaxed);
        self.chunk_crc.store(crc, Ordering::Relaxed);
        self.chunk_seq.store(seq, Ordering::Relaxed);
        self.chunk_no.store(no, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & FLAG_ABORTED != 0
    }

    pub(crate) fn set_aborted(&self) {
        self.flags.fetch_or(FLAG_ABORTED, Ordering::SeqCst);
    }
}

/// 세그먼트 동기화 신호 3종
#[derive(Debug)]
pub struct Signals {
    /// 상태/크기 기록 완료 (캐시 → 프록시)
    pub metadata_ready: NamedSemaphore,
    /// 청크 기록 완료 (캐시 → 프록시)
    pub chunk_ready: NamedSemaphore,
    /// 청크 소비 완료 (프록시 → 캐시)
    pub chunk_consumed: NamedSemaphore,
}

impl Signals {
    /// 세그먼트 ID에서 신호 이름 파생
    pub fn names(id: &str) -> [String; 3] {
        [
            format!("{}_meta", id),
            format!("{}_ready", id),
            format!("{}_done", id),
        ]
    }

    fn create(id: &str) -> Result<Self> {
        let [meta, ready, done] = Self::names(id);
        Ok(Self {
            metadata_ready: NamedSemaphore::create(&meta)?,
            chunk_ready: NamedSemaphore::create(&ready)?,
            chunk_consumed: NamedSemaphore::create(&done)?,
        })
    }

    fn open(id: &str) -> Result<Self> {
        let [meta, ready, done] = Self::names(id);
        Ok(Self {
            metadata_ready: NamedSemaphore::open(&meta)?,
            chunk_ready: NamedSemaphore::open(&ready)?,
            chunk_consumed: NamedSemaphore::open(&done)?,
        })
    }

    /// 남아있는 신호를 모두 제거
    pub(crate) fn drain(&self) -> usize {
        self.metadata_ready.drain() + self.chunk_ready.drain() + self.chunk_consumed.drain()
    }
}

/// 매핑된 세그먼트 (영역 + 신호)
///
/// 풀이 `create`로 소유하고, 캐시 워커는 요청마다 `attach`한다.
#[derive(Debug)]
pub struct SegmentMap {
    id: SegmentId,
    region: SharedRegion,
    signals: Signals,
    capacity: usize,
}

impl SegmentMap {
    /// 새 세그먼트 생성 (소유자)
    pub fn create(id: &str, capacity: usize) -> Result<Self> {
        check_id(id)?;
        let region = SharedRegion::create(id, HEADER_SIZE + capacity)?;
        let signals = Signals::create(id)?;
        let map = Self {
            id: id.to_string(),
            region,
            signals,
            capacity,
        };
        map.header().init();
        Ok(map)
    }

    /// 기존 세그먼트에 연결 (캐시 워커)
    pub fn attach(id: &str, capacity: usize) -> Result<Self> {
        check_id(id)?;
        let region = SharedRegion::attach(id, HEADER_SIZE + capacity)?;
        let map = Self {
            id: id.to_string(),
            region,
            signals: Signals::open(id)?,
            capacity,
        };
        if map.header().magic() != SEGMENT_MAGIC {
            return Err(Error::InvalidSegment {
                segment_id: id.to_string(),
                reason: format!("매직 넘버 불일치: {:08X}", map.header().magic()),
            });
        }
        Ok(map)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 페이로드 용량 (바이트)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: 영역은 최소 HEADER_SIZE 이며 mmap 시작 주소는 페이지 정렬.
        // 헤더는 atomic 필드만 가지므로 공유 참조로 접근해도 안전하다.
        unsafe { &*(self.region.as_ptr() as *const SegmentHeader) }
    }

    pub fn signals(&self) -> &Signals {
        &self.signals
    }

    /// 페이로드 앞 `len` 바이트 읽기
    ///
    /// # Safety
    /// 호출자가 현재 턴을 가지고 있어야 함 (chunk-ready 수신 후, chunk-consumed 신호 전).
    pub(crate) unsafe fn payload(&self, len: usize) -> &[u8] {
        let len = len.min(self.capacity);
        std::slice::from_raw_parts(self.region.as_ptr().add(HEADER_SIZE), len)
    }

    /// 페이로드 전체 쓰기 버퍼
    ///
    /// # Safety
    /// 호출자가 현재 턴을 가지고 있어야 하며, 반환된 슬라이스가 살아있는 동안
    /// 다른 페이로드 참조를 만들면 안 된다.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn payload_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.region.as_ptr().add(HEADER_SIZE), self.capacity)
    }

    /// 임대 해제 시 초기화: 소유권 회수 → writer 반환 대기 → 헤더 리셋 + 잔여 신호 제거
    ///
    /// writer가 제한 시간 안에 돌아오지 않으면 (예: 캐시 프로세스 종료) 강제로 해제한다.
    pub(crate) fn reset(&self) -> usize {
        let header = self.header();
        header.revoke_lease();

        let deadline = Instant::now() + WRITER_RELEASE_WAIT;
        loop {
            let writer = header.writer();
            if writer == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!("writer 반환 대기 초과, 강제 해제: {} (seq={})", self.id, writer);
                header.release_writer(writer);
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        header.end_lease();
        self.signals.drain()
    }

    /// 세그먼트의 모든 이름 제거 (강제 회수용)
    pub fn unlink_names(id: &str) -> Result<()> {
        SharedRegion::unlink(id)?;
        for name in Signals::names(id) {
            NamedSemaphore::unlink(&name)?;
        }
        Ok(())
    }
}

fn check_id(id: &str) -> Result<()> {
    // 파생 신호 이름("_ready")까지 한도 안에 들어와야 함
    if id.len() + 6 >= MAX_SEGMENT_ID_LEN {
        return Err(Error::SegmentIdTooLong {
            len: id.len(),
            max: MAX_SEGMENT_ID_LEN - 7,
        });
    }
    if !crate::config::is_ipc_name(id) {
        return Err(Error::InvalidSegment {
            segment_id: id.to_string(),
            reason: "'/'로 시작하는 단일 구성요소여야 함".into(),
        });
    }
    Ok(())
}
