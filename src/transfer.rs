//! 청크 전송 프로토콜
//!
//! 세그먼트 하나를 두고 캐시(producer) 한 명과 프록시(consumer) 한 명이 턴을 주고받는다.
//!
//! ```text
//! AwaitingMetadata ──metadata-ready──▶ MetadataReady ──NotFound / Found(0)──▶ Done
//!                                            │
//!                                       Found(size)
//!                                            ▼
//!                          ┌──▶ Streaming ──chunk-ready──▶ (consumer reads chunk_len bytes)
//!                          │         │                              │
//!                          └─────────┼────chunk-consumed────────────┘
//!                                    ▼
//!                   chunk_len == 0 or consumed == total ──▶ Done
//! ```
//!
//! 모든 대기에는 타임아웃이 있다. 타임아웃/중단은 전송 실패로 처리되고
//! 세그먼트는 임대자(프록시)가 반환한다.
//!
//! 캐시는 writer를 획득한 뒤에만 쓰고, 메타데이터와 청크마다 임대 순번을
//! 찍는다. 프록시는 자기 순번이 찍히지 않은 신호를 무시한다.

use std::io::{self, Read};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::segment::{Claim, ResultStatus, SegmentMap};
use crate::shm::NamedSemaphore;
use crate::{Error, Result};

/// writer 획득 재시도 간격
const CLAIM_RETRY: Duration = Duration::from_millis(1);

/// 세그먼트별 전송 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// 요청 전송 후 메타데이터 대기
    AwaitingMetadata,
    /// 상태/크기 게시됨
    MetadataReady(ResultStatus),
    /// 청크 교환 중
    Streaming { transferred: u64, total: u64 },
    /// 종료
    Done,
}

impl TransferState {
    /// 메타데이터 게시 직후 다음 상태
    fn after_metadata(status: ResultStatus) -> Self {
        match status {
            ResultStatus::Found(total) if total > 0 => TransferState::Streaming {
                transferred: 0,
                total,
            },
            _ => TransferState::Done,
        }
    }
}

fn timed_out(segment: &SegmentMap, signal: &'static str) -> Error {
    Error::WaitTimeout {
        segment_id: segment.id().to_string(),
        signal,
    }
}

fn wait_signal(
    segment: &SegmentMap,
    sem: &NamedSemaphore,
    signal: &'static str,
    timeout: Duration,
) -> Result<()> {
    if sem.wait_timeout(timeout)? {
        Ok(())
    } else {
        Err(timed_out(segment, signal))
    }
}

/// `accept`가 참인 신호가 올 때까지 남은 시간 안에서 대기
fn wait_stamped<F>(
    segment: &SegmentMap,
    sem: &NamedSemaphore,
    signal: &'static str,
    timeout: Duration,
    accept: F,
) -> Result<()>
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() || !sem.wait_timeout(left)? {
            return Err(timed_out(segment, signal));
        }
        if accept() {
            return Ok(());
        }
        debug!("다른 임대의 {} 신호 무시: {}", signal, segment.id());
    }
}

/// 프록시측 전송 (consumer)
pub struct ConsumerTransfer<'a> {
    segment: &'a SegmentMap,
    seq: u64,
    timeout: Duration,
    state: TransferState,
    next_no: u32,
    buf: Vec<u8>,
}

impl<'a> ConsumerTransfer<'a> {
    /// 현재 임대 순번으로 전송 시작. 호출자가 세그먼트를 임대 중이어야 한다.
    pub fn new(segment: &'a SegmentMap, timeout: Duration) -> Self {
        Self {
            segment,
            seq: segment.header().lease_seq(),
            timeout,
            state: TransferState::AwaitingMetadata,
            next_no: 1,
            buf: Vec::new(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// metadata-ready 대기 후 조회 결과 반환
    pub fn wait_metadata(&mut self) -> Result<ResultStatus> {
        if self.state != TransferState::AwaitingMetadata {
            return Err(Error::InvalidSegment {
                segment_id: self.segment.id().to_string(),
                reason: format!("메타데이터 대기 불가 상태: {:?}", self.state),
            });
        }

        let segment = self.segment;
        let seq = self.seq;
        let waited = wait_stamped(
            segment,
            &segment.signals().metadata_ready,
            "metadata-ready",
            self.timeout,
            || segment.header().meta_seq() == seq,
        );
        if let Err(e) = waited {
            self.abort();
            return Err(e);
        }

        let status = match segment.header().status() {
            // 신호 후에도 미결정이면 캐시가 결과를 못 쓴 것: 미스로 취급
            ResultStatus::Unresolved => ResultStatus::NotFound,
            status => status,
        };
        self.state = TransferState::MetadataReady(status);
        Ok(status)
    }

    /// 다음 청크를 받아 `sink`에 전달
    ///
    /// 전송이 끝났으면 `Ok(None)`. 에러가 나면 전송은 중단 상태가 된다.
    pub fn next_chunk<F>(&mut self, sink: F) -> Result<Option<usize>>
    where
        F: FnOnce(&[u8]) -> io::Result<()>,
    {
        if let TransferState::MetadataReady(status) = self.state {
            self.state = TransferState::after_metadata(status);
        }
        let (transferred, total) = match self.state {
            TransferState::Streaming { transferred, total } => (transferred, total),
            TransferState::Done => return Ok(None),
            state => {
                return Err(Error::InvalidSegment {
                    segment_id: self.segment.id().to_string(),
                    reason: format!("청크 수신 불가 상태: {:?}", state),
                })
            }
        };

        match self.receive_chunk(transferred, total, sink) {
            Ok(len) => Ok(Some(len)),
            Err(e) => {
                self.abort();
                Err(e)
            }
        }
    }

    fn receive_chunk<F>(&mut self, transferred: u64, total: u64, sink: F) -> Result<usize>
    where
        F: FnOnce(&[u8]) -> io::Result<()>,
    {
        let segment = self.segment;
        let (seq, no) = (self.seq, self.next_no);
        wait_stamped(
            segment,
            &segment.signals().chunk_ready,
            "chunk-ready",
            self.timeout,
            || {
                let stamp = segment.header().chunk();
                stamp.seq == seq && stamp.no == no
            },
        )?;

        let stamp = segment.header().chunk();
        if stamp.len == 0 {
            return Err(Error::ShortTransfer {
                expected: total,
                got: transferred,
            });
        }
        if stamp.len > segment.capacity() || transferred + stamp.len as u64 > total {
            return Err(Error::InvalidSegment {
                segment_id: segment.id().to_string(),
                reason: format!("청크 길이 초과: {} bytes", stamp.len),
            });
        }

        // SAFETY: chunk-ready를 받았고 chunk-consumed를 보내기 전이므로 페이로드는 우리 턴
        let data = unsafe { segment.payload(stamp.len) };
        self.buf.clear();
        self.buf.extend_from_slice(data);
        let actual = crc32fast::hash(&self.buf);
        if actual != stamp.crc {
            return Err(Error::CrcMismatch {
                expected: stamp.crc,
                got: actual,
            });
        }
        sink(&self.buf).map_err(Error::Sink)?;

        let transferred = transferred + stamp.len as u64;
        self.next_no += 1;
        segment.signals().chunk_consumed.post()?;

        self.state = if transferred >= total {
            TransferState::Done
        } else {
            TransferState::Streaming { transferred, total }
        };
        Ok(stamp.len)
    }

    /// 모든 청크를 `sink`로 전달하고 총 바이트 수 반환
    pub fn relay<F>(&mut self, mut sink: F) -> Result<u64>
    where
        F: FnMut(&[u8]) -> io::Result<()>,
    {
        let mut relayed = 0u64;
        while let Some(len) = self.next_chunk(&mut sink)? {
            relayed += len as u64;
        }
        Ok(relayed)
    }

    /// 전송 중단: 중단 플래그 설정 후 대기 중인 캐시를 깨운다
    pub fn abort(&mut self) {
        if self.state == TransferState::Done {
            return;
        }
        self.segment.header().set_aborted();
        if let Err(e) = self.segment.signals().chunk_consumed.post() {
            warn!("중단 신호 전송 실패 ({}): {}", self.segment.id(), e);
        }
        self.state = TransferState::Done;
        debug!("전송 중단: {}", self.segment.id());
    }
}

/// 캐시측 전송 (producer)
///
/// 요청에 실린 임대 순번 `seq`의 writer를 획득한 동안에만 세그먼트에 쓴다.
/// writer는 전송이 끝나거나 drop될 때 반환된다.
pub struct ProducerTransfer<'a> {
    segment: &'a SegmentMap,
    seq: u64,
    timeout: Duration,
    state: TransferState,
    claimed: bool,
    next_no: u32,
}

impl<'a> ProducerTransfer<'a> {
    pub fn new(segment: &'a SegmentMap, seq: u64, timeout: Duration) -> Self {
        Self {
            segment,
            seq,
            timeout,
            state: TransferState::AwaitingMetadata,
            claimed: false,
            next_no: 1,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// 조회 결과 게시 + metadata-ready 신호 (정확히 한 번)
    ///
    /// 임대가 바뀌었으면 아무것도 쓰지 않고 `StaleRequest`.
    pub fn publish(&mut self, status: ResultStatus) -> Result<()> {
        if self.state != TransferState::AwaitingMetadata {
            return Err(Error::InvalidSegment {
                segment_id: self.segment.id().to_string(),
                reason: "메타데이터는 한 번만 게시 가능".into(),
            });
        }
        if let Err(e) = self.claim() {
            self.set_done();
            return Err(e);
        }

        let status = match status {
            ResultStatus::Unresolved => ResultStatus::NotFound,
            status => status,
        };
        self.segment.header().publish_metadata(self.seq, status);
        self.segment.signals().metadata_ready.post()?;

        self.state = TransferState::MetadataReady(status);
        // 보낼 청크가 없으면 writer는 바로 반환
        if TransferState::after_metadata(status) == TransferState::Done {
            self.release();
        }
        Ok(())
    }

    fn claim(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.segment.header().try_claim_writer(self.seq) {
                Claim::Granted => {
                    self.claimed = true;
                    return Ok(());
                }
                Claim::Lost => return Err(self.lost()),
                Claim::Busy if Instant::now() >= deadline => {
                    return Err(timed_out(self.segment, "writer"))
                }
                Claim::Busy => thread::sleep(CLAIM_RETRY),
            }
        }
    }

    /// 소유권을 잃은 이유
    fn lost(&self) -> Error {
        let current = self.segment.header().lease_seq();
        if current == self.seq {
            Error::TransferAborted {
                segment_id: self.segment.id().to_string(),
            }
        } else {
            Error::StaleRequest {
                segment_id: self.segment.id().to_string(),
                expected: current,
                got: self.seq,
            }
        }
    }

    fn ensure_owned(&mut self) -> Result<()> {
        if self.claimed && self.segment.header().is_owned_by(self.seq) {
            Ok(())
        } else {
            self.set_done();
            Err(self.lost())
        }
    }

    fn release(&mut self) {
        if self.claimed {
            self.segment.header().release_writer(self.seq);
            self.claimed = false;
        }
    }

    fn set_done(&mut self) {
        self.state = TransferState::Done;
        self.release();
    }

    /// 페이로드 버퍼를 `fill`로 채워 청크 하나를 넘기고 소비를 기다린다
    ///
    /// `fill`이 0을 반환하면(소스 끝) `Ok(None)`.
    pub fn push_chunk<F>(&mut self, fill: F) -> Result<Option<usize>>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        if let TransferState::MetadataReady(status) = self.state {
            self.state = TransferState::after_metadata(status);
        }
        let (transferred, total) = match self.state {
            TransferState::Streaming { transferred, total } => (transferred, total),
            _ => return Ok(None),
        };
        self.ensure_owned()?;

        let segment = self.segment;
        let remaining = (total - transferred)
            .min(segment.capacity() as u64)
            .min(u32::MAX as u64) as usize;
        // SAFETY: writer를 가진 채 chunk-ready를 보내기 전까지 페이로드는 캐시의 턴
        let buf = unsafe { segment.payload_mut() };
        let len = fill(&mut buf[..remaining])?;
        if len == 0 {
            return Ok(None);
        }
        let len = len.min(remaining);
        let crc = crc32fast::hash(&buf[..len]);

        self.ensure_owned()?;
        let signals = segment.signals();
        segment.header().set_chunk(self.seq, self.next_no, len, crc);
        self.next_no += 1;
        signals.chunk_ready.post()?;

        let waited = wait_signal(segment, &signals.chunk_consumed, "chunk-consumed", self.timeout);
        if let Err(e) = waited {
            self.set_done();
            return Err(e);
        }
        if segment.header().is_aborted() {
            self.set_done();
            return Err(Error::TransferAborted {
                segment_id: segment.id().to_string(),
            });
        }

        let transferred = transferred + len as u64;
        if transferred >= total {
            self.set_done();
        } else {
            self.state = TransferState::Streaming { transferred, total };
        }
        Ok(Some(len))
    }

    /// 소스 전체를 청크 단위로 전송하고 보낸 바이트 수 반환
    pub fn stream<R: Read>(&mut self, source: &mut R) -> Result<u64> {
        let mut sent = 0u64;
        while let Some(len) = self.push_chunk(|buf| read_retrying(source, buf))? {
            sent += len as u64;
        }
        self.finish()?;
        Ok(sent)
    }

    /// 소스가 광고한 크기보다 일찍 끝났으면 길이 0 종료 청크를 보낸다
    pub fn finish(&mut self) -> Result<()> {
        if let TransferState::MetadataReady(status) = self.state {
            self.state = TransferState::after_metadata(status);
        }
        if let TransferState::Streaming { transferred, total } = self.state {
            warn!(
                "소스가 일찍 끝남 ({}): {}/{} bytes",
                self.segment.id(),
                transferred,
                total
            );
            self.ensure_owned()?;
            self.segment.header().set_chunk(self.seq, self.next_no, 0, 0);
            self.segment.signals().chunk_ready.post()?;
        }
        self.set_done();
        Ok(())
    }
}

impl Drop for ProducerTransfer<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

pub(crate) fn read_retrying<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match source.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}
