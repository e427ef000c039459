//! 요청 채널
//!
//! 프록시(다수 송신자)에서 캐시 워커(다수 수신자)로 `CacheRequest`를 전달하는
//! 유한 용량 채널. 송신은 비차단이며 가득 차거나 채널이 없으면 즉시 실패한다.
//!
//! - `MessageQueue` / `MqSender`: POSIX 메시지 큐 (프로세스 간)
//! - `local_channel`: crossbeam 기반 프로세스 내 채널 (단일 프로세스 배치/테스트)

use std::ffi::CString;
use std::io;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, TrySendError};
use tracing::debug;

use crate::message::{CacheRequest, MAX_REQUEST_SIZE};
use crate::shm::{c_name, realtime_deadline};
use crate::{Error, Result};

/// 요청 송신측 (프록시)
pub trait RequestSender: Send + Sync {
    /// 요청 전송 (비차단)
    fn send(&self, request: &CacheRequest) -> Result<()>;
}

/// 요청 수신측 (캐시 워커)
pub trait RequestReceiver: Send + Sync {
    /// 최대 `timeout` 동안 대기. 메시지가 없으면 `Ok(None)`.
    fn receive(&self, timeout: Duration) -> Result<Option<CacheRequest>>;
}

/// POSIX 메시지 큐 (수신측 소유)
///
/// 캐시 프로세스가 생성하고 drop 시 이름을 제거한다.
#[derive(Debug)]
pub struct MessageQueue {
    mqd: libc::mqd_t,
    name: String,
    owns_name: bool,
}

// SAFETY: mq_* 호출은 스레드 안전. 여러 워커가 같은 디스크립터로 수신한다.
unsafe impl Send for MessageQueue {}
unsafe impl Sync for MessageQueue {}

impl MessageQueue {
    /// 큐 생성. 같은 이름의 큐가 이미 있으면 `AlreadyExists`로 실패한다.
    pub fn create(name: &str, capacity: usize) -> Result<Self> {
        let c = c_name(name)?;

        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_flags = 0;
        attr.mq_maxmsg = capacity as _;
        attr.mq_msgsize = MAX_REQUEST_SIZE as _;

        let mqd = unsafe {
            libc::mq_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDONLY,
                0o600 as libc::mode_t,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mqd == -1 {
            return Err(Error::last_os("mq_open", name));
        }

        debug!("요청 큐 생성: {} (capacity={})", name, capacity);
        Ok(Self {
            mqd,
            name: name.to_string(),
            owns_name: true,
        })
    }

    /// 기존 큐를 수신용으로 열기
    pub fn open(name: &str) -> Result<Self> {
        let c = c_name(name)?;
        let mqd = unsafe { libc::mq_open(c.as_ptr(), libc::O_RDONLY) };
        if mqd == -1 {
            return Err(Error::last_os("mq_open", name));
        }
        Ok(Self {
            mqd,
            name: name.to_string(),
            owns_name: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 큐 이름 제거
    pub fn unlink(name: &str) -> Result<()> {
        let c = c_name(name)?;
        if unsafe { libc::mq_unlink(c.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Os {
                    op: "mq_unlink",
                    name: name.to_string(),
                    source: err,
                });
            }
        }
        Ok(())
    }
}

impl RequestReceiver for MessageQueue {
    fn receive(&self, timeout: Duration) -> Result<Option<CacheRequest>> {
        let mut buf = [0u8; MAX_REQUEST_SIZE];
        let deadline = realtime_deadline(timeout);

        loop {
            let received = unsafe {
                libc::mq_timedreceive(
                    self.mqd,
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.len(),
                    std::ptr::null_mut(),
                    &deadline,
                )
            };
            if received >= 0 {
                return CacheRequest::from_bytes(&buf[..received as usize]).map(Some);
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(None),
                _ => {
                    return Err(Error::Os {
                        op: "mq_timedreceive",
                        name: self.name.clone(),
                        source: err,
                    })
                }
            }
        }
    }
}

impl Drop for MessageQueue {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
        }
        if self.owns_name {
            let _ = Self::unlink(&self.name);
        }
    }
}

/// POSIX 메시지 큐 송신자
///
/// 전송마다 큐를 열고 닫는다. 캐시 프로세스가 재시작되어도 다음 요청부터 연결된다.
#[derive(Debug, Clone)]
pub struct MqSender {
    name: CString,
    display: String,
}

impl MqSender {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Self {
            name: c_name(name)?,
            display: name.to_string(),
        })
    }
}

impl RequestSender for MqSender {
    fn send(&self, request: &CacheRequest) -> Result<()> {
        let bytes = request.to_bytes()?;

        let mqd = unsafe { libc::mq_open(self.name.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
        if mqd == -1 {
            return Err(Error::ChannelUnavailable(format!(
                "{}: {}",
                self.display,
                io::Error::last_os_error()
            )));
        }

        let sent = unsafe {
            libc::mq_send(mqd, bytes.as_ptr() as *const libc::c_char, bytes.len(), 0)
        };
        let result = if sent == 0 {
            Ok(())
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                Err(Error::ChannelFull)
            } else {
                Err(Error::ChannelUnavailable(format!("{}: {}", self.display, err)))
            }
        };

        unsafe {
            libc::mq_close(mqd);
        }
        result
    }
}

/// 프로세스 내 요청 송신자
#[derive(Debug, Clone)]
pub struct LocalSender {
    tx: crossbeam_channel::Sender<Vec<u8>>,
}

/// 프로세스 내 요청 수신자
#[derive(Debug, Clone)]
pub struct LocalReceiver {
    rx: crossbeam_channel::Receiver<Vec<u8>>,
}

/// 용량 `capacity`의 프로세스 내 요청 채널 생성
///
/// 메시지는 POSIX 큐와 동일하게 인코딩된 바이트로 전달된다.
pub fn local_channel(capacity: usize) -> (LocalSender, LocalReceiver) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    (LocalSender { tx }, LocalReceiver { rx })
}

impl RequestSender for LocalSender {
    fn send(&self, request: &CacheRequest) -> Result<()> {
        let bytes = request.to_bytes()?;
        self.tx.try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => Error::ChannelFull,
            TrySendError::Disconnected(_) => {
                Error::ChannelUnavailable("로컬 채널 수신측 종료".into())
            }
        })
    }
}

impl RequestReceiver for LocalReceiver {
    fn receive(&self, timeout: Duration) -> Result<Option<CacheRequest>> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => CacheRequest::from_bytes(&bytes).map(Some),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::ChannelUnavailable("로컬 채널 송신측 종료".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::unique_name;

    fn request(path: &str) -> CacheRequest {
        CacheRequest::new(path, "/seg_0", 1024, 1).unwrap()
    }

    #[test]
    fn test_local_channel_roundtrip() {
        let (tx, rx) = local_channel(4);
        tx.send(&request("/a")).unwrap();
        tx.send(&request("/b")).unwrap();

        let timeout = Duration::from_millis(50);
        assert_eq!(rx.receive(timeout).unwrap().unwrap().path, "/a");
        assert_eq!(rx.receive(timeout).unwrap().unwrap().path, "/b");
        assert!(rx.receive(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_local_channel_full_is_rejected() {
        let (tx, _rx) = local_channel(1);
        tx.send(&request("/a")).unwrap();
        assert!(matches!(tx.send(&request("/b")), Err(Error::ChannelFull)));
    }

    #[test]
    fn test_local_channel_disconnected() {
        let (tx, rx) = local_channel(1);
        drop(rx);
        assert!(matches!(
            tx.send(&request("/a")),
            Err(Error::ChannelUnavailable(_))
        ));
    }

    #[test]
    fn test_mq_sender_without_queue_is_unavailable() {
        let sender = MqSender::new(&unique_name("mq_absent")).unwrap();
        assert!(matches!(
            sender.send(&request("/a")),
            Err(Error::ChannelUnavailable(_))
        ));
    }

    #[test]
    fn test_message_queue_roundtrip() {
        let name = unique_name("mq");
        let queue = MessageQueue::create(&name, 4).unwrap();
        let sender = MqSender::new(&name).unwrap();

        sender.send(&request("/courses/file.txt")).unwrap();
        let received = queue.receive(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(received.path, "/courses/file.txt");
        assert!(queue.receive(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn test_message_queue_create_refuses_existing() {
        let name = unique_name("mq_dup");
        let first = MessageQueue::create(&name, 4).unwrap();
        let err = MessageQueue::create(&name, 4).unwrap_err();
        assert!(err.is_already_exists());

        // 기존 큐는 계속 동작
        MqSender::new(&name)
            .unwrap()
            .send(&request("/still/here"))
            .unwrap();
        let received = first.receive(Duration::from_millis(200)).unwrap().unwrap();
        assert_eq!(received.path, "/still/here");

        // 명시적으로 지운 뒤에는 다시 생성 가능
        drop(first);
        MessageQueue::unlink(&name).unwrap();
        assert!(MessageQueue::create(&name, 4).is_ok());
    }
}
