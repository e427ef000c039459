//! POSIX 공유 메모리 / 이름있는 세마포어 래퍼
//!
//! - `SharedRegion`: `shm_open` + `ftruncate` + `mmap(MAP_SHARED)`
//! - `NamedSemaphore`: `sem_open` 기반 프로세스 간 카운팅 세마포어
//!
//! 두 타입 모두 생성한 쪽(owner)이 drop 시 이름을 unlink 한다.
//! attach/open 한 쪽은 매핑/핸들만 닫는다.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr::NonNull;
use std::time::Duration;

use crate::{Error, Result};

/// IPC 이름을 C 문자열로 변환
pub(crate) fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidSegment {
        segment_id: name.replace('\0', "\\0"),
        reason: "이름에 NUL 포함".into(),
    })
}

/// 이름있는 공유 메모리 영역
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    /// 매핑 유지용 fd
    #[allow(dead_code)]
    file: File,
    name: String,
    owns_name: bool,
}

// SAFETY: 매핑은 SharedRegion 수명 동안 유효하며, 내용 접근 규칙은
// 상위 프로토콜(헤더 atomics + 세마포어 턴)이 보장한다.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// 새 영역 생성 (0으로 초기화됨)
    ///
    /// 같은 이름의 객체가 이미 있으면 `AlreadyExists`로 실패한다.
    pub fn create(name: &str, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidSegment {
                segment_id: name.to_string(),
                reason: "크기는 0보다 커야 함".into(),
            });
        }
        let c = c_name(name)?;

        let fd = unsafe {
            libc::shm_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(Error::last_os("shm_open", name));
        }
        // SAFETY: fd는 방금 열렸고 다른 곳에서 소유하지 않음
        let file = unsafe { File::from_raw_fd(fd) };

        let region = file
            .set_len(len as u64)
            .map_err(|source| Error::Os {
                op: "ftruncate",
                name: name.to_string(),
                source,
            })
            .and_then(|_| Self::map(file, name, len, true));

        if region.is_err() {
            unsafe {
                libc::shm_unlink(c.as_ptr());
            }
        }
        region
    }

    /// 기존 영역에 연결
    ///
    /// 실제 객체 크기가 `len`보다 작으면 실패한다.
    pub fn attach(name: &str, len: usize) -> Result<Self> {
        let c = c_name(name)?;
        let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_RDWR, 0 as libc::mode_t) };
        if fd < 0 {
            return Err(Error::last_os("shm_open", name));
        }
        // SAFETY: fd는 방금 열렸고 다른 곳에서 소유하지 않음
        let file = unsafe { File::from_raw_fd(fd) };

        let actual = file
            .metadata()
            .map_err(|source| Error::Os {
                op: "fstat",
                name: name.to_string(),
                source,
            })?
            .len() as usize;
        if len == 0 || actual < len {
            return Err(Error::InvalidSegment {
                segment_id: name.to_string(),
                reason: format!("크기 불일치: 요청 {} bytes, 실제 {} bytes", len, actual),
            });
        }

        Self::map(file, name, len, false)
    }

    fn map(file: File, name: &str, len: usize, owns_name: bool) -> Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os("mmap", name));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| Error::InvalidSegment {
            segment_id: name.to_string(),
            reason: "mmap이 null 반환".into(),
        })?;

        Ok(Self {
            ptr,
            len,
            file,
            name: name.to_string(),
            owns_name,
        })
    }

    /// 매핑 시작 주소
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// 매핑 크기
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 객체 이름
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 이름만 즉시 제거 (매핑은 drop 시점까지 유지)
    pub fn unlink(name: &str) -> Result<()> {
        let c = c_name(name)?;
        if unsafe { libc::shm_unlink(c.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Os {
                    op: "shm_unlink",
                    name: name.to_string(),
                    source: err,
                });
            }
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
        if self.owns_name {
            let _ = Self::unlink(&self.name);
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .field("owns_name", &self.owns_name)
            .finish()
    }
}

/// 이름있는 POSIX 세마포어 (초기값 0)
pub struct NamedSemaphore {
    sem: NonNull<libc::sem_t>,
    name: String,
    owns_name: bool,
}

// SAFETY: sem_post / sem_timedwait / sem_trywait 는 스레드 안전
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// 새 세마포어 생성 (값 0). 같은 이름이 이미 있으면 실패.
    pub fn create(name: &str) -> Result<Self> {
        let c = c_name(name)?;
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        Self::from_raw(sem, name, true)
    }

    /// 기존 세마포어 열기
    pub fn open(name: &str) -> Result<Self> {
        let c = c_name(name)?;
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        Self::from_raw(sem, name, false)
    }

    fn from_raw(sem: *mut libc::sem_t, name: &str, owns_name: bool) -> Result<Self> {
        if sem == libc::SEM_FAILED {
            return Err(Error::last_os("sem_open", name));
        }
        let sem = NonNull::new(sem).ok_or_else(|| Error::last_os("sem_open", name))?;
        Ok(Self {
            sem,
            name: name.to_string(),
            owns_name,
        })
    }

    /// 세마포어 이름
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 신호 (count + 1)
    pub fn post(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } < 0 {
            return Err(Error::last_os("sem_post", &self.name));
        }
        Ok(())
    }

    /// 최대 `timeout` 동안 대기
    ///
    /// 신호를 받으면 `Ok(true)`, 타임아웃이면 `Ok(false)`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool> {
        let deadline = realtime_deadline(timeout);
        loop {
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Ok(false),
                _ => {
                    return Err(Error::Os {
                        op: "sem_timedwait",
                        name: self.name.clone(),
                        source: err,
                    })
                }
            }
        }
    }

    /// 비차단 대기
    pub fn try_wait(&self) -> bool {
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return true;
            }
            if io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                return false;
            }
        }
    }

    /// 남은 신호를 모두 소비하고 소비한 수 반환
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        while self.try_wait() {
            drained += 1;
        }
        drained
    }

    /// 이름만 제거
    pub fn unlink(name: &str) -> Result<()> {
        let c = c_name(name)?;
        if unsafe { libc::sem_unlink(c.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                return Err(Error::Os {
                    op: "sem_unlink",
                    name: name.to_string(),
                    source: err,
                });
            }
        }
        Ok(())
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
        if self.owns_name {
            let _ = Self::unlink(&self.name);
        }
    }
}

impl std::fmt::Debug for NamedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedSemaphore")
            .field("name", &self.name)
            .field("owns_name", &self.owns_name)
            .finish()
    }
}

/// 현재 CLOCK_REALTIME + timeout 절대 시각
pub(crate) fn realtime_deadline(timeout: Duration) -> libc::timespec {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
    }

    let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    let secs = (now.tv_sec as i64)
        .saturating_add(timeout.as_secs().min(i64::MAX as u64 / 2) as i64)
        .saturating_add(nanos / 1_000_000_000);

    let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
    deadline.tv_sec = secs as libc::time_t;
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;
    deadline
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::unique_name;

    #[test]
    fn test_region_create_and_attach_share_bytes() {
        let name = unique_name("rgn");
        let owner = SharedRegion::create(&name, 4096).unwrap();
        let peer = SharedRegion::attach(&name, 4096).unwrap();

        unsafe {
            *owner.as_ptr().add(100) = 0xAB;
            assert_eq!(*peer.as_ptr().add(100), 0xAB);
            // 새 영역은 0으로 초기화
            assert_eq!(*peer.as_ptr().add(101), 0);
        }
    }

    #[test]
    fn test_region_attach_rejects_larger_size() {
        let name = unique_name("rgn_sz");
        let _owner = SharedRegion::create(&name, 1024).unwrap();
        assert!(matches!(
            SharedRegion::attach(&name, 4096),
            Err(Error::InvalidSegment { .. })
        ));
    }

    #[test]
    fn test_region_unlinked_on_owner_drop() {
        let name = unique_name("rgn_drop");
        drop(SharedRegion::create(&name, 1024).unwrap());
        assert!(SharedRegion::attach(&name, 1024).is_err());
    }

    #[test]
    fn test_create_refuses_existing_name() {
        let name = unique_name("rgn_dup");
        let owner = SharedRegion::create(&name, 1024).unwrap();
        let err = SharedRegion::create(&name, 1024).unwrap_err();
        assert!(err.is_already_exists());

        // 기존 소유자의 객체는 그대로 남아있음
        let peer = SharedRegion::attach(&name, 1024).unwrap();
        unsafe {
            *owner.as_ptr() = 7;
            assert_eq!(*peer.as_ptr(), 7);
        }

        let sem_name = unique_name("sem_dup");
        let _sem = NamedSemaphore::create(&sem_name).unwrap();
        assert!(NamedSemaphore::create(&sem_name)
            .unwrap_err()
            .is_already_exists());
    }

    #[test]
    fn test_semaphore_post_and_wait() {
        let name = unique_name("sem");
        let owner = NamedSemaphore::create(&name).unwrap();
        let peer = NamedSemaphore::open(&name).unwrap();

        assert!(!owner.try_wait());
        peer.post().unwrap();
        assert!(owner.wait_timeout(Duration::from_millis(100)).unwrap());
        assert!(!owner.wait_timeout(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn test_semaphore_drain() {
        let name = unique_name("sem_drain");
        let sem = NamedSemaphore::create(&name).unwrap();
        sem.post().unwrap();
        sem.post().unwrap();
        sem.post().unwrap();
        assert_eq!(sem.drain(), 3);
        assert!(!sem.try_wait());
    }
}
