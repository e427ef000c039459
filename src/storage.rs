//! 캐시 저장소 조회
//!
//! 경로를 받아 읽을 수 있는 소스와 전체 크기를 돌려준다. 없으면 `None`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{Error, Result};

/// 조회된 파일
pub struct StoredFile {
    /// 전체 크기 (바이트)
    pub size: u64,
    /// 내용 소스
    pub reader: Box<dyn Read + Send>,
}

impl StoredFile {
    /// 로컬 파일 열기
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            size,
            reader: Box::new(file),
        })
    }

    /// 메모리 내용으로 생성
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            size: bytes.len() as u64,
            reader: Box::new(std::io::Cursor::new(bytes)),
        }
    }
}

impl std::fmt::Debug for StoredFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredFile").field("size", &self.size).finish()
    }
}

/// 캐시 저장소
pub trait Storage: Send + Sync {
    /// 경로 조회. 없으면 `Ok(None)`.
    fn lookup(&self, path: &str) -> Result<Option<StoredFile>>;
}

/// 루트 디렉터리 아래 파일을 그대로 제공하는 저장소
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
}

impl DirectoryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::InvalidConfig(format!(
                "캐시 디렉터리가 아님: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    /// 요청 경로를 루트 아래 상대 경로로 변환 (`..` 등은 거부)
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }
}

impl Storage for DirectoryStorage {
    fn lookup(&self, path: &str) -> Result<Option<StoredFile>> {
        let Some(local) = self.resolve(path) else {
            warn!("허용되지 않은 경로 요청: {}", path);
            return Ok(None);
        };
        if !local.is_file() {
            return Ok(None);
        }
        StoredFile::open(&local).map(Some)
    }
}

/// 인덱스 파일(`<요청 경로> <로컬 파일>` 줄 목록) 기반 저장소
///
/// 상대 로컬 경로는 인덱스 파일 위치 기준으로 해석한다.
#[derive(Debug, Clone)]
pub struct IndexedStorage {
    entries: HashMap<String, PathBuf>,
}

impl IndexedStorage {
    /// 인덱스 파일 로드
    pub fn load(index: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(index)?;
        let base = index.parent().unwrap_or_else(|| Path::new("."));
        let storage = Self::parse(&text, base);
        info!(
            "캐시 인덱스 로드: {} ({}개 항목)",
            index.display(),
            storage.len()
        );
        Ok(storage)
    }

    /// 인덱스 본문 파싱. 빈 줄과 `#` 주석은 무시한다.
    pub fn parse(text: &str, base: &Path) -> Self {
        let mut entries = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(key), Some(file)) => {
                    let file = Path::new(file);
                    let local = if file.is_absolute() {
                        file.to_path_buf()
                    } else {
                        base.join(file)
                    };
                    entries.insert(key.to_string(), local);
                }
                _ => debug!("인덱스 {}번째 줄 무시: {:?}", lineno + 1, line),
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Storage for IndexedStorage {
    fn lookup(&self, path: &str) -> Result<Option<StoredFile>> {
        let Some(local) = self.entries.get(path) else {
            return Ok(None);
        };
        match StoredFile::open(local) {
            Ok(file) => Ok(Some(file)),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("인덱스 항목의 파일 없음: {} -> {}", path, local.display());
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// 조회마다 고정 지연을 넣는 래퍼 (백프레셔 테스트용)
#[derive(Debug, Clone)]
pub struct Delayed<S> {
    inner: S,
    delay: Duration,
}

impl<S> Delayed<S> {
    pub fn new(inner: S, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl<S: Storage> Storage for Delayed<S> {
    fn lookup(&self, path: &str) -> Result<Option<StoredFile>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.inner.lookup(path)
    }
}

impl Storage for Box<dyn Storage> {
    fn lookup(&self, path: &str) -> Result<Option<StoredFile>> {
        (**self).lookup(path)
    }
}

/// 메모리 내 저장소
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, content: Vec<u8>) {
        self.files.insert(path.into(), content);
    }
}

impl Storage for MemoryStorage {
    fn lookup(&self, path: &str) -> Result<Option<StoredFile>> {
        Ok(self
            .files
            .get(path)
            .map(|content| StoredFile::from_bytes(content.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn read_all(mut file: StoredFile) -> Vec<u8> {
        let mut buf = Vec::new();
        file.reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, file.size);
        buf
    }

    #[test]
    fn test_directory_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("img")).unwrap();
        std::fs::write(dir.path().join("img/a.jpg"), b"jpeg bytes").unwrap();

        let storage = DirectoryStorage::new(dir.path()).unwrap();
        let found = storage.lookup("/img/a.jpg").unwrap().unwrap();
        assert_eq!(read_all(found), b"jpeg bytes");

        assert!(storage.lookup("/img/missing.jpg").unwrap().is_none());
        assert!(storage.lookup("/img").unwrap().is_none());
    }

    #[test]
    fn test_directory_rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(dir.path().join("secret"), b"nope").unwrap();

        let storage = DirectoryStorage::new(&root).unwrap();
        assert!(storage.lookup("/../secret").unwrap().is_none());
    }

    #[test]
    fn test_indexed_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("yellowstone.jpg"), vec![1u8; 300]).unwrap();
        let index = dir.path().join("locals.txt");
        std::fs::write(
            &index,
            "# cache index\n/courses/yellowstone.jpg yellowstone.jpg\n\n/courses/gone.jpg gone.jpg\nbroken-line\n",
        )
        .unwrap();

        let storage = IndexedStorage::load(&index).unwrap();
        assert_eq!(storage.len(), 2);

        let found = storage.lookup("/courses/yellowstone.jpg").unwrap().unwrap();
        assert_eq!(found.size, 300);
        assert!(storage.lookup("/courses/gone.jpg").unwrap().is_none());
        assert!(storage.lookup("/unknown").unwrap().is_none());
    }

    #[test]
    fn test_delayed_lookup() {
        let mut memory = MemoryStorage::new();
        memory.insert("/a", vec![1, 2, 3]);
        let storage = Delayed::new(memory, Duration::from_millis(30));

        let start = Instant::now();
        let found = storage.lookup("/a").unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(read_all(found), vec![1, 2, 3]);
    }
}
