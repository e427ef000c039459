//! GETFILE 프론트엔드
//!
//! 요청: `GETFILE GET <path>\r\n\r\n`
//! 응답: `GETFILE OK <size>\r\n\r\n<body>` | `GETFILE FILE_NOT_FOUND\r\n\r\n`
//!       | `GETFILE ERROR\r\n\r\n` | `GETFILE INVALID\r\n\r\n`
//!
//! 연결은 고정 수의 프록시 워커 스레드가 bounded 큐에서 하나씩 꺼내 처리한다.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::proxy::{CacheProxy, ResponseHeader, ResponseSink};
use crate::{Error, Result, MAX_PATH_LEN};

const SCHEME: &str = "GETFILE";
const TERMINATOR: &[u8] = b"\r\n\r\n";

/// 요청 헤더 최대 길이
const MAX_HEADER_LEN: usize = MAX_PATH_LEN + 32;

/// 요청 헤더 파싱. 형식이 틀리면 `None`.
pub fn parse_request(header: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(header).ok()?;
    let line = text.strip_suffix("\r\n\r\n").unwrap_or(text);
    let mut parts = line.split(' ');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(SCHEME), Some("GET"), Some(path), None)
            if path.starts_with('/') && path.len() < MAX_PATH_LEN =>
        {
            Some(path.to_string())
        }
        _ => None,
    }
}

/// `\r\n\r\n`까지 읽기. 종결자 전에 연결이 닫히거나 너무 길면 `None`.
pub fn read_request<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while header.len() < MAX_HEADER_LEN {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                header.push(byte[0]);
                if header.ends_with(TERMINATOR) {
                    return Ok(Some(header));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

/// 응답 헤더 인코딩
pub fn encode_header(header: ResponseHeader) -> BytesMut {
    let mut buf = BytesMut::with_capacity(48);
    buf.put_slice(SCHEME.as_bytes());
    match header {
        ResponseHeader::Ok(size) => {
            buf.put_slice(b" OK ");
            buf.put_slice(size.to_string().as_bytes());
        }
        ResponseHeader::FileNotFound => buf.put_slice(b" FILE_NOT_FOUND"),
        ResponseHeader::Error => buf.put_slice(b" ERROR"),
    }
    buf.put_slice(TERMINATOR);
    buf
}

/// GETFILE 응답 sink
pub struct GetFileSink<W: Write> {
    writer: W,
    header_sent: bool,
}

impl<W: Write> GetFileSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_sent: false,
        }
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ResponseSink for GetFileSink<W> {
    fn send_header(&mut self, header: ResponseHeader) -> io::Result<()> {
        self.writer.write_all(&encode_header(header))?;
        self.header_sent = true;
        self.writer.flush()
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)
    }
}

/// 연결 하나 처리
pub fn handle_connection<S: Read + Write>(mut stream: S, proxy: &CacheProxy) -> Result<u64> {
    let Some(header) = read_request(&mut stream)? else {
        debug!("요청 헤더 없이 연결 종료");
        return Ok(0);
    };

    let Some(path) = parse_request(&header) else {
        warn!("잘못된 GETFILE 요청: {:?}", String::from_utf8_lossy(&header));
        stream.write_all(b"GETFILE INVALID\r\n\r\n")?;
        return Ok(0);
    };

    let mut sink = GetFileSink::new(stream);
    match proxy.handle(&path, &mut sink) {
        Ok(sent) => {
            sink.writer.flush()?;
            Ok(sent)
        }
        Err(e) => {
            if !sink.header_sent() {
                // 클라이언트에 실패를 알리는 것까지 실패하면 무시
                let _ = sink.send_header(ResponseHeader::Error);
            }
            Err(e)
        }
    }
}

/// 프록시 워커 스레드 집합
pub struct FrontendWorkers {
    queue: Option<Sender<TcpStream>>,
    handles: Vec<JoinHandle<()>>,
}

impl FrontendWorkers {
    /// 워커 `threads`개 시작. 큐는 `queue_capacity`개까지 연결을 보관한다.
    pub fn start(
        proxy: Arc<CacheProxy>,
        threads: usize,
        queue_capacity: usize,
        io_timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<TcpStream>(queue_capacity.max(1));
        let mut workers = Self {
            queue: Some(tx),
            handles: Vec::with_capacity(threads),
        };

        for worker_id in 0..threads {
            let rx = rx.clone();
            let proxy = proxy.clone();
            let handle = thread::Builder::new()
                .name(format!("proxy-worker-{}", worker_id))
                .spawn(move || connection_loop(worker_id, &rx, &proxy, io_timeout));
            match handle {
                Ok(handle) => workers.handles.push(handle),
                Err(e) => {
                    workers.shutdown();
                    return Err(Error::Io(e));
                }
            }
        }

        info!("프록시 워커 {}개 시작", threads);
        Ok(workers)
    }

    /// 연결을 워커 큐에 넣기 (차단 없음)
    ///
    /// 큐가 가득 차면 연결을 `Some`으로 돌려준다. 호출자가 나중에 다시 시도.
    pub fn try_dispatch(&self, stream: TcpStream) -> Result<Option<TcpStream>> {
        let queue = self.queue.as_ref().ok_or(Error::PoolClosed)?;
        match queue.try_send(stream) {
            Ok(()) => Ok(None),
            Err(TrySendError::Full(stream)) => Ok(Some(stream)),
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::ChannelUnavailable("프록시 워커 큐 종료".into()))
            }
        }
    }

    /// 큐를 닫고 남은 연결을 처리한 뒤 워커 합류
    pub fn shutdown(&mut self) {
        self.queue.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("프록시 워커 패닉");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for FrontendWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connection_loop(
    worker_id: usize,
    queue: &Receiver<TcpStream>,
    proxy: &CacheProxy,
    io_timeout: Duration,
) {
    for stream in queue.iter() {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".into());
        if let Err(e) = stream
            .set_read_timeout(Some(io_timeout))
            .and_then(|_| stream.set_write_timeout(Some(io_timeout)))
        {
            warn!("소켓 타임아웃 설정 실패 ({}): {}", peer, e);
        }

        match handle_connection(stream, proxy) {
            Ok(sent) => debug!("프록시 워커 {}: {} 완료 ({} bytes)", worker_id, peer, sent),
            Err(e) => debug!("프록시 워커 {}: {} 실패: {}", worker_id, peer, e),
        }
    }
    debug!("프록시 워커 {} 종료", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local_channel;
    use crate::pool::SegmentPool;
    use crate::stats::TransferStats;
    use crate::storage::MemoryStorage;
    use crate::testutil::unique_namespace;
    use crate::worker::CacheWorkerPool;
    use crate::Config;
    use std::io::Cursor;
    use std::net::TcpListener;

    #[test]
    fn test_parse_request() {
        assert_eq!(
            parse_request(b"GETFILE GET /a/b.jpg\r\n\r\n").as_deref(),
            Some("/a/b.jpg")
        );
        assert_eq!(parse_request(b"GETFILE GET a.jpg\r\n\r\n"), None);
        assert_eq!(parse_request(b"GETFILE PUT /a\r\n\r\n"), None);
        assert_eq!(parse_request(b"HTTP GET /a\r\n\r\n"), None);
        assert_eq!(parse_request(b"GETFILE GET /a extra\r\n\r\n"), None);
    }

    #[test]
    fn test_encode_header() {
        assert_eq!(&encode_header(ResponseHeader::Ok(42))[..], b"GETFILE OK 42\r\n\r\n");
        assert_eq!(
            &encode_header(ResponseHeader::FileNotFound)[..],
            b"GETFILE FILE_NOT_FOUND\r\n\r\n"
        );
        assert_eq!(&encode_header(ResponseHeader::Error)[..], b"GETFILE ERROR\r\n\r\n");
    }

    #[test]
    fn test_read_request_stops_at_terminator() {
        let mut input = Cursor::new(b"GETFILE GET /x\r\n\r\ntrailing".to_vec());
        let header = read_request(&mut input).unwrap().unwrap();
        assert_eq!(header, b"GETFILE GET /x\r\n\r\n");

        let mut truncated = Cursor::new(b"GETFILE GET /x\r\n".to_vec());
        assert!(read_request(&mut truncated).unwrap().is_none());
    }

    fn serve(storage: MemoryStorage, tag: &str) -> (Arc<CacheProxy>, CacheWorkerPool) {
        let config = Config::for_testing(unique_namespace(tag));
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
        (Arc::new(proxy), workers)
    }

    fn fetch(addr: std::net::SocketAddr, request: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(request).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        response
    }

    #[test]
    fn test_getfile_over_tcp() {
        let mut storage = MemoryStorage::new();
        storage.insert("/hello.txt", b"hello over shared memory".to_vec());
        let (proxy, _cache) = serve(storage, "fe");

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut workers = FrontendWorkers::start(proxy, 2, 4, Duration::from_secs(2)).unwrap();

        let requests: [&[u8]; 3] = [
            b"GETFILE GET /hello.txt\r\n\r\n",
            b"GETFILE GET /missing\r\n\r\n",
            b"NOPE\r\n\r\n",
        ];
        let client = thread::spawn(move || {
            requests
                .iter()
                .map(|request| fetch(addr, request))
                .collect::<Vec<_>>()
        });
        for _ in 0..3 {
            let (stream, _) = listener.accept().unwrap();
            assert!(workers.try_dispatch(stream).unwrap().is_none());
        }
        let responses = client.join().unwrap();
        workers.shutdown();

        assert_eq!(
            responses[0],
            b"GETFILE OK 24\r\n\r\nhello over shared memory".to_vec()
        );
        assert_eq!(responses[1], b"GETFILE FILE_NOT_FOUND\r\n\r\n".to_vec());
        assert_eq!(responses[2], b"GETFILE INVALID\r\n\r\n".to_vec());
    }

    #[test]
    fn test_try_dispatch_returns_stream_when_full() {
        let config = Config::for_testing(unique_namespace("fefull"));
        let pool = SegmentPool::from_config(&config).unwrap();
        let (tx, _rx) = local_channel(4);
        let proxy = Arc::new(CacheProxy::new(
            pool,
            Box::new(tx),
            &config,
            Arc::new(TransferStats::new()),
        ));
        // 워커 없이 큐 1칸
        let mut workers = FrontendWorkers::start(proxy, 0, 1, Duration::from_secs(1)).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let _first_client = TcpStream::connect(addr).unwrap();
        let _second_client = TcpStream::connect(addr).unwrap();
        let (first, _) = listener.accept().unwrap();
        let (second, _) = listener.accept().unwrap();
        let second_peer = second.peer_addr().unwrap();

        assert!(workers.try_dispatch(first).unwrap().is_none());
        let returned = workers.try_dispatch(second).unwrap().unwrap();
        assert_eq!(returned.peer_addr().unwrap(), second_peer);

        workers.shutdown();
        assert!(matches!(
            workers.try_dispatch(returned),
            Err(Error::PoolClosed)
        ));
    }

    /// 읽기는 Cursor, 쓰기는 Vec로 모으는 가짜 연결
    struct FakeConn {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for FakeConn {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for FakeConn {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failure_before_header_sends_error() {
        // 캐시 워커 없음 → metadata 대기 타임아웃
        let mut config = Config::for_testing(unique_namespace("feerr"));
        config.wait_timeout_ms = 50;
        let pool = SegmentPool::from_config(&config).unwrap();
        let (tx, _rx) = local_channel(4);
        let proxy = CacheProxy::new(pool, Box::new(tx), &config, Arc::new(TransferStats::new()));

        let mut conn = FakeConn {
            input: Cursor::new(b"GETFILE GET /slow\r\n\r\n".to_vec()),
            output: Vec::new(),
        };
        let err = handle_connection(&mut conn, &proxy).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(conn.output, b"GETFILE ERROR\r\n\r\n");
    }
}
