//! shmcache 프록시 (consumer)
//!
//! GETFILE 요청을 받아 세그먼트를 임대하고, 캐시 서버에 요청을 보낸 뒤
//! 세그먼트로 들어오는 청크를 클라이언트로 중계한다.
//!
//! 사용법:
//!   cargo run --release --bin shmcache-proxy -- [OPTIONS]
//!
//! 예시:
//!   # 세그먼트 8개 x 5712 bytes, 포트 10823
//!   cargo run --release --bin shmcache-proxy -- -n 8 -z 5712 -p 10823
//!
//!   # 프록시 워커 64개
//!   cargo run --release --bin shmcache-proxy -- -t 64

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shmcache::frontend::FrontendWorkers;
use shmcache::{
    CacheProxy, Config, MqSender, SegmentPool, TransferStats, EXIT_CONFIG, EXIT_STARTUP,
};

/// 워커 큐가 가득 찼을 때 재시도 간격
const DISPATCH_BACKOFF: Duration = Duration::from_millis(10);

/// 프록시 설정
struct ProxyConfig {
    bind_addr: SocketAddr,
    config: Config,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 10823)),
            config: Config::default(),
        }
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, String> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값 필요", flag))
}

fn number<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    let raw = value(args, i, flag)?;
    raw.parse()
        .map_err(|_| format!("{}: 유효한 숫자 필요 ({:?})", flag, raw))
}

fn parse_args() -> Result<ProxyConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ProxyConfig::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--segments" | "-n" => {
                config.config.segment_count = number(&args, i, flag)?;
                i += 1;
            }
            "--segment-size" | "-z" => {
                config.config.segment_size = number(&args, i, flag)?;
                i += 1;
            }
            "--port" | "-p" => {
                let port: u16 = number(&args, i, flag)?;
                config.bind_addr.set_port(port);
                i += 1;
            }
            "--bind" | "-b" => {
                let raw = value(&args, i, flag)?;
                config.bind_addr = raw
                    .parse()
                    .map_err(|_| format!("{}: 유효한 주소 필요 ({:?})", flag, raw))?;
                i += 1;
            }
            "--threads" | "-t" => {
                config.config.consumer_threads = number(&args, i, flag)?;
                i += 1;
            }
            "--queue" | "-q" => {
                config.config.channel_name = value(&args, i, flag)?.to_string();
                i += 1;
            }
            "--namespace" => {
                config.config.namespace = value(&args, i, flag)?.to_string();
                i += 1;
            }
            "--timeout-ms" => {
                config.config.wait_timeout_ms = number(&args, i, flag)?;
                i += 1;
            }
            "--reclaim" => {
                config.config.reclaim_stale = true;
            }
            "--help" | "-h" => {
                println!(
                    r#"shmcache-proxy - 공유 메모리 캐시 프록시

사용법:
  cargo run --release --bin shmcache-proxy -- [OPTIONS]

옵션:
  -n, --segments <N>        세그먼트 수 (기본: 8)
  -z, --segment-size <SIZE> 세그먼트 크기 바이트, 824 이상 (기본: 5712)
  -p, --port <PORT>         리슨 포트 (기본: 10823)
  -b, --bind <ADDR>         리슨 주소 (기본: 0.0.0.0:10823)
  -t, --threads <N>         프록시 워커 수 1~200 (기본: 8)
  -q, --queue <NAME>        요청 채널 이름 (기본: /cache_mq)
  --namespace <NAME>        세그먼트 이름 접두사 (기본: shmcache)
  --timeout-ms <MS>         신호 대기 타임아웃 (기본: 5000)
  --reclaim                 같은 이름으로 남은 세그먼트를 지우고 새로 생성
  -h, --help                이 도움말 출력

로그 레벨은 RUST_LOG로 조정 (기본: info)
"#
                );
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 옵션: {}", other)),
        }
        i += 1;
    }

    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                error!("SIGTERM 핸들러 등록 실패: {}", e);
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("로거 설정 실패: {}", e);
    }

    let proxy_config = match parse_args() {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(EXIT_CONFIG);
        }
    };
    let config = proxy_config.config;
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(EXIT_CONFIG);
    }

    info!("shmcache proxy starting...");
    info!("Bind address: {}", proxy_config.bind_addr);
    info!(
        "Segments: {} x {} bytes",
        config.segment_count, config.segment_size
    );
    info!("Workers: {}", config.consumer_threads);
    info!("Queue: {}", config.channel_name);

    let pool = match SegmentPool::from_config(&config) {
        Ok(p) => p,
        Err(e) => {
            error!("세그먼트 풀 생성 실패: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    };
    let sender = match MqSender::new(&config.channel_name) {
        Ok(s) => s,
        Err(e) => {
            error!("요청 채널 설정 실패: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    };

    let stats = Arc::new(TransferStats::new());
    let proxy = Arc::new(CacheProxy::new(pool, Box::new(sender), &config, stats.clone()));

    let listener = match TcpListener::bind(proxy_config.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("리슨 실패 ({}): {}", proxy_config.bind_addr, e);
            std::process::exit(EXIT_STARTUP);
        }
    };

    let mut workers = match FrontendWorkers::start(
        proxy.clone(),
        config.consumer_threads,
        config.consumer_threads * 2,
        config.wait_timeout(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("프록시 워커 시작 실패: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    };

    info!("Listening on {}", proxy_config.bind_addr);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    'accept: loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("종료 신호 수신, 새 연결 차단");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        warn!("accept 실패: {}", e);
                        continue;
                    }
                };
                debug!("연결: {}", peer);

                // 워커는 차단 IO로 처리
                let stream = match stream.into_std().and_then(|s| {
                    s.set_nonblocking(false)?;
                    Ok(s)
                }) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("소켓 변환 실패 ({}): {}", peer, e);
                        continue;
                    }
                };

                // 워커 큐가 가득 차면 accept를 멈추고 재시도. 종료 신호는 계속 감시
                let mut pending = Some(stream);
                while let Some(stream) = pending.take() {
                    match workers.try_dispatch(stream) {
                        Ok(None) => {}
                        Ok(Some(stream)) => {
                            pending = Some(stream);
                            tokio::select! {
                                _ = &mut shutdown => {
                                    info!("종료 신호 수신, 대기 중인 연결 포기: {}", peer);
                                    break 'accept;
                                }
                                _ = tokio::time::sleep(DISPATCH_BACKOFF) => {}
                            }
                        }
                        Err(e) => {
                            error!("연결 전달 실패: {}", e);
                            break 'accept;
                        }
                    }
                }
            }
        }
    }
    drop(listener);

    let grace = config.shutdown_grace();
    let result = tokio::task::spawn_blocking(move || {
        workers.shutdown();
        proxy.shutdown(grace)
    })
    .await;

    match result {
        Ok(Ok(())) => info!("세그먼트 정리 완료"),
        Ok(Err(e)) => warn!("세그먼트 정리: {}", e),
        Err(e) => error!("정리 중 패닉: {}", e),
    }

    info!("Stats: {}", stats.summary());
    info!("shmcache proxy stopped");
}
