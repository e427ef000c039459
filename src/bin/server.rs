//! shmcache 캐시 서버 (producer)
//!
//! 요청 채널에서 요청을 받아 저장소를 조회하고, 결과를 프록시가 지정한
//! 공유 세그먼트로 청크 단위 전송한다.
//!
//! 사용법:
//!   cargo run --release --bin shmcache-server -- [OPTIONS]
//!
//! 예시:
//!   # 디렉터리 캐시, 워커 16개
//!   cargo run --release --bin shmcache-server -- --cache-dir ./files -t 16
//!
//!   # 인덱스 파일 + 조회 지연 10ms
//!   cargo run --release --bin shmcache-server -- -c locals.txt -d 10000

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use shmcache::storage::Delayed;
use shmcache::{
    CacheWorkerPool, Config, DirectoryStorage, IndexedStorage, MessageQueue, Storage,
    TransferStats, EXIT_CONFIG, EXIT_STARTUP,
};

/// 서버 설정
struct ServerConfig {
    cache_path: PathBuf,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::from("locals.txt"),
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

fn parse_args() -> Result<ServerConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--cache" | "--cache-dir" | "-c" => {
                config.cache_path = PathBuf::from(value(&args, i, flag)?);
                i += 1;
            }
            "--threads" | "-t" => {
                config.config.producer_threads = number(&args, i, flag)?;
                i += 1;
            }
            "--delay" | "-d" => {
                config.config.cache_delay_us = number(&args, i, flag)?;
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
                    r#"shmcache-server - 공유 메모리 캐시 서버

사용법:
  cargo run --release --bin shmcache-server -- [OPTIONS]

옵션:
  -c, --cache <PATH>      캐시 디렉터리 또는 인덱스 파일 (기본: locals.txt)
  -t, --threads <N>       캐시 워커 수 1~100 (기본: 8)
  -d, --delay <US>        조회마다 넣는 지연, 마이크로초 0~2500000 (기본: 0)
  -q, --queue <NAME>      요청 채널 이름 (기본: /cache_mq)
  --namespace <NAME>      세그먼트 이름 접두사 (기본: shmcache)
  --timeout-ms <MS>       신호 대기 타임아웃 (기본: 5000)
  --reclaim               같은 이름으로 남은 요청 채널을 지우고 새로 생성
  -h, --help              이 도움말 출력

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

fn open_storage(path: &Path, delay: Duration) -> shmcache::Result<Arc<dyn Storage>> {
    let inner: Box<dyn Storage> = if path.is_dir() {
        Box::new(DirectoryStorage::new(path)?)
    } else {
        Box::new(IndexedStorage::load(path)?)
    };
    Ok(Arc::new(Delayed::new(inner, delay)))
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

    let server_config = match parse_args() {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{}", msg);
            std::process::exit(EXIT_CONFIG);
        }
    };
    let config = server_config.config;
    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(EXIT_CONFIG);
    }

    info!("shmcache server starting...");
    info!("Cache: {}", server_config.cache_path.display());
    info!("Workers: {}", config.producer_threads);
    info!("Queue: {}", config.channel_name);
    info!("Delay: {} us", config.cache_delay_us);

    let storage = match open_storage(&server_config.cache_path, config.cache_delay()) {
        Ok(s) => s,
        Err(e) => {
            error!("캐시 저장소 열기 실패: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    };

    if config.reclaim_stale {
        if let Err(e) = MessageQueue::unlink(&config.channel_name) {
            error!("남은 요청 채널 정리 실패: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    }
    let queue = match MessageQueue::create(&config.channel_name, config.channel_capacity) {
        Ok(q) => Arc::new(q),
        Err(e) => {
            error!("요청 채널 생성 실패: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    };

    let stats = Arc::new(TransferStats::new());
    let mut workers = match CacheWorkerPool::start(&config, queue, storage, stats.clone()) {
        Ok(w) => w,
        Err(e) => {
            error!("캐시 워커 시작 실패: {}", e);
            std::process::exit(EXIT_STARTUP);
        }
    };

    info!("Waiting for requests...");
    shutdown_signal().await;
    info!("종료 신호 수신, 워커 정리 중...");

    // 워커 합류는 폴링 주기만큼 차단될 수 있음
    // 메시지 큐는 마지막 워커와 함께 drop되며 unlink
    if tokio::task::spawn_blocking(move || workers.shutdown()).await.is_err() {
        error!("워커 정리 중 패닉");
    }

    info!("Stats: {}", stats.summary());
    info!("shmcache server stopped");
}
