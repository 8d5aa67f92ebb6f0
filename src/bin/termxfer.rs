//! termxfer - 원격 셸 스트림 위의 파일 전송 클라이언트
//!
//! TCP로 연결된 원격 셸의 입출력을 중계하면서
//! ZMODEM(`rz`/`sz`)과 trzsz(`trz`/`tsz`) 전송 요청을 처리한다.
//!
//! 사용법:
//!   cargo run --release --bin termxfer -- [OPTIONS]
//!
//! 예시:
//!   # 받은 파일을 downloads/에 저장
//!   cargo run --release --bin termxfer -- --connect 127.0.0.1:2222 --dir downloads
//!
//!   # 원격의 `rz` 요청에 파일 전송
//!   cargo run --release --bin termxfer -- -c 127.0.0.1:2222 --send a.txt --send b.bin

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;

use bytes::Bytes;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use termxfer::driver::accept_all;
use termxfer::{
    AddonCmd, AddonHandle, Config, DefaultCodec, DirectorySink, DriverOutput, Frame,
    OutgoingFile, OverwritePolicy, Protocol, TransferEvent,
};

/// CLI 설정
struct CliConfig {
    server_addr: SocketAddr,
    download_dir: PathBuf,
    overwrite: bool,
    send_files: Vec<PathBuf>,
    upload: bool,
    config: Config,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 2222)),
            download_dir: PathBuf::from("."),
            overwrite: false,
            send_files: Vec::new(),
            upload: false,
            config: Config::default(),
        }
    }
}

const HELP: &str = r#"termxfer - 터미널 스트림 파일 전송 클라이언트

원격 셸 입출력을 중계하면서 ZMODEM / trzsz 전송을 처리
- rz/sz: 바이너리 헤더 감지
- trz/tsz: 텍스트 마커 감지

사용법:
  cargo run --release --bin termxfer -- [OPTIONS]

옵션:
  -c, --connect <ADDR>      원격 셸 주소 (기본: 127.0.0.1:2222)
  -d, --dir <PATH>          받은 파일 저장 디렉토리 (기본: .)
  -s, --send <PATH>         전송 요청에 보낼 파일 (여러 번 지정 가능)
  -u, --upload              연결 직후 trz로 --send 파일 업로드
  --overwrite               같은 이름 파일 덮어쓰기 (기본: name.N으로 저장)
  --chunk-size <SIZE>       송신 청크 크기 바이트 (기본: 32768)
  --max-download <BYTES>    다운로드 최대 크기, 0이면 제한 없음 (기본: 200MB)
  --no-zmodem               ZMODEM 감지 끄기
  --no-trzsz                trzsz 감지 끄기
  -h, --help                이 도움말 출력

입력은 raw 모드로 그대로 원격에 전달. 전송 중 Ctrl-C는 전송 취소.
"#;

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} 값 필요", flag))
}

fn parse_args() -> Result<CliConfig, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = CliConfig::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--connect" | "-c" => {
                config.server_addr = next_value(&args, &mut i, flag)?
                    .parse()
                    .map_err(|e| format!("유효한 주소 필요: {}", e))?;
            }
            "--dir" | "-d" => config.download_dir = PathBuf::from(next_value(&args, &mut i, flag)?),
            "--send" | "-s" => config.send_files.push(PathBuf::from(next_value(&args, &mut i, flag)?)),
            "--upload" | "-u" => config.upload = true,
            "--overwrite" => config.overwrite = true,
            "--chunk-size" => {
                config.config.chunk_size = next_value(&args, &mut i, flag)?
                    .parse()
                    .map_err(|e| format!("유효한 숫자 필요: {}", e))?;
            }
            "--max-download" => {
                let limit: u64 = next_value(&args, &mut i, flag)?
                    .parse()
                    .map_err(|e| format!("유효한 숫자 필요: {}", e))?;
                config.config.max_download_size = (limit > 0).then_some(limit);
            }
            "--no-zmodem" => config.config.zmodem_enabled = false,
            "--no-trzsz" => config.config.magic_key_enabled = false,
            "--help" | "-h" => {
                println!("{}", HELP);
                std::process::exit(0);
            }
            other => return Err(format!("알 수 없는 옵션: {}", other)),
        }
        i += 1;
    }

    Ok(config)
}

/// 터미널 raw 모드. drop 시 복원.
///
/// Ctrl-C가 SIGINT가 아니라 0x03 바이트로 들어와야 전송을 취소할 수 있다.
struct RawModeGuard;

impl RawModeGuard {
    /// 표준 입력이 터미널이 아니면 `None`
    fn enter() -> std::io::Result<Option<Self>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        enable_raw_mode()?;
        debug!("entered raw terminal mode");
        Ok(Some(Self))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        match disable_raw_mode() {
            Ok(()) => debug!("restored terminal mode"),
            Err(e) => warn!("failed to restore terminal mode: {}", e),
        }
    }
}

fn load_files(paths: &[PathBuf]) -> termxfer::Result<Vec<OutgoingFile>> {
    paths.iter().map(OutgoingFile::from_path).collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정 (터미널 출력과 섞이지 않게 stderr)
    let builder = FmtSubscriber::builder().with_writer(std::io::stderr);
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )?;
    } else {
        tracing::subscriber::set_global_default(builder.with_max_level(Level::INFO).finish())?;
    }

    let cli = parse_args()?;
    cli.config.validate()?;
    let files = load_files(&cli.send_files)?;
    let policy = if cli.overwrite {
        OverwritePolicy::Overwrite
    } else {
        OverwritePolicy::Rename
    };
    let sink = DirectorySink::new(&cli.download_dir, policy)?;

    info!("termxfer starting...");
    info!("Remote shell: {}", cli.server_addr);
    info!("Download directory: {}", sink.dir().display());
    info!("Files to send: {}", files.len());

    let stream = TcpStream::connect(cli.server_addr).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    info!("Connected to {}", cli.server_addr);

    let raw_mode = RawModeGuard::enter()?;

    let (handle, mut outputs) =
        AddonHandle::spawn(cli.config.clone(), Box::new(DefaultCodec), accept_all())?;

    // ─────────────────────────────────────────────────────────────────
    // 소켓 수신 태스크
    // ─────────────────────────────────────────────────────────────────
    let commands = handle.commands();
    let _socket_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let frame = Frame::Binary(Bytes::copy_from_slice(&buf[..n]));
                    if commands.send(AddonCmd::Frame(frame)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("socket read failed: {}", e);
                    break;
                }
            }
        }
        let _ = commands.send(AddonCmd::ChannelClosed);
    });

    // ─────────────────────────────────────────────────────────────────
    // 표준 입력 태스크
    // ─────────────────────────────────────────────────────────────────
    let commands = handle.commands();
    let _stdin_task = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; 4096];
        while let Ok(n) = stdin.read(&mut buf).await {
            if n == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&buf[..n]).into_owned();
            if commands.send(AddonCmd::Input(text)).is_err() {
                break;
            }
        }
    });

    let mut upload_pending = cli.upload;
    if upload_pending {
        handle.upload_files(files.clone())?;
    }

    // ─────────────────────────────────────────────────────────────────
    // 드라이버 출력 처리
    // ─────────────────────────────────────────────────────────────────
    let mut stdout = tokio::io::stdout();
    while let Some(output) = outputs.recv().await {
        match output {
            DriverOutput::Terminal(data) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            DriverOutput::Frame(frame) => {
                let bytes = match frame {
                    Frame::Text(text) => Bytes::from(text),
                    Frame::Binary(bytes) => bytes,
                };
                if let Err(e) = writer.write_all(&bytes).await {
                    warn!("socket write failed: {}", e);
                    let _ = handle.channel_closed();
                }
            }
            DriverOutput::InputEnabled(enabled) => debug!("input enabled: {}", enabled),
            DriverOutput::Event(event) => match event {
                TransferEvent::SendRequested { protocol } => {
                    info!("{:?} send requested", protocol);
                    if upload_pending && protocol == Protocol::Trzsz {
                        // 업로드 시작 시 파일이 이미 전달됨
                        upload_pending = false;
                    } else if files.is_empty() {
                        warn!("no files given with --send, cancelling");
                        handle.cancel()?;
                    } else {
                        handle.send_files(files.clone())?;
                    }
                }
                TransferEvent::FileReceived { descriptor, payload } => {
                    if let Err(e) = sink.save_async(&descriptor, &payload).await {
                        warn!("failed to save {}: {}", descriptor.name, e);
                    }
                }
                TransferEvent::FileSent { name, size } => info!("sent {} ({} bytes)", name, size),
                TransferEvent::FileSkipped { name } => info!("skipped {}", name),
                TransferEvent::LimitExceeded { name, size, limit } => {
                    warn!("{} exceeds limit ({} > {} bytes)", name, size, limit)
                }
                TransferEvent::SessionEnded { state, message } => {
                    info!("session ended ({:?}): {}", state, message)
                }
                TransferEvent::Notice(message) => warn!("{}", message),
                TransferEvent::Progress(_) => {}
            },
        }
    }

    // exit는 drop을 실행하지 않으므로 먼저 복원
    drop(raw_mode);
    info!("{}", handle.stats().summary());
    // 표준 입력 읽기가 런타임 종료를 막지 않게 바로 종료
    std::process::exit(0)
}
