//! tokio 드라이버
//!
//! `Addon`을 하나의 태스크에서 소유하고, 명령 큐로 구동한다.
//! 파일 청크 읽기와 타이머는 별도 태스크에서 끝난 뒤 같은 큐로 돌아온다.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use crate::addon::{Addon, Host};
use crate::config::Config;
use crate::message::{Frame, MessageCodec};
use crate::session::{ChunkRequest, Decision, Detection, OutgoingFile, Timer, TransferEvent};
use crate::stats::TransferStats;
use crate::{Error, Result};

/// 드라이버 명령
#[derive(Debug)]
pub enum AddonCmd {
    /// 채널에서 받은 프레임
    Frame(Frame),
    /// 사용자 키 입력
    Input(String),
    /// 사용자 바이너리 입력
    Binary(Bytes),
    Resize { cols: u16, rows: u16 },
    SendFiles(Vec<OutgoingFile>),
    UploadFiles(Vec<OutgoingFile>),
    Cancel,
    ChunkRead {
        request_id: u64,
        result: std::io::Result<Bytes>,
    },
    Timer(Timer),
    ChannelClosed,
    Stop,
}

/// 드라이버 출력
#[derive(Debug)]
pub enum DriverOutput {
    Terminal(Bytes),
    Frame(Frame),
    InputEnabled(bool),
    Event(TransferEvent),
}

/// 감지 결정 함수
pub type DetectFn = Box<dyn FnMut(&Detection) -> Decision + Send>;

/// 모두 수락
pub fn accept_all() -> DetectFn {
    Box::new(|_| Decision::Accept)
}

/// mpsc 채널 기반 Host
struct ChannelHost {
    output: mpsc::UnboundedSender<DriverOutput>,
    commands: mpsc::UnboundedSender<AddonCmd>,
    decide: DetectFn,
    input_enabled: Arc<AtomicBool>,
}

impl ChannelHost {
    fn emit(&self, output: DriverOutput) {
        if self.output.send(output).is_err() {
            debug!("driver output receiver dropped");
        }
    }
}

impl Host for ChannelHost {
    fn write_terminal(&mut self, data: Bytes) {
        self.emit(DriverOutput::Terminal(data));
    }

    fn send_frame(&mut self, frame: Frame) {
        self.emit(DriverOutput::Frame(frame));
    }

    fn set_input_enabled(&mut self, enabled: bool) {
        self.input_enabled.store(enabled, Ordering::Relaxed);
        self.emit(DriverOutput::InputEnabled(enabled));
    }

    fn read_chunk(&mut self, request: ChunkRequest) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = request
                .source
                .read_chunk_async(request.offset, request.len)
                .await;
            let _ = commands.send(AddonCmd::ChunkRead {
                request_id: request.id,
                result,
            });
        });
    }

    fn schedule(&mut self, delay: Duration, timer: Timer) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(AddonCmd::Timer(timer));
        });
    }

    fn on_detect(&mut self, detection: &Detection) -> Decision {
        (self.decide)(detection)
    }

    fn on_event(&mut self, event: TransferEvent) {
        self.emit(DriverOutput::Event(event));
    }
}

/// 실행 중인 드라이버 핸들
pub struct AddonHandle {
    commands: mpsc::UnboundedSender<AddonCmd>,
    stats: Arc<RwLock<TransferStats>>,
    running: Arc<AtomicBool>,
    input_enabled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl AddonHandle {
    /// 드라이버 태스크 시작. 출력 수신자를 함께 반환한다.
    pub fn spawn(
        config: Config,
        codec: Box<dyn MessageCodec>,
        decide: DetectFn,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DriverOutput>)> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let input_enabled = Arc::new(AtomicBool::new(true));

        let host = ChannelHost {
            output: out_tx,
            commands: cmd_tx.clone(),
            decide,
            input_enabled: input_enabled.clone(),
        };
        let heartbeat = config.heartbeat_interval_ms;
        let addon = Addon::new(config, codec, host)?;

        let stats = Arc::new(RwLock::new(TransferStats::default()));
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run(
            addon,
            cmd_rx,
            heartbeat,
            stats.clone(),
            running.clone(),
        ));

        Ok((
            Self {
                commands: cmd_tx,
                stats,
                running,
                input_enabled,
                task,
            },
            out_rx,
        ))
    }

    /// 다른 태스크에서 쓸 명령 송신자
    pub fn commands(&self) -> mpsc::UnboundedSender<AddonCmd> {
        self.commands.clone()
    }

    pub fn send(&self, cmd: AddonCmd) -> Result<()> {
        self.commands.send(cmd).map_err(|_| Error::ConnectionClosed)
    }

    pub fn frame(&self, frame: Frame) -> Result<()> {
        self.send(AddonCmd::Frame(frame))
    }

    pub fn input(&self, data: impl Into<String>) -> Result<()> {
        self.send(AddonCmd::Input(data.into()))
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.send(AddonCmd::Resize { cols, rows })
    }

    pub fn send_files(&self, files: Vec<OutgoingFile>) -> Result<()> {
        self.send(AddonCmd::SendFiles(files))
    }

    pub fn upload_files(&self, files: Vec<OutgoingFile>) -> Result<()> {
        self.send(AddonCmd::UploadFiles(files))
    }

    pub fn cancel(&self) -> Result<()> {
        self.send(AddonCmd::Cancel)
    }

    pub fn channel_closed(&self) -> Result<()> {
        self.send(AddonCmd::ChannelClosed)
    }

    /// 통계 스냅샷
    pub fn stats(&self) -> TransferStats {
        self.stats.read().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled.load(Ordering::Relaxed)
    }

    /// 정지 후 태스크 종료 대기
    pub async fn shutdown(self) {
        let _ = self.commands.send(AddonCmd::Stop);
        if let Err(e) = self.task.await {
            warn!("driver task failed: {}", e);
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run<H: Host>(
    mut addon: Addon<H>,
    mut commands: mpsc::UnboundedReceiver<AddonCmd>,
    heartbeat_ms: u64,
    stats: Arc<RwLock<TransferStats>>,
    running: Arc<AtomicBool>,
) {
    let mut heartbeat = (heartbeat_ms > 0).then(|| {
        let period = Duration::from_millis(heartbeat_ms);
        tokio::time::interval_at(Instant::now() + period, period)
    });
    info!("driver started");

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                if matches!(cmd, AddonCmd::Stop) {
                    break;
                }
                handle(&mut addon, cmd);
            }
            _ = tick(&mut heartbeat) => addon.heartbeat(),
        }

        *stats.write() = addon.stats().clone();
        if addon.is_disposed() {
            break;
        }
    }

    addon.dispose();
    *stats.write() = addon.stats().clone();
    running.store(false, Ordering::Relaxed);
    info!("driver stopped: {}", addon.stats().summary());
}

fn handle<H: Host>(addon: &mut Addon<H>, cmd: AddonCmd) {
    let result = match cmd {
        AddonCmd::Frame(frame) => {
            addon.on_channel_frame(frame);
            Ok(())
        }
        AddonCmd::Input(data) => {
            addon.on_terminal_data(&data);
            Ok(())
        }
        AddonCmd::Binary(data) => {
            addon.on_terminal_binary(data);
            Ok(())
        }
        AddonCmd::Resize { cols, rows } => {
            addon.on_resize(cols, rows);
            Ok(())
        }
        AddonCmd::SendFiles(files) => addon.send_files(files),
        AddonCmd::UploadFiles(files) => addon.upload_files(files),
        AddonCmd::Cancel => {
            addon.cancel();
            Ok(())
        }
        AddonCmd::ChunkRead { request_id, result } => {
            addon.on_chunk_read(request_id, result);
            Ok(())
        }
        AddonCmd::Timer(timer) => {
            addon.on_timer(timer);
            Ok(())
        }
        AddonCmd::ChannelClosed => {
            addon.on_channel_closed();
            Ok(())
        }
        AddonCmd::Stop => Ok(()),
    };

    if let Err(e) = result {
        warn!("command failed: {}", e);
        addon
            .host_mut()
            .on_event(TransferEvent::Notice(e.to_string()));
    }
}
