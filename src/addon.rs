//! 스트림 멀티플렉서 (Addon)
//!
//! 채널 입력을 전송 엔진 또는 터미널로, 터미널 입력을 채널 또는 엔진으로 보낸다.
//! I/O는 주입된 `Host`를 통해서만 수행한다.
//!
//! 채널 입력 우선순위:
//! 1. 진행 중인 ZMODEM 세션
//! 2. 텍스트 마커 필터 (진행 중인 세션 포함)
//! 3. 바이너리 Sentry
//! 4. 터미널

use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::magic_session::MagicFilter;
use crate::message::{ChannelMessage, Frame, Inbound, MessageCodec};
use crate::sentry::Sentry;
use crate::session::{
    Action, ChunkRequest, Decision, Detection, Outbox, OutgoingFile, SessionState, Timer,
    TransferEvent,
};
use crate::stats::TransferStats;
use crate::{Error, Result};

/// 인터럽트 키 (Ctrl-C)
const INTERRUPT: char = '\x03';

/// 멀티플렉서가 사용하는 외부 기능
pub trait Host {
    /// 터미널 렌더러에 쓴다
    fn write_terminal(&mut self, data: Bytes);

    /// 채널로 프레임 하나를 보낸다
    fn send_frame(&mut self, frame: Frame);

    /// 사용자 입력 허용/차단
    fn set_input_enabled(&mut self, _enabled: bool) {}

    /// 파일 청크 읽기 요청. 완료되면 `Addon::on_chunk_read` 호출.
    fn read_chunk(&mut self, request: ChunkRequest);

    /// 타이머 예약. 만료되면 `Addon::on_timer` 호출.
    fn schedule(&mut self, _delay: Duration, _timer: Timer) {}

    /// 전송 요청 감지 시 수락 여부
    fn on_detect(&mut self, detection: &Detection) -> Decision;

    fn on_event(&mut self, event: TransferEvent);
}

/// 스트림 멀티플렉서
pub struct Addon<H: Host> {
    codec: Box<dyn MessageCodec>,
    host: H,
    sentry: Option<Sentry>,
    magic: Option<MagicFilter>,
    stats: TransferStats,
    input_enabled: bool,
    disposed: bool,
}

impl<H: Host> Addon<H> {
    pub fn new(config: Config, codec: Box<dyn MessageCodec>, host: H) -> Result<Self> {
        config.validate()?;
        let sentry = config.zmodem_enabled.then(|| Sentry::new(config.clone()));
        let magic = config
            .magic_key_enabled
            .then(|| MagicFilter::new(config.clone(), cfg!(windows)));

        info!(
            "addon created (zmodem: {}, magic key: {})",
            sentry.is_some(),
            magic.is_some()
        );
        Ok(Self {
            codec,
            host,
            sentry,
            magic,
            stats: TransferStats::default(),
            input_enabled: true,
            disposed: false,
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// 전송 세션이 채널을 점유 중인지
    pub fn is_active(&self) -> bool {
        self.sentry.as_ref().is_some_and(|s| s.is_active())
            || self.magic.as_ref().is_some_and(|m| m.is_transferring())
    }

    /// 채널에서 받은 프레임
    pub fn on_channel_frame(&mut self, frame: Frame) {
        if self.disposed {
            return;
        }
        match self.codec.decode(frame) {
            Ok(Inbound::Data(data)) => self.on_channel_data(&data),
            Ok(Inbound::Exit { code, message }) => {
                info!("remote exited (code: {:?}): {}", code, message);
                self.host
                    .write_terminal(Bytes::from(format!("\r\n{}\r\n", message)));
            }
            Ok(Inbound::Ignore) => {}
            Err(e) => warn!("failed to decode channel frame: {}", e),
        }
    }

    /// 채널에서 받은 바이트
    pub fn on_channel_data(&mut self, data: &[u8]) {
        if self.disposed {
            return;
        }
        let mut out = Outbox::new();
        let host = &mut self.host;

        if let Some(sentry) = self.sentry.as_mut().filter(|s| s.is_active()) {
            sentry.consume(data, |d| host.on_detect(d), &mut out);
        } else {
            let rest = match self.magic.as_mut() {
                Some(magic) => magic.consume(data, |d| host.on_detect(d), &mut out),
                None => Some(data.to_vec()),
            };
            if let Some(rest) = rest {
                match self.sentry.as_mut() {
                    Some(sentry) => sentry.consume(&rest, |d| host.on_detect(d), &mut out),
                    None => out.push(Action::ToTerminal(Bytes::from(rest))),
                }
            }
        }
        self.dispatch(out);
    }

    /// 사용자 키 입력
    pub fn on_terminal_data(&mut self, data: &str) {
        if self.disposed {
            return;
        }
        if self.is_active() {
            if data.contains(INTERRUPT) {
                info!("interrupt from user");
                self.cancel();
            } else {
                debug!("dropping {} bytes of input during transfer", data.len());
            }
            return;
        }
        self.send_message(ChannelMessage::Data(data.to_string()));
    }

    /// 사용자 바이너리 입력 (마우스 보고 등)
    pub fn on_terminal_binary(&mut self, data: Bytes) {
        if self.disposed || self.is_active() {
            return;
        }
        self.send_message(ChannelMessage::Binary(data));
    }

    pub fn on_resize(&mut self, cols: u16, rows: u16) {
        if self.disposed || self.is_active() {
            return;
        }
        self.send_message(ChannelMessage::Resize { cols, rows });
    }

    pub fn heartbeat(&mut self) {
        if !self.disposed {
            self.send_message(ChannelMessage::Heartbeat);
        }
    }

    /// 원격의 수신 요청(`SendRequested`)에 보낼 파일 지정
    pub fn send_files(&mut self, files: Vec<OutgoingFile>) -> Result<()> {
        if self.disposed {
            return Err(Error::ConnectionClosed);
        }
        let mut out = Outbox::new();
        let result = if let Some(sentry) = self.sentry.as_mut().filter(|s| s.is_active()) {
            sentry.send_files(files, &mut out)
        } else if let Some(magic) = self.magic.as_mut().filter(|m| m.is_transferring()) {
            magic.send_files(files, &mut out)
        } else {
            Err(Error::NoSession)
        };
        self.dispatch(out);
        result
    }

    /// 로컬에서 업로드 시작 (텍스트 마커 모드)
    pub fn upload_files(&mut self, files: Vec<OutgoingFile>) -> Result<()> {
        if self.disposed {
            return Err(Error::ConnectionClosed);
        }
        if self.is_active() {
            return Err(Error::Busy);
        }
        let magic = self
            .magic
            .as_mut()
            .ok_or_else(|| Error::Validation("magic-key mode is disabled".into()))?;
        let mut out = Outbox::new();
        let result = magic.start_upload(files, &mut out);
        self.dispatch(out);
        result
    }

    /// 진행 중인 전송 취소. 취소할 세션이 있었으면 true.
    pub fn cancel(&mut self) -> bool {
        let mut out = Outbox::new();
        let mut cancelled = false;
        if let Some(sentry) = self.sentry.as_mut() {
            cancelled |= sentry.cancel(&mut out);
        }
        if let Some(magic) = self.magic.as_mut() {
            cancelled |= magic.cancel(&mut out);
        }
        self.dispatch(out);
        cancelled
    }

    /// `Host::read_chunk` 완료
    pub fn on_chunk_read(&mut self, request_id: u64, result: std::io::Result<Bytes>) {
        if self.disposed {
            return;
        }
        let mut out = Outbox::new();
        if let Some(sentry) = self.sentry.as_mut().filter(|s| s.is_active()) {
            sentry.on_chunk(request_id, result, &mut out);
        } else if let Some(magic) = self.magic.as_mut() {
            magic.on_chunk(request_id, result, &mut out);
        }
        self.dispatch(out);
    }

    /// `Host::schedule` 만료
    pub fn on_timer(&mut self, timer: Timer) {
        if self.disposed {
            return;
        }
        let mut out = Outbox::new();
        if let Some(magic) = self.magic.as_mut() {
            magic.on_timer(timer, &mut out);
        }
        self.dispatch(out);
    }

    /// 채널 종료/에러
    pub fn on_channel_closed(&mut self) {
        if self.disposed {
            return;
        }
        info!("channel closed");
        self.dispose();
    }

    /// 세션을 중단하고 더 이상 이벤트를 처리하지 않는다
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        let mut out = Outbox::new();
        if let Some(sentry) = self.sentry.as_mut() {
            sentry.abort(Error::ConnectionClosed, &mut out);
        }
        if let Some(magic) = self.magic.as_mut() {
            magic.abort(Error::ConnectionClosed, &mut out);
        }
        // 중단 신호는 닫힌 채널로 보내지 않는다
        out.retain(|a| !matches!(a, Action::ToChannel(_)));
        self.dispatch(out);
        self.disposed = true;
        debug!("addon disposed: {}", self.stats.summary());
    }

    fn send_message(&mut self, message: ChannelMessage) {
        if let Some(frame) = self.codec.encode(message) {
            self.host.send_frame(frame);
        }
    }

    /// 세션 출력을 순서대로 호스트에 전달
    fn dispatch(&mut self, out: Outbox) {
        for action in out {
            match action {
                Action::ToChannel(bytes) => self.send_message(ChannelMessage::Binary(bytes)),
                Action::ToTerminal(bytes) => self.host.write_terminal(bytes),
                Action::ReadChunk(request) => self.host.read_chunk(request),
                Action::Schedule(delay, timer) => self.host.schedule(delay, timer),
                Action::Notify(event) => {
                    self.stats.record_event(&event);
                    if let TransferEvent::SessionEnded {
                        state: SessionState::Aborted,
                        message,
                    } = &event
                    {
                        self.host
                            .write_terminal(Bytes::from(format!("\r\n{}\r\n", message)));
                    }
                    self.host.on_event(event);
                }
            }
        }

        let enabled = !self.is_active();
        if enabled != self.input_enabled {
            debug!("terminal input {}", if enabled { "enabled" } else { "disabled" });
            self.input_enabled = enabled;
            self.host.set_input_enabled(enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::EscapeTable;
    use crate::header::{flags, Header, HeaderEncoding, HeaderKind};
    use crate::message::{DefaultCodec, K8sChannelCodec};
    use crate::session::{Protocol, TransferMode, ABORT_SEQUENCE};

    #[derive(Default)]
    struct MockHost {
        terminal: Vec<u8>,
        frames: Vec<Frame>,
        input: Vec<bool>,
        reads: Vec<ChunkRequest>,
        timers: Vec<Timer>,
        detections: Vec<Detection>,
        events: Vec<TransferEvent>,
        reject: bool,
    }

    impl Host for MockHost {
        fn write_terminal(&mut self, data: Bytes) {
            self.terminal.extend_from_slice(&data);
        }

        fn send_frame(&mut self, frame: Frame) {
            self.frames.push(frame);
        }

        fn set_input_enabled(&mut self, enabled: bool) {
            self.input.push(enabled);
        }

        fn read_chunk(&mut self, request: ChunkRequest) {
            self.reads.push(request);
        }

        fn schedule(&mut self, _delay: Duration, timer: Timer) {
            self.timers.push(timer);
        }

        fn on_detect(&mut self, detection: &Detection) -> Decision {
            self.detections.push(detection.clone());
            if self.reject {
                Decision::Reject
            } else {
                Decision::Accept
            }
        }

        fn on_event(&mut self, event: TransferEvent) {
            self.events.push(event);
        }
    }

    fn addon() -> Addon<MockHost> {
        Addon::new(Config::default(), Box::new(DefaultCodec), MockHost::default()).unwrap()
    }

    fn zrqinit() -> Vec<u8> {
        Header::with_position(HeaderKind::RqInit, 0).encode(HeaderEncoding::Hex, &EscapeTable::zdle())
    }

    fn zrinit() -> Vec<u8> {
        Header::with_flags(HeaderKind::RInit, flags::CANFDX | flags::CANFC32, 0, 0, 0)
            .encode(HeaderEncoding::Hex, &EscapeTable::zdle())
    }

    fn binary_frames(host: &MockHost) -> Vec<Vec<u8>> {
        host.frames
            .iter()
            .filter_map(|f| match f {
                Frame::Binary(b) => Some(b.to_vec()),
                Frame::Text(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_idle_passthrough() {
        let mut addon = addon();
        addon.on_channel_frame(Frame::Text("$ ls\r\n".into()));
        addon.on_channel_frame(Frame::Binary(Bytes::from_static(b"a.txt\r\n")));
        assert_eq!(addon.host().terminal, b"$ ls\r\na.txt\r\n");

        addon.on_terminal_data("ls\r");
        assert_eq!(addon.host().frames, vec![Frame::Text("ls\r".into())]);
        assert!(addon.host().input.is_empty());
    }

    #[test]
    fn test_zmodem_detection_gates_input() {
        let mut addon = addon();
        let mut data = b"rz waiting\r\n".to_vec();
        data.extend(zrqinit());
        addon.on_channel_data(&data);

        let host = addon.host();
        assert_eq!(host.terminal, b"rz waiting\r\n");
        assert_eq!(host.detections.len(), 1);
        assert_eq!(host.detections[0].protocol, Protocol::Zmodem);
        assert_eq!(host.detections[0].mode, TransferMode::Receive);
        assert_eq!(host.input, vec![false]);
        // ZRINIT 응답
        assert!(binary_frames(host).iter().any(|f| f.starts_with(b"**\x18B01")));
        assert!(addon.is_active());

        // 전송 중 입력은 버린다
        let frames = addon.host().frames.len();
        addon.on_terminal_data("typing");
        addon.on_resize(100, 30);
        assert_eq!(addon.host().frames.len(), frames);
    }

    #[test]
    fn test_interrupt_cancels_transfer() {
        let mut addon = addon();
        addon.on_channel_data(&zrqinit());
        assert!(addon.is_active());

        addon.on_terminal_data("\x03");
        assert!(!addon.is_active());
        let host = addon.host();
        assert_eq!(host.input, vec![false, true]);
        assert!(binary_frames(host).iter().any(|f| f.as_slice() == ABORT_SEQUENCE));
        assert!(host.events.iter().any(|e| matches!(
            e,
            TransferEvent::SessionEnded { state: SessionState::Aborted, .. }
        )));
        assert_eq!(addon.stats().aborted_sessions, 1);

        // 다시 일반 입력
        addon.on_terminal_data("ls\r");
        assert_eq!(addon.host().frames.last(), Some(&Frame::Text("ls\r".into())));
    }

    #[test]
    fn test_reject_sends_abort() {
        let mut host = MockHost::default();
        host.reject = true;
        let mut addon = Addon::new(Config::default(), Box::new(DefaultCodec), host).unwrap();
        addon.on_channel_data(&zrqinit());
        assert!(!addon.is_active());
        assert_eq!(binary_frames(addon.host()), vec![ABORT_SEQUENCE.to_vec()]);
    }

    #[test]
    fn test_send_request_and_files() {
        let mut addon = addon();
        addon.on_channel_data(&zrinit());
        assert!(addon
            .host()
            .events
            .contains(&TransferEvent::SendRequested { protocol: Protocol::Zmodem }));

        let files = vec![OutgoingFile::from_bytes("a.txt", &b"hello world"[..])];
        addon.send_files(files).unwrap();
        // ZFILE 헤더
        assert!(binary_frames(addon.host()).iter().any(|f| f.starts_with(b"*\x18")));
    }

    #[test]
    fn test_send_files_without_session() {
        let mut addon = addon();
        assert!(matches!(
            addon.send_files(vec![OutgoingFile::from_bytes("a", &b"x"[..])]),
            Err(Error::NoSession)
        ));
    }

    #[test]
    fn test_magic_key_reject() {
        let mut host = MockHost::default();
        host.reject = true;
        let mut addon = Addon::new(Config::default(), Box::new(DefaultCodec), host).unwrap();
        addon.on_channel_data(b"::TRZSZ:TRANSFER:S:1.1.5:1700000000123\r\n");

        let host = addon.host();
        assert_eq!(host.detections.len(), 1);
        assert_eq!(host.detections[0].protocol, Protocol::Trzsz);
        let frames = binary_frames(host);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with(b"#ACT:"));
        assert!(!addon.is_active());
    }

    #[test]
    fn test_magic_key_disabled() {
        let config = Config {
            magic_key_enabled: false,
            ..Config::default()
        };
        let mut addon = Addon::new(config, Box::new(DefaultCodec), MockHost::default()).unwrap();
        addon.on_channel_data(b"::TRZSZ:TRANSFER:S:1.1.5:1700000000123\r\n");
        assert!(addon.host().detections.is_empty());
        assert!(matches!(
            addon.upload_files(vec![OutgoingFile::from_bytes("a", &b"x"[..])]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_upload_injects_command() {
        let mut addon = addon();
        addon
            .upload_files(vec![OutgoingFile::from_bytes("a.txt", &b"abc"[..])])
            .unwrap();
        assert_eq!(binary_frames(addon.host()), vec![b"\x03".to_vec()]);
        assert_eq!(addon.host().timers, vec![Timer::UploadInterruptElapsed]);

        addon.on_timer(Timer::UploadInterruptElapsed);
        assert_eq!(binary_frames(addon.host()).last().map(|f| f.as_slice()), Some(&b"trz\r"[..]));
    }

    #[test]
    fn test_channel_close_aborts() {
        let mut addon = addon();
        addon.on_channel_data(&zrqinit());
        let frames = addon.host().frames.len();

        addon.on_channel_closed();
        assert!(addon.is_disposed());
        assert!(!addon.is_active());
        assert_eq!(addon.host().frames.len(), frames);
        assert_eq!(addon.host().input.last(), Some(&true));

        addon.on_channel_data(b"late output");
        assert!(!addon.host().terminal.ends_with(b"late output"));
    }

    #[test]
    fn test_k8s_codec_resize_and_exit() {
        let mut addon =
            Addon::new(Config::default(), Box::new(K8sChannelCodec::new(false)), MockHost::default())
                .unwrap();
        addon.on_resize(80, 24);
        addon.heartbeat();
        assert_eq!(
            addon.host().frames,
            vec![
                Frame::Binary(Bytes::from_static(b"\x04{\"Width\":80,\"Height\":24}")),
                Frame::Binary(Bytes::from_static(b"\x00")),
            ]
        );

        addon.on_channel_frame(Frame::Binary(Bytes::from_static(b"\x01hi")));
        addon.on_channel_frame(Frame::Binary(Bytes::from_static(b"\x03error, exit code 137")));
        assert_eq!(
            addon.host().terminal,
            b"hi\r\nexit code 137: pod terminated\r\n"
        );
    }
}
