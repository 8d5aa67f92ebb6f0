//! 바이너리 헤더 감지기 (Sentry)
//!
//! 터미널로 가는 바이트에서 `** ZDLE B00`(ZRQINIT) / `** ZDLE B01`(ZRINIT)을 찾는다.
//! 감지된 헤더는 터미널에 쓰지 않고, 청크 끝의 부분 시그니처는 다음 청크까지 보류한다.
//! 세션은 한 번에 하나만 존재한다.

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::Config;
use crate::header::{self, HeaderKind};
use crate::receiver::ReceiveSession;
use crate::sender::SendSession;
use crate::session::{
    Action, Decision, Detection, Outbox, OutgoingFile, Protocol, SessionKind, SessionState,
    TransferMode, ABORT_SEQUENCE,
};
use crate::{Error, Result};

/// hex 헤더 시그니처 (타입 상위 니블 0)
const SIGNATURE: &[u8] = b"**\x18B0";

/// 진행 중인 ZMODEM 세션
pub enum ZmodemSession {
    Receive(ReceiveSession),
    Send(SendSession),
}

impl ZmodemSession {
    pub fn kind(&self) -> SessionKind {
        match self {
            ZmodemSession::Receive(s) => s.kind(),
            ZmodemSession::Send(s) => s.kind(),
        }
    }

    pub fn state(&self) -> SessionState {
        match self {
            ZmodemSession::Receive(s) => s.state(),
            ZmodemSession::Send(s) => s.state(),
        }
    }

    fn start(&mut self, out: &mut Outbox) {
        match self {
            ZmodemSession::Receive(s) => s.start(out),
            ZmodemSession::Send(s) => s.start(out),
        }
    }

    /// 수신 바이트 처리, 세션 종료 뒤 남은 바이트 반환
    pub fn consume(&mut self, data: &[u8], out: &mut Outbox) -> Vec<u8> {
        match self {
            ZmodemSession::Receive(s) => s.consume(data, out),
            ZmodemSession::Send(s) => s.consume(data, out),
        }
    }

    pub fn send_files(&mut self, files: Vec<OutgoingFile>, out: &mut Outbox) -> Result<()> {
        match self {
            ZmodemSession::Send(s) => s.send_files(files, out),
            ZmodemSession::Receive(_) => Err(Error::Busy),
        }
    }

    pub fn on_chunk(&mut self, request_id: u64, result: std::io::Result<Bytes>, out: &mut Outbox) {
        if let ZmodemSession::Send(s) = self {
            s.on_chunk(request_id, result, out);
        }
    }

    pub fn cancel(&mut self, out: &mut Outbox) -> bool {
        match self {
            ZmodemSession::Receive(s) => s.cancel(out),
            ZmodemSession::Send(s) => s.cancel(out),
        }
    }

    pub fn abort(&mut self, err: Error, out: &mut Outbox) {
        match self {
            ZmodemSession::Receive(s) => s.abort(err, out),
            ZmodemSession::Send(s) => s.abort(err, out),
        }
    }
}

/// 스캔 결과
enum Scan {
    /// 시그니처 없음, 끝의 `held`바이트는 보류
    Clear { held: usize },
    /// `start` 위치에 시그니처
    Found { start: usize },
}

fn scan(buf: &[u8]) -> Scan {
    if let Some(start) = buf.windows(SIGNATURE.len()).position(|w| w == SIGNATURE) {
        return Scan::Found { start };
    }
    // 버퍼 끝이 시그니처의 앞부분인지
    let held = (1..SIGNATURE.len())
        .rev()
        .find(|&n| n <= buf.len() && buf[buf.len() - n..] == SIGNATURE[..n])
        .unwrap_or(0);
    Scan::Clear { held }
}

/// 바이너리 헤더 감지기
pub struct Sentry {
    config: Config,
    pending: Vec<u8>,
    session: Option<ZmodemSession>,
}

impl Sentry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            pending: Vec::new(),
            session: None,
        }
    }

    /// 세션이 진행 중인지
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&ZmodemSession> {
        self.session.as_ref()
    }

    /// 채널에서 온 바이트 처리
    ///
    /// 세션이 없으면 시그니처를 찾고, 나머지는 `ToTerminal`로 내보낸다.
    /// `decide`는 감지마다 한 번 호출된다.
    pub fn consume<F>(&mut self, data: &[u8], mut decide: F, out: &mut Outbox)
    where
        F: FnMut(&Detection) -> Decision,
    {
        let mut input = data.to_vec();
        loop {
            if let Some(session) = self.session.as_mut() {
                let leftover = session.consume(&input, out);
                if !session.state().is_finished() {
                    return;
                }
                debug!("ZMODEM session finished ({:?})", session.state());
                self.session = None;
                if leftover.is_empty() {
                    return;
                }
                input = leftover;
            }

            match self.scan_idle(&input, &mut decide, out) {
                Some(rest) => input = rest,
                None => return,
            }
        }
    }

    /// 세션 없이 스캔. 세션이 시작되면 그 세션에 넘길 나머지를 반환.
    fn scan_idle<F>(&mut self, data: &[u8], decide: &mut F, out: &mut Outbox) -> Option<Vec<u8>>
    where
        F: FnMut(&Detection) -> Decision,
    {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(data);
        let mut pos = 0;

        loop {
            let rest = &buf[pos..];
            match scan(rest) {
                Scan::Clear { held } => {
                    write_terminal(&rest[..rest.len() - held], out);
                    self.pending = rest[rest.len() - held..].to_vec();
                    return None;
                }
                Scan::Found { start } => {
                    write_terminal(&rest[..start], out);
                    pos += start;
                }
            }

            let candidate = &buf[pos..];
            let (header, consumed) = match header::parse(candidate) {
                Ok(Some((header, _, consumed))) => (header, consumed),
                Ok(None) => {
                    self.pending = candidate.to_vec();
                    return None;
                }
                Err(e) => {
                    debug!("not a ZMODEM header: {}", e);
                    write_terminal(&candidate[..1], out);
                    pos += 1;
                    continue;
                }
            };

            let mode = match header.kind {
                HeaderKind::RqInit => TransferMode::Receive,
                HeaderKind::RInit => TransferMode::Send,
                _ => {
                    write_terminal(&candidate[..consumed], out);
                    pos += consumed;
                    continue;
                }
            };
            pos += consumed;

            let detection = Detection {
                protocol: Protocol::Zmodem,
                mode,
                version: None,
                unique_id: None,
                remote_is_windows: false,
            };
            info!("ZMODEM detected: {:?}", mode);
            if decide(&detection) == Decision::Reject {
                info!("ZMODEM transfer rejected");
                out.push(Action::ToChannel(Bytes::from_static(&ABORT_SEQUENCE)));
                continue;
            }

            let mut session = match mode {
                TransferMode::Receive => ZmodemSession::Receive(ReceiveSession::new(&self.config)),
                _ => ZmodemSession::Send(SendSession::new(&self.config, &header)),
            };
            session.start(out);
            self.session = Some(session);
            return Some(buf[pos..].to_vec());
        }
    }

    /// 진행 중인 송신 세션에 파일 전달
    pub fn send_files(&mut self, files: Vec<OutgoingFile>, out: &mut Outbox) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NoSession)?;
        let result = session.send_files(files, out);
        self.clear_finished();
        result
    }

    /// 청크 읽기 결과를 세션에 전달
    pub fn on_chunk(&mut self, request_id: u64, result: std::io::Result<Bytes>, out: &mut Outbox) {
        if let Some(session) = self.session.as_mut() {
            session.on_chunk(request_id, result, out);
            self.clear_finished();
        }
    }

    /// 끝난 세션 제거
    fn clear_finished(&mut self) {
        if let Some(state) = self.session.as_ref().map(ZmodemSession::state) {
            if state.is_finished() {
                debug!("ZMODEM session finished ({:?})", state);
                self.session = None;
            }
        }
    }

    /// 보류 중인 바이트를 터미널로 내보낸다
    pub fn flush(&mut self, out: &mut Outbox) {
        if self.session.is_none() {
            let pending = std::mem::take(&mut self.pending);
            write_terminal(&pending, out);
        }
    }

    /// 진행 중인 세션 취소
    pub fn cancel(&mut self, out: &mut Outbox) -> bool {
        let cancelled = self.session.as_mut().is_some_and(|s| s.cancel(out));
        self.session = None;
        cancelled
    }

    /// 연결 종료 등으로 세션 폐기
    pub fn abort(&mut self, err: Error, out: &mut Outbox) {
        if let Some(mut session) = self.session.take() {
            session.abort(err, out);
        }
        self.pending.clear();
    }
}

fn write_terminal(bytes: &[u8], out: &mut Outbox) {
    if !bytes.is_empty() {
        out.push(Action::ToTerminal(Bytes::copy_from_slice(bytes)));
    }
}
