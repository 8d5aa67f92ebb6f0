//! 텍스트 마커(trzsz) 전송 세션과 필터
//!
//! 한 줄 단위 메시지 `#TYPE:value\n`로 협상하고, 파일 내용은 길이가 붙은 DATA 청크로,
//! 파일 끝에는 CRC32 체크섬을 보낸다.
//!
//! 다운로드 (원격 `tsz`): ACT -> CFG -> NUM -> (NAME, SIZE, DATA.., CRC)* -> EXIT
//! 업로드 (원격 `trz`): 파일 선택 -> ACT -> CFG -> NUM -> (NAME, SIZE, DATA.., CRC)* -> EXIT

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::descriptor::TransferDescriptor;
use crate::escape::EscapeTable;
use crate::magic_key::{MagicKeyRecord, MarkerScanner, UniqueIdCache};
use crate::session::{
    Action, ChunkRequest, Decision, Detection, Outbox, OutgoingFile, Progress, Protocol,
    SessionKind, SessionState, Timer, TransferEvent, TransferHandle, TransferMode,
};
use crate::stats::progress_line;
use crate::{Error, Result, VERSION};

/// `ACT` 메시지
#[derive(Debug, Serialize)]
struct ActMessage<'a> {
    lang: &'a str,
    confirm: bool,
    version: &'a str,
    support_dir: bool,
}

/// 원격이 보내는 `CFG` 메시지 (모르는 필드는 무시)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub binary: bool,
    pub directory: bool,
    pub quiet: bool,
    pub bufsize: Option<usize>,
    pub timeout: Option<u64>,
    pub overwrite: bool,
    pub escape_chars: serde_json::Value,
}

impl RemoteConfig {
    /// 제어 문자까지 이스케이프해야 하는지
    pub fn escape_all(&self) -> bool {
        match &self.escape_chars {
            serde_json::Value::Null => false,
            serde_json::Value::Bool(b) => *b,
            serde_json::Value::Array(items) => !items.is_empty(),
            serde_json::Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

/// 줄 / 고정 길이 단위 수신 버퍼
#[derive(Debug, Default)]
struct LineReader {
    buf: Vec<u8>,
}

impl LineReader {
    fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// `\n`까지 한 줄 (개행 제외)
    fn next_line(&mut self) -> Option<Vec<u8>> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=end).collect();
        line.pop();
        Some(line)
    }

    fn take_exact(&mut self, n: usize) -> Option<Vec<u8>> {
        (self.buf.len() >= n).then(|| self.buf.drain(..n).collect())
    }

    fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// 한 줄에서 마지막 `#TYPE:value` 추출 (앞의 에코나 제어 시퀀스는 무시)
fn parse_line(line: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(line);
    text.rmatch_indices('#').find_map(|(i, _)| {
        let rest = &text[i + 1..];
        let colon = rest.find(':')?;
        let kind = &rest[..colon];
        if kind.is_empty() || !kind.bytes().all(|b| b.is_ascii_alphabetic()) {
            return None;
        }
        let value = rest[colon + 1..].trim_end_matches(&['\r', '!'][..]);
        Some((kind.to_string(), value.to_string()))
    })
}

fn decode_text(value: &str) -> Result<String> {
    let bytes = STANDARD.decode(value.trim())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_number<T: std::str::FromStr>(kind: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Framing(format!("invalid {} value: {:?}", kind, value)))
}

/// 파일 CRC32 (빅엔디언) base64
fn crc_value(crc: u32) -> String {
    STANDARD.encode(crc.to_be_bytes())
}

/// 진행 단계
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// 호스트의 `send_files` 대기 (업로드)
    AwaitFiles,
    AwaitConfig,
    // 다운로드
    AwaitNum,
    AwaitName,
    AwaitSize,
    /// DATA 또는 CRC
    AwaitData,
    /// 바이너리 DATA 본문
    AwaitDataBody { len: usize },
    // 업로드
    AwaitNumAck { num: usize },
    AwaitNameAck,
    AwaitSizeAck { size: u64 },
    AwaitChunk { id: u64 },
    AwaitDataAck { len: usize },
    AwaitCrcAck { crc: String },
    Done,
}

/// 텍스트 마커 전송 세션
pub struct MagicSession {
    kind: SessionKind,
    state: SessionState,
    step: Step,
    reader: LineReader,
    newline: &'static str,
    config: Config,
    remote: RemoteConfig,
    table: EscapeTable,
    chunk_size: usize,
    show_progress: bool,

    // 다운로드
    files_total: usize,
    offered: Option<TransferDescriptor>,
    incoming: Option<TransferHandle>,
    saved: Vec<String>,

    // 업로드
    files: Vec<OutgoingFile>,
    index: usize,
    offset: u64,
    hasher: crc32fast::Hasher,
    remote_names: Vec<String>,
}

impl MagicSession {
    pub fn new(config: &Config, record: &MagicKeyRecord) -> Self {
        Self {
            kind: record.mode.session_kind(),
            state: SessionState::Negotiating,
            step: Step::Done,
            reader: LineReader::default(),
            newline: if record.remote_is_windows() { "!\n" } else { "\n" },
            config: config.clone(),
            remote: RemoteConfig::default(),
            table: EscapeTable::minimal(),
            chunk_size: config.chunk_size.max(1),
            show_progress: config.terminal_progress,
            files_total: 0,
            offered: None,
            incoming: None,
            saved: Vec::new(),
            files: Vec::new(),
            index: 0,
            offset: 0,
            hasher: crc32fast::Hasher::new(),
            remote_names: Vec::new(),
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 수락 직후 호출
    pub fn start(&mut self, out: &mut Outbox) {
        match self.kind {
            SessionKind::Receive => {
                info!("magic-key download started");
                if let Err(e) = self.send_act(true, out) {
                    self.abort(e, out);
                    return;
                }
                self.step = Step::AwaitConfig;
            }
            SessionKind::Send => {
                info!("magic-key upload requested");
                self.step = Step::AwaitFiles;
                out.push(Action::Notify(TransferEvent::SendRequested {
                    protocol: Protocol::Trzsz,
                }));
            }
        }
    }

    fn send_line(&self, kind: &str, value: &str, out: &mut Outbox) {
        out.push(Action::ToChannel(Bytes::from(format!(
            "#{}:{}{}",
            kind, value, self.newline
        ))));
    }

    fn send_act(&self, confirm: bool, out: &mut Outbox) -> Result<()> {
        let act = ActMessage {
            lang: "rust",
            confirm,
            version: VERSION,
            support_dir: false,
        };
        let json = serde_json::to_vec(&act)?;
        self.send_line("ACT", &STANDARD.encode(json), out);
        Ok(())
    }

    /// 업로드할 파일 지정
    ///
    /// 빈 목록이거나 크기 제한을 넘는 파일이 있으면 거절하고 세션을 끝낸다.
    pub fn send_files(&mut self, files: Vec<OutgoingFile>, out: &mut Outbox) -> Result<()> {
        if self.state.is_finished() {
            return Err(Error::NoSession);
        }
        if self.step != Step::AwaitFiles {
            return Err(Error::Busy);
        }

        let mut rejected = None;
        for file in &files {
            if let Err(e) = self.config.check_upload(&file.name, file.size) {
                if let Error::LimitExceeded { name, size, limit } = &e {
                    out.push(Action::Notify(TransferEvent::LimitExceeded {
                        name: name.clone(),
                        size: *size,
                        limit: *limit,
                    }));
                }
                rejected.get_or_insert(e);
            }
        }

        let confirm = !files.is_empty() && rejected.is_none();
        self.send_act(confirm, out)?;
        if !confirm {
            let message = rejected.unwrap_or(Error::UserCancelled).to_string();
            info!("magic-key upload declined: {}", message);
            self.teardown(message, out);
            return Ok(());
        }

        self.files = files;
        self.index = 0;
        self.step = Step::AwaitConfig;
        Ok(())
    }

    /// 수신 바이트 처리, 세션 종료 뒤 남은 바이트 반환
    pub fn consume(&mut self, data: &[u8], out: &mut Outbox) -> Vec<u8> {
        if self.state.is_finished() {
            return data.to_vec();
        }
        self.reader.push(data);
        if let Err(e) = self.process(out) {
            self.abort(e, out);
        }
        if self.state == SessionState::Ended {
            self.reader.take_remaining()
        } else {
            Vec::new()
        }
    }

    fn process(&mut self, out: &mut Outbox) -> Result<()> {
        while !self.state.is_finished() {
            if let Step::AwaitDataBody { len } = self.step {
                let Some(raw) = self.reader.take_exact(len) else {
                    return Ok(());
                };
                let data = self.table.unescape(&raw);
                self.step = Step::AwaitData;
                self.receive_data(&data, out)?;
                continue;
            }

            let Some(line) = self.reader.next_line() else {
                return Ok(());
            };
            let Some((kind, value)) = parse_line(&line) else {
                debug!("ignoring non-protocol line ({} bytes)", line.len());
                continue;
            };
            match self.handle_line(&kind, &value, out) {
                Err(e) if !e.is_fatal() => warn!("ignored: {}", e),
                other => other?,
            }
        }
        Ok(())
    }

    fn handle_line(&mut self, kind: &str, value: &str, out: &mut Outbox) -> Result<()> {
        if kind.eq_ignore_ascii_case("FAIL") {
            let message = decode_text(value).unwrap_or_else(|_| value.to_string());
            return Err(Error::Remote(message));
        }

        match (kind, self.step.clone()) {
            ("CFG", Step::AwaitConfig) => self.handle_config(value, out),

            // 다운로드
            ("NUM", Step::AwaitNum) => {
                let num: usize = parse_number(kind, value)?;
                self.send_line("SUCC", &num.to_string(), out);
                self.files_total = num;
                if num == 0 {
                    self.finish(out);
                } else {
                    self.step = Step::AwaitName;
                }
                Ok(())
            }
            ("NAME", Step::AwaitName) => {
                let descriptor = TransferDescriptor::new(decode_text(value)?)?;
                self.send_line("SUCC", &STANDARD.encode(descriptor.base_name()), out);
                self.offered = Some(descriptor);
                self.step = Step::AwaitSize;
                Ok(())
            }
            ("SIZE", Step::AwaitSize) => {
                let size: u64 = parse_number(kind, value)?;
                let descriptor = self
                    .offered
                    .take()
                    .ok_or_else(|| Error::ProtocolViolation("size without a name".into()))?;
                if let Err(e) = self.config.check_download(&descriptor.name, size) {
                    if let Error::LimitExceeded { name, size, limit } = &e {
                        out.push(Action::Notify(TransferEvent::LimitExceeded {
                            name: name.clone(),
                            size: *size,
                            limit: *limit,
                        }));
                    }
                    return Err(e);
                }
                self.send_line("SUCC", &size.to_string(), out);
                info!("receiving {} ({} bytes)", descriptor.name, size);
                self.incoming = Some(TransferHandle::new(descriptor.with_size(size)));
                self.state = SessionState::Transferring;
                self.step = Step::AwaitData;
                Ok(())
            }
            ("DATA", Step::AwaitData) => {
                if self.remote.binary {
                    self.step = Step::AwaitDataBody {
                        len: parse_number(kind, value)?,
                    };
                    Ok(())
                } else {
                    let data = STANDARD.decode(value.trim())?;
                    self.receive_data(&data, out)
                }
            }
            ("CRC", Step::AwaitData) => self.finish_download_file(value, out),

            // 업로드
            ("SUCC", Step::AwaitNumAck { num }) => {
                expect_echo(value, &num.to_string())?;
                self.offer_current(out);
                Ok(())
            }
            ("SUCC", Step::AwaitNameAck) => {
                let remote_name = decode_text(value)?;
                let size = self.files.get(self.index).map_or(0, |f| f.size);
                self.remote_names.push(remote_name);
                self.send_line("SIZE", &size.to_string(), out);
                self.step = Step::AwaitSizeAck { size };
                Ok(())
            }
            ("SUCC", Step::AwaitSizeAck { size }) => {
                expect_echo(value, &size.to_string())?;
                self.offset = 0;
                self.hasher = crc32fast::Hasher::new();
                self.state = SessionState::Transferring;
                if size == 0 {
                    self.send_crc(out);
                } else {
                    self.request_chunk(out);
                }
                Ok(())
            }
            ("SUCC", Step::AwaitDataAck { len }) => {
                expect_echo(value, &len.to_string())?;
                let size = self.files.get(self.index).map_or(0, |f| f.size);
                if self.offset >= size {
                    self.send_crc(out);
                } else {
                    self.request_chunk(out);
                }
                Ok(())
            }
            ("SUCC", Step::AwaitCrcAck { crc }) => {
                expect_echo(value, &crc)?;
                if let Some(file) = self.files.get(self.index) {
                    info!("sent {} ({} bytes)", file.name, file.size);
                    out.push(Action::Notify(TransferEvent::FileSent {
                        name: file.name.clone(),
                        size: file.size,
                    }));
                }
                self.index += 1;
                self.offer_current(out);
                Ok(())
            }

            (kind, step) => Err(Error::ProtocolViolation(format!(
                "unexpected {} while {:?}",
                kind, step
            ))),
        }
    }

    fn handle_config(&mut self, value: &str, out: &mut Outbox) -> Result<()> {
        let json = STANDARD.decode(value.trim())?;
        let remote: RemoteConfig = serde_json::from_slice(&json)?;
        debug!("remote config: {:?}", remote);
        if remote.directory {
            return Err(Error::Validation("directory transfers are not supported".into()));
        }

        self.table = if remote.escape_all() {
            EscapeTable::extended()
        } else {
            EscapeTable::minimal()
        };
        self.chunk_size = self.config.negotiated_chunk_size(remote.bufsize);
        self.show_progress =
            self.config.terminal_progress && !(self.config.honor_quiet && remote.quiet);
        self.remote = remote;

        match self.kind {
            SessionKind::Receive => self.step = Step::AwaitNum,
            SessionKind::Send => {
                let num = self.files.len();
                self.send_line("NUM", &num.to_string(), out);
                self.step = Step::AwaitNumAck { num };
            }
        }
        Ok(())
    }

    fn receive_data(&mut self, data: &[u8], out: &mut Outbox) -> Result<()> {
        let Some(transfer) = self.incoming.as_mut() else {
            return Err(Error::ProtocolViolation("data without a file".into()));
        };
        let size = transfer.expected_size().unwrap_or(0);
        if transfer.offset + data.len() as u64 > size {
            return Err(Error::Framing(format!(
                "{}: more data than the declared {} bytes",
                transfer.name(),
                size
            )));
        }
        transfer.append(data);
        let progress = Progress {
            file_name: transfer.name().to_string(),
            bytes_done: transfer.offset,
            total_bytes: size,
            chunk_bytes: data.len() as u64,
        };

        self.send_line("SUCC", &data.len().to_string(), out);
        self.report_progress(progress, out);
        Ok(())
    }

    fn report_progress(&self, progress: Progress, out: &mut Outbox) {
        if self.show_progress {
            out.push(Action::ToTerminal(Bytes::from(progress_line(&progress))));
        }
        out.push(Action::Notify(TransferEvent::Progress(progress)));
    }

    fn finish_download_file(&mut self, value: &str, out: &mut Outbox) -> Result<()> {
        let transfer = self
            .incoming
            .take()
            .ok_or_else(|| Error::ProtocolViolation("checksum without a file".into()))?;
        let size = transfer.expected_size().unwrap_or(0);
        if transfer.offset != size {
            return Err(Error::Framing(format!(
                "{}: received {} of {} bytes",
                transfer.name(),
                transfer.offset,
                size
            )));
        }

        let expected = STANDARD.decode(value.trim())?;
        let (descriptor, payload) = transfer.into_parts();
        let computed = crc32fast::hash(&payload).to_be_bytes();
        if expected != computed {
            warn!("checksum mismatch for {}", descriptor.name);
            return Err(Error::Integrity {
                expected,
                computed: computed.to_vec(),
            });
        }
        self.send_line("SUCC", value, out);

        info!("received {} ({} bytes)", descriptor.name, payload.len());
        if self.show_progress {
            out.push(Action::ToTerminal(Bytes::from_static(b"\r\n")));
        }
        self.saved.push(descriptor.base_name().to_string());
        out.push(Action::Notify(TransferEvent::FileReceived { descriptor, payload }));

        if self.saved.len() >= self.files_total {
            self.finish(out);
        } else {
            self.state = SessionState::Negotiating;
            self.step = Step::AwaitName;
        }
        Ok(())
    }

    /// 현재 인덱스의 파일 이름 전송, 남은 파일이 없으면 종료
    fn offer_current(&mut self, out: &mut Outbox) {
        match self.files.get(self.index) {
            Some(file) => {
                self.send_line("NAME", &STANDARD.encode(&file.name), out);
                self.state = SessionState::Offering;
                self.step = Step::AwaitNameAck;
            }
            None => self.finish(out),
        }
    }

    fn request_chunk(&mut self, out: &mut Outbox) {
        let Some(file) = self.files.get(self.index) else {
            return;
        };
        let len = (self.chunk_size as u64).min(file.size.saturating_sub(self.offset)) as usize;
        let request = ChunkRequest::new(file, self.index, self.offset, len);
        self.step = Step::AwaitChunk { id: request.id };
        out.push(Action::ReadChunk(request));
    }

    /// 청크 읽기 결과 처리 (무효가 된 요청은 버린다)
    pub fn on_chunk(&mut self, request_id: u64, result: std::io::Result<Bytes>, out: &mut Outbox) {
        if self.state.is_finished() || self.step != (Step::AwaitChunk { id: request_id }) {
            debug!("discarding stale chunk {}", request_id);
            return;
        }
        if let Err(e) = self.send_chunk(result, out) {
            self.abort(e, out);
        }
    }

    fn send_chunk(&mut self, result: std::io::Result<Bytes>, out: &mut Outbox) -> Result<()> {
        let data = result?;
        let Some(file) = self.files.get(self.index) else {
            return Err(Error::NoSession);
        };
        if data.is_empty() {
            return Err(Error::Framing(format!(
                "{} ended at {} of {} bytes",
                file.name, self.offset, file.size
            )));
        }

        self.hasher.update(&data);
        self.offset += data.len() as u64;
        let progress = Progress {
            file_name: file.name.clone(),
            bytes_done: self.offset,
            total_bytes: file.size,
            chunk_bytes: data.len() as u64,
        };

        if self.remote.binary {
            let escaped = self.table.escape(&data);
            let mut wire = format!("#DATA:{}{}", escaped.len(), self.newline).into_bytes();
            wire.extend_from_slice(&escaped);
            out.push(Action::ToChannel(Bytes::from(wire)));
        } else {
            self.send_line("DATA", &STANDARD.encode(&data), out);
        }
        self.step = Step::AwaitDataAck { len: data.len() };
        self.report_progress(progress, out);
        Ok(())
    }

    fn send_crc(&mut self, out: &mut Outbox) {
        let hasher = std::mem::replace(&mut self.hasher, crc32fast::Hasher::new());
        let crc = crc_value(hasher.finalize());
        self.send_line("CRC", &crc, out);
        if self.show_progress {
            out.push(Action::ToTerminal(Bytes::from_static(b"\r\n")));
        }
        self.step = Step::AwaitCrcAck { crc };
    }

    fn finish(&mut self, out: &mut Outbox) {
        let message = match self.kind {
            SessionKind::Receive => format!("Saved {}", self.saved.join(", ")),
            SessionKind::Send => format!("Received {}", self.remote_names.join(", ")),
        };
        self.send_line("EXIT", &STANDARD.encode(&message), out);
        info!("magic-key session ended: {}", message);
        self.state = SessionState::Ended;
        self.step = Step::Done;
        out.push(Action::Notify(TransferEvent::SessionEnded {
            state: SessionState::Ended,
            message,
        }));
    }

    /// 사용자 취소. 이미 끝났으면 false.
    pub fn cancel(&mut self, out: &mut Outbox) -> bool {
        if self.state.is_finished() {
            return false;
        }
        info!("magic-key session cancelled");
        self.send_line("fail", &STANDARD.encode("Stopped"), out);
        self.teardown(Error::UserCancelled.to_string(), out);
        true
    }

    /// 에러로 인한 중단. 원격이 보낸 에러에는 응답하지 않는다.
    pub fn abort(&mut self, err: Error, out: &mut Outbox) {
        if self.state.is_finished() {
            return;
        }
        warn!("magic-key session aborted: {}", err);
        if !matches!(err, Error::Remote(_) | Error::ConnectionClosed) {
            self.send_line("fail", &STANDARD.encode(err.to_string()), out);
        }
        self.teardown(err.to_string(), out);
    }

    fn teardown(&mut self, message: String, out: &mut Outbox) {
        self.state = SessionState::Aborted;
        self.step = Step::Done;
        self.incoming = None;
        self.files.clear();
        self.reader.take_remaining();
        out.push(Action::Notify(TransferEvent::SessionEnded {
            state: SessionState::Aborted,
            message,
        }));
    }
}

fn expect_echo(value: &str, expected: &str) -> Result<()> {
    if value.trim() == expected {
        Ok(())
    } else {
        Err(Error::Framing(format!(
            "acknowledged {:?}, expected {:?}",
            value, expected
        )))
    }
}

/// 원격 출력에서 ANSI 시퀀스와 공백 제거 (업로드 명령 에코 판별용)
pub fn strip_server_output(data: &[u8]) -> String {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] != 0x1B {
            out.push(data[i]);
            i += 1;
            continue;
        }
        i += 1;
        match data.get(i) {
            // CSI: 종료 문자(0x40..=0x7E)까지
            Some(b'[') => {
                i += 1;
                while i < data.len() && !(0x40..=0x7E).contains(&data[i]) {
                    i += 1;
                }
                i += 1;
            }
            // OSC: BEL 또는 ST까지
            Some(b']') => {
                while i < data.len() && data[i] != 0x07 {
                    if data[i] == 0x1B && data.get(i + 1) == Some(&b'\\') {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            Some(_) => i += 1,
            None => {}
        }
    }
    String::from_utf8_lossy(&out).trim().to_string()
}

/// 업로드 시작 절차 상태
#[derive(Debug, Default)]
struct UploadState {
    pending: Option<Vec<OutgoingFile>>,
    /// 인터럽트 후 출력 무시 중
    interrupting: bool,
    /// 다음 출력이 `trz` 에코인지 확인
    skip_echo: bool,
}

/// 텍스트 마커 필터
///
/// 세션이 없을 때는 출력을 그대로 돌려주며 마커를 찾고,
/// 세션이 있으면 모든 입력을 세션에 넘긴다.
pub struct MagicFilter {
    config: Config,
    scanner: MarkerScanner,
    cache: UniqueIdCache,
    session: Option<MagicSession>,
    upload: UploadState,
}

impl MagicFilter {
    pub fn new(config: Config, windows_shell: bool) -> Self {
        let cache = UniqueIdCache::new(config.dedupe_capacity, windows_shell);
        Self {
            config,
            scanner: MarkerScanner::new(),
            cache,
            session: None,
            upload: UploadState::default(),
        }
    }

    pub fn is_transferring(&self) -> bool {
        self.session.is_some()
    }

    pub fn session(&self) -> Option<&MagicSession> {
        self.session.as_ref()
    }

    /// 업로드 시작 절차 진행 중인지
    pub fn upload_pending(&self) -> bool {
        self.upload.pending.is_some()
    }

    /// 채널 출력 처리
    ///
    /// 마커를 감지하면 출력을 터미널로 직접 쓰고 `None`을 반환한다.
    /// 처리하지 않은 바이트는 `Some`으로 돌려준다.
    pub fn consume<F>(&mut self, data: &[u8], decide: F, out: &mut Outbox) -> Option<Vec<u8>>
    where
        F: FnOnce(&Detection) -> Decision,
    {
        let mut data = data.to_vec();
        if let Some(session) = self.session.as_mut() {
            let leftover = session.consume(&data, out);
            if !session.state().is_finished() {
                return None;
            }
            self.session = None;
            self.scanner.reset();
            if leftover.is_empty() {
                return None;
            }
            data = leftover;
        }

        if self.upload.interrupting {
            debug!("dropping {} bytes while interrupting", data.len());
            return None;
        }
        if self.upload.skip_echo {
            self.upload.skip_echo = false;
            if strip_server_output(&data) == "trz" {
                out.push(Action::ToTerminal(Bytes::from_static(b"\r\n")));
                return None;
            }
        }

        let record = self
            .scanner
            .scan(&data)
            .into_iter()
            .find(|record| !self.cache.check_and_insert(record.unique_id.as_deref()));
        let Some(record) = record else {
            return Some(data);
        };

        out.push(Action::ToTerminal(Bytes::from(data)));
        self.handle_detection(record, decide, out);
        None
    }

    fn handle_detection<F>(&mut self, record: MagicKeyRecord, decide: F, out: &mut Outbox)
    where
        F: FnOnce(&Detection) -> Decision,
    {
        let detection = record.detection();
        info!("magic key detected: {:?} v{}", record.mode, record.version);
        let mut session = MagicSession::new(&self.config, &record);

        if record.mode == TransferMode::SendDir {
            warn!("directory upload requested, refusing");
            session.send_line("fail", &STANDARD.encode("Directory transfers are not supported"), out);
            out.push(Action::Notify(TransferEvent::Notice(
                "Directory transfers are not supported".into(),
            )));
            return;
        }

        let pending = match record.mode {
            TransferMode::Send => self.upload.pending.take(),
            _ => None,
        };
        let decision = if pending.is_some() {
            Decision::Accept
        } else {
            decide(&detection)
        };
        if decision == Decision::Reject {
            info!("magic-key transfer rejected");
            if let Err(e) = session.send_act(false, out) {
                warn!("failed to send rejection: {}", e);
            }
            return;
        }

        session.start(out);
        if let Some(files) = pending {
            if let Err(e) = session.send_files(files, out) {
                session.abort(e, out);
            }
        }
        if !session.state().is_finished() {
            self.session = Some(session);
        }
    }

    /// 업로드할 파일 지정 (원격 요청에 대한 응답)
    pub fn send_files(&mut self, files: Vec<OutgoingFile>, out: &mut Outbox) -> Result<()> {
        let session = self.session.as_mut().ok_or(Error::NoSession)?;
        let result = session.send_files(files, out);
        if session.state().is_finished() {
            self.session = None;
        }
        result
    }

    /// 업로드 먼저 시작: 인터럽트 후 `trz` 명령 주입
    pub fn start_upload(&mut self, files: Vec<OutgoingFile>, out: &mut Outbox) -> Result<()> {
        if self.session.is_some() || self.upload.pending.is_some() {
            return Err(Error::Busy);
        }
        if files.is_empty() {
            return Err(Error::Validation("no files to upload".into()));
        }
        info!("starting upload of {} file(s)", files.len());
        self.upload.pending = Some(files);
        self.upload.interrupting = true;
        out.push(Action::ToChannel(Bytes::from_static(b"\x03")));
        out.push(Action::Schedule(
            Duration::from_millis(self.config.upload_interrupt_delay_ms),
            Timer::UploadInterruptElapsed,
        ));
        Ok(())
    }

    pub fn on_timer(&mut self, timer: Timer, out: &mut Outbox) {
        match timer {
            Timer::UploadInterruptElapsed => {
                if !self.upload.interrupting {
                    return;
                }
                self.upload.interrupting = false;
                self.upload.skip_echo = true;
                out.push(Action::ToChannel(Bytes::from_static(b"trz\r")));
                out.push(Action::Schedule(
                    Duration::from_millis(self.config.upload_start_timeout_ms),
                    Timer::UploadStartDeadline,
                ));
            }
            Timer::UploadStartDeadline => {
                if self.upload.pending.take().is_some() {
                    warn!("upload did not start");
                    out.push(Action::Notify(TransferEvent::Notice(
                        "Upload did not start".into(),
                    )));
                }
                self.upload.skip_echo = false;
            }
        }
    }

    pub fn on_chunk(&mut self, request_id: u64, result: std::io::Result<Bytes>, out: &mut Outbox) {
        if let Some(session) = self.session.as_mut() {
            session.on_chunk(request_id, result, out);
            if session.state().is_finished() {
                self.session = None;
            }
        }
    }

    pub fn cancel(&mut self, out: &mut Outbox) -> bool {
        self.upload = UploadState::default();
        let cancelled = self.session.as_mut().is_some_and(|s| s.cancel(out));
        self.session = None;
        cancelled
    }

    pub fn abort(&mut self, err: Error, out: &mut Outbox) {
        self.upload = UploadState::default();
        if let Some(mut session) = self.session.take() {
            session.abort(err, out);
        }
        self.scanner.reset();
    }
}
