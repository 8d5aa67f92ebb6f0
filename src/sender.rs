//! ZMODEM 송신 세션 (로컬 -> 원격 `rz`)
//!
//! - 파일마다 ZFILE 오퍼 후 ZRPOS를 기다린다
//! - 청크는 한 번에 하나만 읽기 요청 (호스트가 `on_chunk`로 돌려준다)
//! - 마지막 청크 뒤 ZEOF, ZRINIT을 받으면 다음 파일
//! - 배치가 끝나면 ZFIN 교환 후 `OO`

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crc::CrcWidth;
use crate::descriptor::TransferDescriptor;
use crate::escape::EscapeTable;
use crate::header::{flags, Header, HeaderEncoding, HeaderKind};
use crate::session::{
    Action, ChunkRequest, Outbox, OutgoingFile, Progress, Protocol, SessionKind, SessionState,
    TransferEvent, TransferHandle, WireBuffer, ABORT_SEQUENCE,
};
use crate::stats::progress_line;
use crate::subpacket::{self, FrameKind};
use crate::{Error, Result};

/// ZMODEM 위치 필드 한계
const MAX_ZMODEM_FILE_SIZE: u64 = u32::MAX as u64;

/// 송신 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// 호스트의 `send_files` 대기
    AwaitFiles,
    /// ZFILE 오퍼에 대한 ZRPOS / ZSKIP 대기
    AwaitOfferReply,
    /// 청크 읽기 완료 대기
    AwaitChunk { id: u64 },
    /// ZEOF 뒤 ZRINIT 대기
    AwaitEofAck,
    /// ZFIN 응답 대기
    AwaitFin,
    Done,
}

/// ZMODEM 송신 세션
pub struct SendSession {
    state: SessionState,
    phase: Phase,
    wire: WireBuffer,
    encoding: HeaderEncoding,
    table: EscapeTable,
    files: Vec<OutgoingFile>,
    index: usize,
    transfer: Option<TransferHandle>,
    sent: Vec<String>,
    chunk_size: usize,
    max_upload_size: Option<u64>,
    show_progress: bool,
}

impl SendSession {
    /// 원격 ZRINIT 헤더로 생성 (CRC 폭과 이스케이프 범위 협상)
    pub fn new(config: &Config, rinit: &Header) -> Self {
        let receiver_flags = rinit.zf0();
        let encoding = if config.prefer_crc32 && receiver_flags & flags::CANFC32 != 0 {
            HeaderEncoding::Bin32
        } else {
            HeaderEncoding::Bin16
        };
        let table = if config.escape_all_controls || receiver_flags & flags::ESCCTL != 0 {
            EscapeTable::zdle_all_controls()
        } else {
            EscapeTable::zdle()
        };
        debug!(
            "receiver flags 0x{:02X}, using {:?}",
            receiver_flags, encoding
        );

        Self {
            state: SessionState::Negotiating,
            phase: Phase::AwaitFiles,
            wire: WireBuffer::default(),
            encoding,
            table,
            files: Vec::new(),
            index: 0,
            transfer: None,
            sent: Vec::new(),
            chunk_size: config.chunk_size.max(1),
            max_upload_size: config.max_upload_size,
            show_progress: config.terminal_progress,
        }
    }

    pub fn kind(&self) -> SessionKind {
        SessionKind::Send
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 세션 시작: 호스트에 파일 선택 요청
    pub fn start(&mut self, out: &mut Outbox) {
        info!("ZMODEM send session started");
        out.push(Action::Notify(TransferEvent::SendRequested {
            protocol: Protocol::Zmodem,
        }));
    }

    fn width(&self) -> CrcWidth {
        self.encoding.crc_width()
    }

    fn binary_header(&self, header: Header) -> Vec<u8> {
        header.encode(self.encoding, &self.table)
    }

    fn send_hex(&self, header: Header, out: &mut Outbox) {
        out.push(Action::ToChannel(Bytes::from(
            header.encode(HeaderEncoding::Hex, &self.table),
        )));
    }

    /// 보낼 파일 지정 (빈 목록이면 바로 종료 교환)
    pub fn send_files(&mut self, files: Vec<OutgoingFile>, out: &mut Outbox) -> Result<()> {
        if self.state.is_finished() {
            return Err(Error::NoSession);
        }
        if self.phase != Phase::AwaitFiles {
            return Err(Error::Busy);
        }

        let limit = self
            .max_upload_size
            .map_or(MAX_ZMODEM_FILE_SIZE, |l| l.min(MAX_ZMODEM_FILE_SIZE));
        self.files = files
            .into_iter()
            .filter(|file| {
                if file.size > limit {
                    warn!("not offering {}: {} bytes exceeds limit {}", file.name, file.size, limit);
                    out.push(Action::Notify(TransferEvent::LimitExceeded {
                        name: file.name.clone(),
                        size: file.size,
                        limit,
                    }));
                    false
                } else {
                    true
                }
            })
            .collect();
        self.index = 0;

        if let Err(e) = self.offer_current(out) {
            self.abort(e, out);
        }
        Ok(())
    }

    /// 현재 인덱스의 파일 오퍼, 남은 파일이 없으면 ZFIN
    fn offer_current(&mut self, out: &mut Outbox) -> Result<()> {
        let Some(file) = self.files.get(self.index) else {
            self.phase = Phase::AwaitFin;
            self.state = SessionState::Closing;
            self.send_hex(Header::with_position(HeaderKind::Fin, 0), out);
            return Ok(());
        };

        let files_remaining = (self.files.len() - self.index) as u32;
        let bytes_remaining: u64 = self.files[self.index..].iter().map(|f| f.size).sum();

        let mut descriptor = TransferDescriptor::new(file.name.clone())?
            .with_size(file.size)
            .with_remaining(files_remaining, bytes_remaining)?;
        descriptor.mtime = file.mtime;
        if let Some(mode) = file.mode {
            descriptor = descriptor.with_mode(mode);
        }

        info!("offering {} ({} bytes)", file.name, file.size);
        let mut wire = self.binary_header(Header::with_flags(HeaderKind::File, 0, 0, 0, 0));
        wire.extend(subpacket::encode(
            &descriptor.encode(),
            FrameKind::EndAck,
            self.width(),
            &self.table,
        ));
        out.push(Action::ToChannel(Bytes::from(wire)));

        self.transfer = Some(TransferHandle::new(descriptor));
        self.state = SessionState::Offering;
        self.phase = Phase::AwaitOfferReply;
        Ok(())
    }

    fn next_file(&mut self, out: &mut Outbox) -> Result<()> {
        self.transfer = None;
        self.index += 1;
        self.offer_current(out)
    }

    /// 수신 바이트 처리
    pub fn consume(&mut self, data: &[u8], out: &mut Outbox) -> Vec<u8> {
        if self.state.is_finished() {
            return data.to_vec();
        }
        if let Err(e) = self.wire.push(data) {
            self.abort(e, out);
            return Vec::new();
        }
        if let Err(e) = self.process(out) {
            self.abort(e, out);
        }
        if self.state == SessionState::Ended {
            self.wire.take_remaining()
        } else {
            Vec::new()
        }
    }

    fn process(&mut self, out: &mut Outbox) -> Result<()> {
        while !self.state.is_finished() {
            let Some((header, _)) = self.wire.next_header()? else {
                return Ok(());
            };
            match self.handle_header(header, out) {
                Err(e) if !e.is_fatal() => warn!("ignored: {}", e),
                other => other?,
            }
        }
        Ok(())
    }

    fn handle_header(&mut self, header: Header, out: &mut Outbox) -> Result<()> {
        debug!("ZMODEM header {:?} (phase {:?})", header.kind, self.phase);
        match (header.kind, self.phase) {
            (HeaderKind::RInit, Phase::AwaitEofAck) => {
                if let Some(transfer) = &self.transfer {
                    let name = transfer.name().to_string();
                    let size = transfer.offset;
                    info!("sent {} ({} bytes)", name, size);
                    self.sent.push(name.clone());
                    out.push(Action::Notify(TransferEvent::FileSent { name, size }));
                }
                self.next_file(out)
            }
            // rz는 응답을 기다리며 ZRINIT을 반복한다
            (HeaderKind::RInit, _) => Ok(()),
            (
                HeaderKind::RPos,
                Phase::AwaitOfferReply | Phase::AwaitChunk { .. } | Phase::AwaitEofAck,
            ) => self.start_data(u64::from(header.position()), out),
            (HeaderKind::Skip, Phase::AwaitOfferReply | Phase::AwaitChunk { .. }) => {
                if let Some(transfer) = &self.transfer {
                    info!("receiver skipped {}", transfer.name());
                    out.push(Action::Notify(TransferEvent::FileSkipped {
                        name: transfer.name().to_string(),
                    }));
                }
                self.next_file(out)
            }
            (HeaderKind::Nak, Phase::AwaitOfferReply) => {
                debug!("offer rejected by NAK, resending");
                self.offer_current(out)
            }
            (HeaderKind::Ack, _) => Ok(()),
            (HeaderKind::Fin, Phase::AwaitFin) => {
                out.push(Action::ToChannel(Bytes::from_static(b"OO")));
                self.finish_session(out);
                Ok(())
            }
            (HeaderKind::Abort | HeaderKind::FErr | HeaderKind::Can, _) => Err(Error::PeerAborted),
            (kind, phase) => Err(Error::ProtocolViolation(format!(
                "unexpected {:?} while {:?}",
                kind, phase
            ))),
        }
    }

    /// ZRPOS 위치에서 데이터 프레임 시작
    fn start_data(&mut self, position: u64, out: &mut Outbox) -> Result<()> {
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(Error::ProtocolViolation("position request without an offer".into()));
        };
        let size = transfer.expected_size().unwrap_or(0);
        if position > size {
            return Err(Error::Framing(format!(
                "receiver requested offset {} beyond size {}",
                position, size
            )));
        }
        if position != transfer.offset {
            debug!("rewinding {} to {}", transfer.name(), position);
        }
        transfer.rewind(position);
        self.state = SessionState::Transferring;

        let mut wire = self.binary_header(Header::with_position(HeaderKind::Data, position as u32));
        if position == size {
            // 빈 파일이거나 이미 다 받은 파일
            wire.extend(subpacket::encode(&[], FrameKind::EndNoAck, self.width(), &self.table));
            wire.extend(self.binary_header(Header::with_position(HeaderKind::Eof, size as u32)));
            out.push(Action::ToChannel(Bytes::from(wire)));
            self.phase = Phase::AwaitEofAck;
            return Ok(());
        }
        out.push(Action::ToChannel(Bytes::from(wire)));
        self.request_chunk(out);
        Ok(())
    }

    fn request_chunk(&mut self, out: &mut Outbox) {
        let (Some(transfer), Some(file)) = (&self.transfer, self.files.get(self.index)) else {
            return;
        };
        let remaining = file.size.saturating_sub(transfer.offset);
        let len = (self.chunk_size as u64).min(remaining) as usize;
        let request = ChunkRequest::new(file, self.index, transfer.offset, len);
        self.phase = Phase::AwaitChunk { id: request.id };
        out.push(Action::ReadChunk(request));
    }

    /// 청크 읽기 결과 처리
    ///
    /// 되감기나 취소로 무효가 된 요청의 결과는 버린다.
    pub fn on_chunk(&mut self, request_id: u64, result: std::io::Result<Bytes>, out: &mut Outbox) {
        if self.state.is_finished() || self.phase != (Phase::AwaitChunk { id: request_id }) {
            debug!("discarding stale chunk {}", request_id);
            return;
        }
        if let Err(e) = self.send_chunk(result, out) {
            self.abort(e, out);
        }
    }

    fn send_chunk(&mut self, result: std::io::Result<Bytes>, out: &mut Outbox) -> Result<()> {
        let data = result?;
        let width = self.width();
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(Error::NoSession);
        };
        let size = transfer.expected_size().unwrap_or(0);
        if data.is_empty() {
            return Err(Error::Framing(format!(
                "{} ended at {} of {} bytes",
                transfer.name(),
                transfer.offset,
                size
            )));
        }
        let data = data.slice(..data.len().min((size - transfer.offset) as usize));
        transfer.advance(data.len() as u64);
        let offset = transfer.offset;
        let last = offset >= size;

        let progress = Progress {
            file_name: transfer.name().to_string(),
            bytes_done: offset,
            total_bytes: size,
            chunk_bytes: data.len() as u64,
        };

        let kind = if last {
            FrameKind::EndNoAck
        } else {
            FrameKind::ContinueNoAck
        };
        let mut wire = subpacket::encode(&data, kind, width, &self.table);
        if last {
            wire.extend(self.binary_header(Header::with_position(HeaderKind::Eof, size as u32)));
        }
        out.push(Action::ToChannel(Bytes::from(wire)));

        if self.show_progress {
            out.push(Action::ToTerminal(Bytes::from(progress_line(&progress))));
            if last {
                out.push(Action::ToTerminal(Bytes::from_static(b"\r\n")));
            }
        }
        out.push(Action::Notify(TransferEvent::Progress(progress)));

        if last {
            self.phase = Phase::AwaitEofAck;
        } else {
            self.request_chunk(out);
        }
        Ok(())
    }

    fn finish_session(&mut self, out: &mut Outbox) {
        self.state = SessionState::Ended;
        self.phase = Phase::Done;
        let message = if self.sent.is_empty() {
            "No files sent".to_string()
        } else {
            format!("Sent {}", self.sent.join(", "))
        };
        info!("ZMODEM send session ended: {}", message);
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
        info!("ZMODEM send session cancelled");
        out.push(Action::ToChannel(Bytes::from_static(&ABORT_SEQUENCE)));
        self.teardown(Error::UserCancelled.to_string(), out);
        true
    }

    /// 에러로 인한 중단
    pub fn abort(&mut self, err: Error, out: &mut Outbox) {
        if self.state.is_finished() {
            return;
        }
        warn!("ZMODEM send session aborted: {}", err);
        if !matches!(err, Error::PeerAborted) {
            out.push(Action::ToChannel(Bytes::from_static(&ABORT_SEQUENCE)));
        }
        self.teardown(err.to_string(), out);
    }

    fn teardown(&mut self, message: String, out: &mut Outbox) {
        self.state = SessionState::Aborted;
        self.phase = Phase::Done;
        self.transfer = None;
        self.files.clear();
        self.wire.take_remaining();
        out.push(Action::Notify(TransferEvent::SessionEnded {
            state: SessionState::Aborted,
            message,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header;

    fn rinit(zf0: u8) -> Header {
        Header::with_flags(HeaderKind::RInit, zf0, 0, 0, 0)
    }

    fn hex(header: Header) -> Vec<u8> {
        header.encode(HeaderEncoding::Hex, &EscapeTable::zdle())
    }

    fn chunk_requests(out: &Outbox) -> Vec<ChunkRequest> {
        out.iter()
            .filter_map(|a| match a {
                Action::ReadChunk(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn events(out: &Outbox) -> Vec<TransferEvent> {
        out.iter()
            .filter_map(|a| match a {
                Action::Notify(e) => Some(e.clone()),
                _ => None,
            })
            .collect()
    }

    fn channel(out: &Outbox) -> Vec<u8> {
        out.iter()
            .filter_map(|a| match a {
                Action::ToChannel(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// 호스트 역할: 읽기 요청을 동기적으로 처리
    fn serve_reads(session: &mut SendSession, out: &mut Outbox) {
        while let Some(request) = chunk_requests(out).pop() {
            out.retain(|a| !matches!(a, Action::ReadChunk(_)));
            let result = request.source.read_chunk(request.offset, request.len);
            session.on_chunk(request.id, result, out);
        }
    }

    #[test]
    fn test_crc32_negotiation() {
        let config = Config::default();
        let session = SendSession::new(&config, &rinit(flags::CANFDX | flags::CANFC32));
        assert_eq!(session.encoding, HeaderEncoding::Bin32);
        let session = SendSession::new(&config, &rinit(flags::CANFDX));
        assert_eq!(session.encoding, HeaderEncoding::Bin16);
    }

    #[test]
    fn test_start_requests_files() {
        let mut session = SendSession::new(&Config::default(), &rinit(0));
        let mut out = Vec::new();
        session.start(&mut out);
        assert_eq!(
            events(&out),
            vec![TransferEvent::SendRequested {
                protocol: Protocol::Zmodem
            }]
        );
        assert!(session.send_files(vec![], &mut out).is_ok());
        assert!(matches!(session.send_files(vec![], &mut out), Err(Error::Busy)));
    }

    #[test]
    fn test_single_file_flow() {
        let config = Config {
            chunk_size: 4,
            terminal_progress: false,
            ..Config::default()
        };
        let mut session = SendSession::new(&config, &rinit(flags::CANFC32));
        let mut out = Vec::new();
        session
            .send_files(vec![OutgoingFile::from_bytes("a.txt", &b"hello world"[..])], &mut out)
            .unwrap();

        let (offer, _, consumed) = header::parse(&channel(&out)).unwrap().unwrap();
        assert_eq!(offer.kind, HeaderKind::File);
        let (descriptor, _) = subpacket::parse(&channel(&out)[consumed..], CrcWidth::Crc32)
            .unwrap()
            .unwrap();
        let descriptor = TransferDescriptor::parse(&descriptor.payload).unwrap();
        assert_eq!(descriptor.size, Some(11));
        assert_eq!(descriptor.files_remaining, Some(1));

        out.clear();
        session.consume(&hex(Header::with_position(HeaderKind::RPos, 0)), &mut out);
        serve_reads(&mut session, &mut out);

        let chunks: Vec<u64> = events(&out)
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::Progress(p) => Some(p.chunk_bytes),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![4, 4, 3]);

        // 수신측 관점에서 재조립
        let wire = channel(&out);
        let mut rx = WireBuffer::default();
        rx.push(&wire).unwrap();
        let (data, _) = rx.next_header().unwrap().unwrap();
        assert_eq!(data.kind, HeaderKind::Data);
        let mut payload = Vec::new();
        loop {
            let sp = rx.next_subpacket(CrcWidth::Crc32).unwrap().unwrap();
            payload.extend_from_slice(&sp.payload);
            if sp.kind.ends_frame() {
                break;
            }
        }
        assert_eq!(payload, b"hello world");
        let (eof, _) = rx.next_header().unwrap().unwrap();
        assert_eq!(eof.kind, HeaderKind::Eof);
        assert_eq!(eof.position(), 11);

        out.clear();
        session.consume(&hex(rinit(flags::CANFC32)), &mut out);
        assert!(events(&out).contains(&TransferEvent::FileSent {
            name: "a.txt".into(),
            size: 11
        }));
        let (fin, _, _) = header::parse(&channel(&out)).unwrap().unwrap();
        assert_eq!(fin.kind, HeaderKind::Fin);

        out.clear();
        session.consume(&hex(Header::with_position(HeaderKind::Fin, 0)), &mut out);
        assert_eq!(channel(&out), b"OO".to_vec());
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn test_skip_advances_to_next_file() {
        let mut session = SendSession::new(&Config::default(), &rinit(0));
        let mut out = Vec::new();
        session
            .send_files(
                vec![
                    OutgoingFile::from_bytes("a", &b"1"[..]),
                    OutgoingFile::from_bytes("b", &b"2"[..]),
                ],
                &mut out,
            )
            .unwrap();
        out.clear();
        session.consume(&hex(Header::with_position(HeaderKind::Skip, 0)), &mut out);
        assert!(events(&out).contains(&TransferEvent::FileSkipped { name: "a".into() }));
        let wire = channel(&out);
        let (offer, _, consumed) = header::parse(&wire).unwrap().unwrap();
        assert_eq!(offer.kind, HeaderKind::File);
        let (sp, _) = subpacket::parse(&wire[consumed..], CrcWidth::Crc16).unwrap().unwrap();
        assert!(sp.payload.starts_with(b"b\0"));
    }

    #[test]
    fn test_over_limit_files_are_not_offered() {
        let config = Config {
            max_upload_size: Some(3),
            ..Config::default()
        };
        let mut session = SendSession::new(&config, &rinit(0));
        let mut out = Vec::new();
        session
            .send_files(vec![OutgoingFile::from_bytes("big", &b"1234"[..])], &mut out)
            .unwrap();
        assert!(events(&out)
            .iter()
            .any(|e| matches!(e, TransferEvent::LimitExceeded { size: 4, limit: 3, .. })));
        let (fin, _, _) = header::parse(&channel(&out)).unwrap().unwrap();
        assert_eq!(fin.kind, HeaderKind::Fin);
    }

    #[test]
    fn test_rewind_discards_stale_chunk() {
        let config = Config {
            chunk_size: 4,
            ..Config::default()
        };
        let mut session = SendSession::new(&config, &rinit(0));
        let mut out = Vec::new();
        session
            .send_files(vec![OutgoingFile::from_bytes("a", &b"abcdefgh"[..])], &mut out)
            .unwrap();
        session.consume(&hex(Header::with_position(HeaderKind::RPos, 0)), &mut out);
        let stale = chunk_requests(&out).pop().unwrap();

        out.clear();
        session.consume(&hex(Header::with_position(HeaderKind::RPos, 4)), &mut out);
        let fresh = chunk_requests(&out).pop().unwrap();
        assert_eq!(fresh.offset, 4);

        out.clear();
        session.on_chunk(stale.id, Ok(Bytes::from_static(b"abcd")), &mut out);
        assert!(out.is_empty());
        session.on_chunk(fresh.id, Ok(Bytes::from_static(b"efgh")), &mut out);
        assert!(events(&out)
            .iter()
            .any(|e| matches!(e, TransferEvent::Progress(p) if p.bytes_done == 8)));
    }

    #[test]
    fn test_cancel_stops_output() {
        let mut session = SendSession::new(&Config::default(), &rinit(0));
        let mut out = Vec::new();
        session
            .send_files(vec![OutgoingFile::from_bytes("a", &b"abcdefgh"[..])], &mut out)
            .unwrap();
        session.consume(&hex(Header::with_position(HeaderKind::RPos, 0)), &mut out);
        let pending = chunk_requests(&out).pop().unwrap();

        out.clear();
        assert!(session.cancel(&mut out));
        assert_eq!(channel(&out), ABORT_SEQUENCE.to_vec());
        assert!(events(&out).contains(&TransferEvent::SessionEnded {
            state: SessionState::Aborted,
            message: Error::UserCancelled.to_string(),
        }));
        out.clear();
        session.on_chunk(pending.id, Ok(Bytes::from_static(b"abcdefgh")), &mut out);
        assert!(out.is_empty());
        assert!(!session.cancel(&mut out));
    }

    #[test]
    fn test_read_error_aborts() {
        let mut session = SendSession::new(&Config::default(), &rinit(0));
        let mut out = Vec::new();
        session
            .send_files(vec![OutgoingFile::from_bytes("a", &b"abc"[..])], &mut out)
            .unwrap();
        session.consume(&hex(Header::with_position(HeaderKind::RPos, 0)), &mut out);
        let pending = chunk_requests(&out).pop().unwrap();
        out.clear();
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        session.on_chunk(pending.id, Err(err), &mut out);
        assert_eq!(session.state(), SessionState::Aborted);
    }
}
