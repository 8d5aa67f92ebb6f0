//! ZMODEM 수신 세션 (원격 `sz` -> 로컬)
//!
//! - ZRINIT 광고 후 ZFILE 오퍼마다 ZRPOS/ZSKIP 응답
//! - ZDATA 서브패킷을 파일 페이로드로 조립
//! - ZFIN 교환 후 `OO` 소비

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crc::CrcWidth;
use crate::descriptor::TransferDescriptor;
use crate::escape::EscapeTable;
use crate::header::{flags, Header, HeaderEncoding, HeaderKind, TESCCTL};
use crate::session::{
    Action, Outbox, Progress, SessionKind, SessionState, TransferEvent, TransferHandle, WireBuffer,
    ABORT_SEQUENCE,
};
use crate::stats::progress_line;
use crate::subpacket::Subpacket;
use crate::{Error, Result};

/// 다음에 기대하는 입력
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Header,
    /// ZFILE 뒤 파일 정보 서브패킷
    FileInfo,
    /// ZSINIT 뒤 attention 서브패킷
    SInitData,
    /// ZDATA 뒤 데이터 서브패킷
    Data,
    /// 원치 않는 데이터 프레임을 끝까지 버린다
    Discard,
    /// ZFIN 뒤 `OO`
    OverAndOut { seen: usize },
}

/// ZMODEM 수신 세션
pub struct ReceiveSession {
    state: SessionState,
    expect: Expect,
    wire: WireBuffer,
    width: CrcWidth,
    table: EscapeTable,
    transfer: Option<TransferHandle>,
    received: Vec<String>,
    max_download_size: Option<u64>,
    rinit_flags: u8,
    show_progress: bool,
}

impl ReceiveSession {
    pub fn new(config: &Config) -> Self {
        let mut rinit_flags = flags::CANFDX | flags::CANOVIO;
        if config.prefer_crc32 {
            rinit_flags |= flags::CANFC32;
        }
        let table = if config.escape_all_controls {
            rinit_flags |= flags::ESCCTL;
            EscapeTable::zdle_all_controls()
        } else {
            EscapeTable::zdle()
        };

        Self {
            state: SessionState::Negotiating,
            expect: Expect::Header,
            wire: WireBuffer::default(),
            width: CrcWidth::Crc16,
            table,
            transfer: None,
            received: Vec::new(),
            max_download_size: config.max_download_size,
            rinit_flags,
            show_progress: config.terminal_progress,
        }
    }

    pub fn kind(&self) -> SessionKind {
        SessionKind::Receive
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 세션 시작: ZRINIT 전송
    pub fn start(&mut self, out: &mut Outbox) {
        info!("ZMODEM receive session started");
        self.send_rinit(out);
    }

    fn send_header(&self, header: Header, out: &mut Outbox) {
        out.push(Action::ToChannel(Bytes::from(
            header.encode(HeaderEncoding::Hex, &self.table),
        )));
    }

    fn send_rinit(&self, out: &mut Outbox) {
        self.send_header(Header::with_flags(HeaderKind::RInit, self.rinit_flags, 0, 0, 0), out);
    }

    /// 수신 바이트 처리
    ///
    /// 세션이 끝난 뒤 남은 바이트는 터미널로 돌려준다.
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
        loop {
            if self.state.is_finished() {
                return Ok(());
            }
            let step = match self.expect {
                Expect::Header => match self.wire.next_header()? {
                    Some((header, encoding)) => {
                        self.width = encoding.crc_width();
                        self.handle_header(header, out)
                    }
                    None => return Ok(()),
                },
                Expect::FileInfo | Expect::SInitData | Expect::Data | Expect::Discard => {
                    match self.wire.next_subpacket(self.width)? {
                        Some(subpacket) => self.handle_subpacket(subpacket, out),
                        None => return Ok(()),
                    }
                }
                Expect::OverAndOut { seen } => {
                    if seen < 2 {
                        match self.wire.peek() {
                            Some(b'O') => {
                                self.wire.skip(1);
                                self.expect = Expect::OverAndOut { seen: seen + 1 };
                                continue;
                            }
                            None => return Ok(()),
                            // `OO` 없이 끝내는 송신측도 있다
                            Some(_) => {}
                        }
                    }
                    self.finish_session(out);
                    return Ok(());
                }
            };

            match step {
                Err(e) if !e.is_fatal() => warn!("ignored: {}", e),
                other => other?,
            }
        }
    }

    fn handle_header(&mut self, header: Header, out: &mut Outbox) -> Result<()> {
        debug!("ZMODEM header {:?} (state {:?})", header.kind, self.state);
        match header.kind {
            HeaderKind::RqInit => {
                // 송신측이 ZRINIT을 못 봤다
                self.send_rinit(out);
                Ok(())
            }
            HeaderKind::SInit => {
                if header.zf0() & TESCCTL != 0 {
                    self.table = EscapeTable::zdle_all_controls();
                }
                self.expect = Expect::SInitData;
                Ok(())
            }
            HeaderKind::File => {
                if self.state == SessionState::Transferring {
                    self.expect = Expect::Discard;
                    return Err(Error::ProtocolViolation(
                        "file offer while a transfer is in progress".into(),
                    ));
                }
                self.state = SessionState::Offering;
                self.expect = Expect::FileInfo;
                Ok(())
            }
            HeaderKind::Data => {
                let Some(transfer) = &self.transfer else {
                    self.expect = Expect::Discard;
                    return Err(Error::ProtocolViolation("data without an accepted offer".into()));
                };
                if header.position() != transfer.offset as u32 {
                    return Err(Error::Framing(format!(
                        "data at offset {} but {} bytes received",
                        header.position(),
                        transfer.offset
                    )));
                }
                self.expect = Expect::Data;
                Ok(())
            }
            HeaderKind::Eof => {
                if let Some(transfer) = &self.transfer {
                    if header.position() != transfer.offset as u32 {
                        return Err(Error::Framing(format!(
                            "end of file at {} but {} bytes received",
                            header.position(),
                            transfer.offset
                        )));
                    }
                    self.finish_file(out)?;
                }
                self.state = SessionState::Negotiating;
                self.send_rinit(out);
                Ok(())
            }
            HeaderKind::Fin => {
                self.send_header(Header::with_position(HeaderKind::Fin, 0), out);
                self.state = SessionState::Closing;
                self.expect = Expect::OverAndOut { seen: 0 };
                Ok(())
            }
            HeaderKind::Abort | HeaderKind::FErr | HeaderKind::Can => Err(Error::PeerAborted),
            other => Err(Error::ProtocolViolation(format!(
                "unexpected {:?} while receiving",
                other
            ))),
        }
    }

    fn handle_subpacket(&mut self, subpacket: Subpacket, out: &mut Outbox) -> Result<()> {
        match self.expect {
            Expect::SInitData => {
                self.expect = Expect::Header;
                self.send_header(Header::with_position(HeaderKind::Ack, 0), out);
                Ok(())
            }
            Expect::FileInfo => {
                self.expect = Expect::Header;
                let descriptor = TransferDescriptor::parse(&subpacket.payload)?;
                self.handle_offer(descriptor, out);
                Ok(())
            }
            Expect::Data => self.handle_data(subpacket, out),
            Expect::Discard => {
                if subpacket.kind.ends_frame() {
                    self.expect = Expect::Header;
                }
                Ok(())
            }
            Expect::Header | Expect::OverAndOut { .. } => Ok(()),
        }
    }

    fn handle_offer(&mut self, descriptor: TransferDescriptor, out: &mut Outbox) {
        let size = descriptor.size.unwrap_or(0);
        if let Some(limit) = self.max_download_size.filter(|&limit| size > limit) {
            warn!("skipping {}: {} bytes exceeds limit {}", descriptor.name, size, limit);
            out.push(Action::Notify(TransferEvent::LimitExceeded {
                name: descriptor.name.clone(),
                size,
                limit,
            }));
            self.state = SessionState::Negotiating;
            self.send_header(Header::with_position(HeaderKind::Skip, 0), out);
            return;
        }

        info!("receiving {} ({:?} bytes)", descriptor.name, descriptor.size);
        self.transfer = Some(TransferHandle::new(descriptor));
        self.state = SessionState::Transferring;
        self.send_header(Header::with_position(HeaderKind::RPos, 0), out);
    }

    fn handle_data(&mut self, subpacket: Subpacket, out: &mut Outbox) -> Result<()> {
        let Some(transfer) = self.transfer.as_mut() else {
            return Err(Error::ProtocolViolation("data without an accepted offer".into()));
        };

        // 크기를 밝히지 않거나 줄여 말한 송신측도 제한을 넘지 못한다
        let received = transfer.offset + subpacket.payload.len() as u64;
        if let Some(limit) = self.max_download_size.filter(|&limit| received > limit) {
            let name = transfer.name().to_string();
            out.push(Action::Notify(TransferEvent::LimitExceeded {
                name: name.clone(),
                size: received,
                limit,
            }));
            return Err(Error::LimitExceeded {
                name,
                size: received,
                limit,
            });
        }

        transfer.append(&subpacket.payload);
        let offset = transfer.offset;
        let progress = Progress {
            file_name: transfer.name().to_string(),
            bytes_done: offset,
            total_bytes: transfer.expected_size().unwrap_or(offset),
            chunk_bytes: subpacket.payload.len() as u64,
        };
        if subpacket.kind.expects_ack() {
            transfer.acknowledge(offset);
        }
        let complete = transfer.is_complete();

        if self.show_progress {
            out.push(Action::ToTerminal(Bytes::from(progress_line(&progress))));
        }
        out.push(Action::Notify(TransferEvent::Progress(progress)));

        if subpacket.kind.expects_ack() {
            self.send_header(Header::with_position(HeaderKind::Ack, offset as u32), out);
        }

        if subpacket.kind.ends_frame() {
            self.expect = Expect::Header;
            if complete {
                self.finish_file(out)?;
            }
        }
        Ok(())
    }

    /// 파일 완성: 크기 검증 후 전달
    fn finish_file(&mut self, out: &mut Outbox) -> Result<()> {
        let Some(transfer) = self.transfer.take() else {
            return Ok(());
        };
        if let Some(size) = transfer.expected_size() {
            if transfer.offset != size {
                return Err(Error::Framing(format!(
                    "{}: received {} bytes, expected {}",
                    transfer.name(),
                    transfer.offset,
                    size
                )));
            }
        }
        let (descriptor, payload) = transfer.into_parts();
        info!("received {} ({} bytes)", descriptor.name, payload.len());
        if self.show_progress {
            out.push(Action::ToTerminal(Bytes::from_static(b"\r\n")));
        }
        self.received.push(descriptor.name.clone());
        out.push(Action::Notify(TransferEvent::FileReceived { descriptor, payload }));
        Ok(())
    }

    fn finish_session(&mut self, out: &mut Outbox) {
        self.state = SessionState::Ended;
        let message = if self.received.is_empty() {
            "No files received".to_string()
        } else {
            format!("Received {}", self.received.join(", "))
        };
        info!("ZMODEM receive session ended: {}", message);
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
        info!("ZMODEM receive session cancelled");
        out.push(Action::ToChannel(Bytes::from_static(&ABORT_SEQUENCE)));
        self.teardown(SessionState::Aborted, Error::UserCancelled.to_string(), out);
        true
    }

    /// 에러로 인한 중단
    pub fn abort(&mut self, err: Error, out: &mut Outbox) {
        if self.state.is_finished() {
            return;
        }
        warn!("ZMODEM receive session aborted: {}", err);
        if !matches!(err, Error::PeerAborted) {
            out.push(Action::ToChannel(Bytes::from_static(&ABORT_SEQUENCE)));
        }
        self.teardown(SessionState::Aborted, err.to_string(), out);
    }

    fn teardown(&mut self, state: SessionState, message: String, out: &mut Outbox) {
        self.state = state;
        self.transfer = None;
        self.wire.take_remaining();
        out.push(Action::Notify(TransferEvent::SessionEnded { state, message }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header;
    use crate::subpacket::{self, FrameKind};

    fn table() -> EscapeTable {
        EscapeTable::zdle()
    }

    fn bin16(header: Header) -> Vec<u8> {
        header.encode(HeaderEncoding::Bin16, &table())
    }

    fn channel_headers(out: &Outbox) -> Vec<HeaderKind> {
        out.iter()
            .filter_map(|a| match a {
                Action::ToChannel(bytes) if bytes.first() == Some(&b'*') => {
                    header::parse(bytes).ok().flatten().map(|(h, _, _)| h.kind)
                }
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

    fn offer(name: &str, size: u64) -> Vec<u8> {
        let descriptor = TransferDescriptor::new(name).unwrap().with_size(size);
        let mut wire = bin16(Header::with_position(HeaderKind::File, 0));
        wire.extend(subpacket::encode(&descriptor.encode(), FrameKind::EndAck, CrcWidth::Crc16, &table()));
        wire
    }

    fn started(config: &Config) -> (ReceiveSession, Outbox) {
        let mut session = ReceiveSession::new(config);
        let mut out = Vec::new();
        session.start(&mut out);
        (session, out)
    }

    #[test]
    fn test_start_sends_rinit_with_crc32() {
        let (session, out) = started(&Config::default());
        assert_eq!(channel_headers(&out), vec![HeaderKind::RInit]);
        let Action::ToChannel(bytes) = &out[0] else { panic!() };
        let (header, encoding, _) = header::parse(bytes).unwrap().unwrap();
        assert_eq!(encoding, HeaderEncoding::Hex);
        assert!(header.zf0() & flags::CANFC32 != 0);
        assert_eq!(session.state(), SessionState::Negotiating);
    }

    #[test]
    fn test_full_file_with_eof_and_fin() {
        let (mut session, _) = started(&Config::default());
        let mut out = Vec::new();

        session.consume(&offer("a.txt", 11), &mut out);
        assert_eq!(channel_headers(&out), vec![HeaderKind::RPos]);
        assert_eq!(session.state(), SessionState::Transferring);

        let mut data = bin16(Header::with_position(HeaderKind::Data, 0));
        data.extend(subpacket::encode(b"hello ", FrameKind::ContinueNoAck, CrcWidth::Crc16, &table()));
        data.extend(subpacket::encode(b"world", FrameKind::EndNoAck, CrcWidth::Crc16, &table()));
        data.extend(bin16(Header::with_position(HeaderKind::Eof, 11)));

        out.clear();
        // 한 바이트씩 전달해도 동일
        for b in &data {
            session.consume(std::slice::from_ref(b), &mut out);
        }
        let received: Vec<_> = events(&out)
            .into_iter()
            .filter_map(|e| match e {
                TransferEvent::FileReceived { descriptor, payload } => Some((descriptor, payload)),
                _ => None,
            })
            .collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1.as_ref(), b"hello world");
        assert_eq!(channel_headers(&out), vec![HeaderKind::RInit]);

        out.clear();
        let mut fin = Header::with_position(HeaderKind::Fin, 0).encode(HeaderEncoding::Hex, &table());
        fin.extend_from_slice(b"OO$ ");
        let leftover = session.consume(&fin, &mut out);
        assert_eq!(channel_headers(&out), vec![HeaderKind::Fin]);
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(leftover, b"$ ".to_vec());
        assert!(events(&out).iter().any(|e| matches!(
            e,
            TransferEvent::SessionEnded { state: SessionState::Ended, message } if message.contains("a.txt")
        )));
    }

    #[test]
    fn test_over_limit_offer_is_skipped() {
        let config = Config {
            max_download_size: Some(10),
            ..Config::default()
        };
        let (mut session, _) = started(&config);
        let mut out = Vec::new();
        session.consume(&offer("big.bin", 11), &mut out);
        assert_eq!(channel_headers(&out), vec![HeaderKind::Skip]);
        assert!(events(&out)
            .iter()
            .any(|e| matches!(e, TransferEvent::LimitExceeded { size: 11, limit: 10, .. })));
        assert_eq!(session.state(), SessionState::Negotiating);
    }

    #[test]
    fn test_unsized_offer_is_capped_by_limit() {
        let config = Config {
            max_download_size: Some(10),
            ..Config::default()
        };
        let (mut session, _) = started(&config);
        let mut out = Vec::new();
        let descriptor = TransferDescriptor::new("stream.log").unwrap();
        let mut wire = bin16(Header::with_position(HeaderKind::File, 0));
        wire.extend(subpacket::encode(&descriptor.encode(), FrameKind::EndAck, CrcWidth::Crc16, &table()));
        session.consume(&wire, &mut out);
        assert_eq!(session.state(), SessionState::Transferring);

        out.clear();
        let mut data = bin16(Header::with_position(HeaderKind::Data, 0));
        data.extend(subpacket::encode(b"12345678", FrameKind::ContinueNoAck, CrcWidth::Crc16, &table()));
        data.extend(subpacket::encode(b"12345678", FrameKind::EndNoAck, CrcWidth::Crc16, &table()));
        session.consume(&data, &mut out);

        assert_eq!(session.state(), SessionState::Aborted);
        let events = events(&out);
        assert!(events
            .iter()
            .any(|e| matches!(e, TransferEvent::LimitExceeded { size: 16, limit: 10, .. })));
        assert!(!events
            .iter()
            .any(|e| matches!(e, TransferEvent::FileReceived { .. })));
        assert!(out
            .iter()
            .any(|a| matches!(a, Action::ToChannel(b) if b.as_ref() == ABORT_SEQUENCE)));
    }

    #[test]
    fn test_ack_frames_are_acknowledged() {
        let (mut session, _) = started(&Config::default());
        let mut out = Vec::new();
        session.consume(&offer("a.txt", 6), &mut out);
        out.clear();

        let mut data = bin16(Header::with_position(HeaderKind::Data, 0));
        data.extend(subpacket::encode(b"abc", FrameKind::ContinueAck, CrcWidth::Crc16, &table()));
        data.extend(subpacket::encode(b"def", FrameKind::EndAck, CrcWidth::Crc16, &table()));
        session.consume(&data, &mut out);
        assert_eq!(channel_headers(&out), vec![HeaderKind::Ack, HeaderKind::Ack]);
    }

    #[test]
    fn test_data_position_mismatch_aborts() {
        let (mut session, _) = started(&Config::default());
        let mut out = Vec::new();
        session.consume(&offer("a.txt", 6), &mut out);
        out.clear();
        session.consume(&bin16(Header::with_position(HeaderKind::Data, 3)), &mut out);
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(out
            .iter()
            .any(|a| matches!(a, Action::ToChannel(b) if b.as_ref() == ABORT_SEQUENCE)));
    }

    #[test]
    fn test_peer_abort() {
        let (mut session, _) = started(&Config::default());
        let mut out = Vec::new();
        session.consume(&ABORT_SEQUENCE, &mut out);
        assert_eq!(session.state(), SessionState::Aborted);
        // 상대가 이미 중단했으므로 CAN을 보내지 않는다
        assert!(!out.iter().any(|a| matches!(a, Action::ToChannel(_))));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (mut session, _) = started(&Config::default());
        let mut out = Vec::new();
        assert!(session.cancel(&mut out));
        assert!(!session.cancel(&mut out));
        let ended = events(&out)
            .into_iter()
            .filter(|e| matches!(e, TransferEvent::SessionEnded { .. }))
            .count();
        assert_eq!(ended, 1);
        assert_eq!(session.consume(b"after", &mut out), b"after".to_vec());
    }
}
