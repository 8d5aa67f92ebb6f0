//! 서브패킷 프레이머
//!
//! 와이어 형식: `escape(payload) ZDLE <frame-end> escape(crc)`
//! CRC는 `payload ++ frame-end` 에 대해 계산한다.

use bytes::Bytes;

use crate::crc::{self, CrcWidth};
use crate::escape::{self, EscapeTable, ZDLE};
use crate::{Error, Result};

/// 프레임 종류 (frame-end 옥텟)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// ZCRCE: 파일의 마지막, ACK 없음
    EndNoAck = b'h',
    /// ZCRCG: 계속, ACK 없음
    ContinueNoAck = b'i',
    /// ZCRCQ: 계속, ACK 필요
    ContinueAck = b'j',
    /// ZCRCW: 마지막, ACK 필요
    EndAck = b'k',
}

impl FrameKind {
    pub fn from_marker(byte: u8) -> Option<Self> {
        match byte {
            b'h' => Some(FrameKind::EndNoAck),
            b'i' => Some(FrameKind::ContinueNoAck),
            b'j' => Some(FrameKind::ContinueAck),
            b'k' => Some(FrameKind::EndAck),
            _ => None,
        }
    }

    pub fn marker(self) -> u8 {
        self as u8
    }

    /// 현재 프레임 이후 헤더가 온다
    pub fn ends_frame(self) -> bool {
        matches!(self, FrameKind::EndAck | FrameKind::EndNoAck)
    }

    /// 수신측이 ACK를 보내야 한다
    pub fn expects_ack(self) -> bool {
        matches!(self, FrameKind::EndAck | FrameKind::ContinueAck)
    }
}

/// 체크섬이 붙은 전송 단위
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subpacket {
    pub payload: Bytes,
    pub kind: FrameKind,
    pub crc: Vec<u8>,
}

impl Subpacket {
    /// 페이로드로부터 서브패킷 생성
    pub fn build(payload: impl Into<Bytes>, kind: FrameKind, width: CrcWidth) -> Self {
        let payload = payload.into();
        let crc = width.compute_parts(&[&payload[..], &[kind.marker()][..]]);
        Self { payload, kind, crc }
    }

    pub fn width(&self) -> CrcWidth {
        if self.crc.len() == 4 {
            CrcWidth::Crc32
        } else {
            CrcWidth::Crc16
        }
    }

    /// 저장된 CRC 검증
    pub fn verify(&self) -> Result<()> {
        crc::verify_parts(
            self.width(),
            &[&self.payload[..], &[self.kind.marker()][..]],
            &self.crc,
        )
    }

    /// 이스케이프된 와이어 형식으로 직렬화
    pub fn serialize(&self, table: &EscapeTable) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 16);
        table.escape_into(&self.payload, &mut out);
        out.push(ZDLE);
        out.push(self.kind.marker());
        table.escape_into(&self.crc, &mut out);
        out
    }
}

/// 생성과 직렬화를 한 번에
pub fn encode(payload: &[u8], kind: FrameKind, width: CrcWidth, table: &EscapeTable) -> Vec<u8> {
    Subpacket::build(Bytes::copy_from_slice(payload), kind, width).serialize(table)
}

/// 버퍼 앞에서 서브패킷 하나를 파싱
///
/// - `Ok(Some((subpacket, consumed)))`: 성공
/// - `Ok(None)`: 데이터 부족, 입력은 소비되지 않음
/// - `Err(Error::Integrity)`: CRC 불일치
/// - `Err(Error::Framing)`: 잘못된 ZDLE 시퀀스
pub fn parse(buf: &[u8], width: CrcWidth) -> Result<Option<(Subpacket, usize)>> {
    let decoder = escape::zdle_decoder();
    let mut payload = Vec::new();
    let mut i = 0;

    let kind = loop {
        let Some(&b) = buf.get(i) else {
            return Ok(None);
        };
        if b != ZDLE {
            if !escape::is_flow_control(b) {
                payload.push(b);
            }
            i += 1;
            continue;
        }
        let Some(&code) = buf.get(i + 1) else {
            return Ok(None);
        };
        if let Some(kind) = FrameKind::from_marker(code) {
            i += 2;
            break kind;
        }
        match decoder.decode_code(code) {
            Some(raw) => {
                payload.push(raw);
                i += 2;
            }
            None => {
                return Err(Error::Framing(format!(
                    "unexpected ZDLE sequence 0x{:02X} at offset {}",
                    code, i
                )))
            }
        }
    };

    let Some((crc, consumed)) = read_escaped(buf, i, width.byte_len())? else {
        return Ok(None);
    };

    crc::verify_parts(width, &[&payload[..], &[kind.marker()][..]], &crc)?;

    Ok(Some((
        Subpacket {
            payload: Bytes::from(payload),
            kind,
            crc,
        },
        consumed,
    )))
}

/// `start` 부터 이스케이프된 옥텟 `count`개를 읽는다
///
/// 성공 시 (디코드된 바이트, 다음 위치). 데이터가 부족하면 `Ok(None)`.
pub(crate) fn read_escaped(buf: &[u8], start: usize, count: usize) -> Result<Option<(Vec<u8>, usize)>> {
    let decoder = escape::zdle_decoder();
    let mut out = Vec::with_capacity(count);
    let mut i = start;

    while out.len() < count {
        let Some(&b) = buf.get(i) else {
            return Ok(None);
        };
        if b == ZDLE {
            let Some(&code) = buf.get(i + 1) else {
                return Ok(None);
            };
            let raw = decoder.decode_code(code).ok_or_else(|| {
                Error::Framing(format!("unexpected ZDLE sequence 0x{:02X} in checksum", code))
            })?;
            out.push(raw);
            i += 2;
        } else if escape::is_flow_control(b) {
            i += 1;
        } else {
            out.push(b);
            i += 1;
        }
    }

    Ok(Some((out, i)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    const KINDS: [FrameKind; 4] = [
        FrameKind::EndNoAck,
        FrameKind::ContinueNoAck,
        FrameKind::ContinueAck,
        FrameKind::EndAck,
    ];

    #[test]
    fn test_frame_kind_flags() {
        assert!(FrameKind::EndAck.ends_frame() && FrameKind::EndAck.expects_ack());
        assert!(FrameKind::EndNoAck.ends_frame() && !FrameKind::EndNoAck.expects_ack());
        assert!(!FrameKind::ContinueAck.ends_frame() && FrameKind::ContinueAck.expects_ack());
        assert!(!FrameKind::ContinueNoAck.ends_frame() && !FrameKind::ContinueNoAck.expects_ack());
        for kind in KINDS {
            assert_eq!(FrameKind::from_marker(kind.marker()), Some(kind));
        }
    }

    #[test]
    fn test_build_and_parse() {
        let table = EscapeTable::zdle();
        for width in [CrcWidth::Crc16, CrcWidth::Crc32] {
            for kind in KINDS {
                let sp = Subpacket::build(&b"hello world"[..], kind, width);
                assert!(sp.verify().is_ok());
                let wire = sp.serialize(&table);
                let (parsed, consumed) = parse(&wire, width).unwrap().unwrap();
                assert_eq!(consumed, wire.len());
                assert_eq!(parsed.payload.as_ref(), b"hello world");
                assert_eq!(parsed.kind, kind);
                assert_eq!(parsed, sp);
            }
        }
    }

    #[test]
    fn test_parse_binary_payloads() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for table in [EscapeTable::zdle(), EscapeTable::zdle_all_controls()] {
            for _ in 0..50 {
                let len = rng.gen_range(0..2048);
                let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let wire = encode(&payload, FrameKind::ContinueNoAck, CrcWidth::Crc32, &table);
                let (parsed, consumed) = parse(&wire, CrcWidth::Crc32).unwrap().unwrap();
                assert_eq!(consumed, wire.len());
                assert_eq!(parsed.payload.as_ref(), payload.as_slice());
            }
        }
    }

    #[test]
    fn test_parse_leaves_trailing_bytes() {
        let table = EscapeTable::zdle();
        let mut wire = encode(b"abc", FrameKind::ContinueNoAck, CrcWidth::Crc16, &table);
        let first_len = wire.len();
        wire.extend(encode(b"def", FrameKind::EndNoAck, CrcWidth::Crc16, &table));

        let (first, consumed) = parse(&wire, CrcWidth::Crc16).unwrap().unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(first.payload.as_ref(), b"abc");

        let (second, rest) = parse(&wire[consumed..], CrcWidth::Crc16).unwrap().unwrap();
        assert_eq!(second.payload.as_ref(), b"def");
        assert_eq!(consumed + rest, wire.len());
    }

    #[test]
    fn test_incomplete_per_byte() {
        let table = EscapeTable::zdle();
        for width in [CrcWidth::Crc16, CrcWidth::Crc32] {
            let payload: Vec<u8> = vec![0x18, b'h', 0x11, 0x00, 0xFF, b'k', 0x7F, 0x93];
            let wire = encode(&payload, FrameKind::EndAck, width, &table);
            for k in 0..wire.len() {
                assert!(parse(&wire[..k], width).unwrap().is_none(), "prefix {}", k);
            }
            let (parsed, consumed) = parse(&wire, width).unwrap().unwrap();
            assert_eq!(consumed, wire.len());
            assert_eq!(parsed.payload.as_ref(), payload.as_slice());
        }
    }

    #[test]
    fn test_single_bit_flip_in_payload_is_invalid() {
        let table = EscapeTable::zdle();
        for width in [CrcWidth::Crc16, CrcWidth::Crc32] {
            let wire = encode(b"hello world", FrameKind::EndAck, width, &table);
            for pos in 0..11 {
                for bit in 0..8 {
                    let mut corrupted = wire.clone();
                    corrupted[pos] ^= 1 << bit;
                    assert!(
                        matches!(parse(&corrupted, width), Err(Error::Integrity { .. })),
                        "pos {} bit {}",
                        pos,
                        bit
                    );
                }
            }
        }
    }

    #[test]
    fn test_frame_kind_swap_is_invalid() {
        let table = EscapeTable::zdle();
        let mut wire = encode(b"hello world", FrameKind::EndAck, CrcWidth::Crc16, &table);
        wire[12] = FrameKind::ContinueAck.marker();
        assert!(matches!(parse(&wire, CrcWidth::Crc16), Err(Error::Integrity { .. })));
    }

    #[test]
    fn test_corrupted_crc_reports_both_values() {
        let table = EscapeTable::zdle();
        let sp = Subpacket::build(&b"hello world"[..], FrameKind::EndNoAck, CrcWidth::Crc16);
        let mut bad = sp.clone();
        bad.crc[0] ^= 0x01;
        let wire = bad.serialize(&table);
        match parse(&wire, CrcWidth::Crc16) {
            Err(Error::Integrity { expected, computed }) => {
                assert_eq!(expected, bad.crc);
                assert_eq!(computed, sp.crc);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_bad_zdle_sequence_is_framing_error() {
        let wire = [b'a', ZDLE, 0x01, b'b'];
        assert!(matches!(parse(&wire, CrcWidth::Crc16), Err(Error::Framing(_))));
    }
}
