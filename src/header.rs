//! ZMODEM 헤더 코덱
//!
//! - Hex: `** ZDLE B` + 16진 (type, p0..p3, crc16) + CR LF [+ XON]
//! - Bin16: `* ZDLE A` + 이스케이프 (type, p0..p3, crc16 BE)
//! - Bin32: `* ZDLE C` + 이스케이프 (type, p0..p3, crc32 LE)

use crate::crc::{self, CrcWidth};
use crate::escape::{EscapeTable, ZDLE};
use crate::subpacket::read_escaped;
use crate::{Error, Result};

/// 헤더 시작 패딩
pub const ZPAD: u8 = b'*';

/// 바이너리 CRC16 헤더 스타일
pub const ZBIN: u8 = b'A';

/// Hex 헤더 스타일
pub const ZHEX: u8 = b'B';

/// 바이너리 CRC32 헤더 스타일
pub const ZBIN32: u8 = b'C';

const XON: u8 = 0x11;

/// ZRINIT 능력 플래그 (ZF0)
pub mod flags {
    /// 전이중 가능
    pub const CANFDX: u8 = 0x01;
    /// 디스크 I/O 중 수신 가능
    pub const CANOVIO: u8 = 0x02;
    /// 브레이크 신호 전송 가능
    pub const CANBRK: u8 = 0x04;
    /// 32비트 CRC 사용 가능
    pub const CANFC32: u8 = 0x20;
    /// 모든 제어 문자 이스케이프 요청
    pub const ESCCTL: u8 = 0x40;
    /// 8번째 비트 이스케이프 요청
    pub const ESC8: u8 = 0x80;
}

/// ZSINIT의 ZF0 플래그: 송신측이 제어 문자 이스케이프를 요청
pub const TESCCTL: u8 = 0x40;

/// 헤더 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HeaderKind {
    RqInit = 0,
    RInit = 1,
    SInit = 2,
    Ack = 3,
    File = 4,
    Skip = 5,
    Nak = 6,
    Abort = 7,
    Fin = 8,
    RPos = 9,
    Data = 10,
    Eof = 11,
    FErr = 12,
    Crc = 13,
    Challenge = 14,
    Compl = 15,
    Can = 16,
    FreeCnt = 17,
    Command = 18,
    StdErr = 19,
}

impl TryFrom<u8> for HeaderKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use HeaderKind::*;
        let kinds = [
            RqInit, RInit, SInit, Ack, File, Skip, Nak, Abort, Fin, RPos, Data, Eof, FErr, Crc,
            Challenge, Compl, Can, FreeCnt, Command, StdErr,
        ];
        kinds
            .get(value as usize)
            .copied()
            .ok_or_else(|| Error::Framing(format!("unknown header type {}", value)))
    }
}

/// 헤더 인코딩 방식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderEncoding {
    Hex,
    Bin16,
    Bin32,
}

impl HeaderEncoding {
    /// 데이터 서브패킷에 쓰일 CRC 폭
    pub fn crc_width(self) -> CrcWidth {
        match self {
            HeaderEncoding::Bin32 => CrcWidth::Crc32,
            _ => CrcWidth::Crc16,
        }
    }
}

/// ZMODEM 헤더 (타입 + 4바이트 인자)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: HeaderKind,
    pub data: [u8; 4],
}

impl Header {
    pub fn new(kind: HeaderKind, data: [u8; 4]) -> Self {
        Self { kind, data }
    }

    /// 위치 헤더 (ZRPOS, ZDATA, ZEOF, ZACK ...)
    pub fn with_position(kind: HeaderKind, position: u32) -> Self {
        Self::new(kind, position.to_le_bytes())
    }

    /// 플래그 헤더 (ZF0이 마지막 바이트)
    pub fn with_flags(kind: HeaderKind, zf0: u8, zf1: u8, zf2: u8, zf3: u8) -> Self {
        Self::new(kind, [zf3, zf2, zf1, zf0])
    }

    pub fn position(&self) -> u32 {
        u32::from_le_bytes(self.data)
    }

    pub fn zf0(&self) -> u8 {
        self.data[3]
    }

    pub fn zf1(&self) -> u8 {
        self.data[2]
    }

    fn body(&self) -> [u8; 5] {
        [
            self.kind as u8,
            self.data[0],
            self.data[1],
            self.data[2],
            self.data[3],
        ]
    }

    /// 와이어 형식으로 인코딩
    pub fn encode(&self, encoding: HeaderEncoding, table: &EscapeTable) -> Vec<u8> {
        let body = self.body();
        match encoding {
            HeaderEncoding::Hex => {
                let mut raw = body.to_vec();
                raw.extend_from_slice(&crc::crc16(&body));

                let mut out = Vec::with_capacity(24);
                out.extend_from_slice(&[ZPAD, ZPAD, ZDLE, ZHEX]);
                for b in raw {
                    out.extend_from_slice(format!("{:02x}", b).as_bytes());
                }
                out.extend_from_slice(b"\r\n");
                if !matches!(self.kind, HeaderKind::Ack | HeaderKind::Fin) {
                    out.push(XON);
                }
                out
            }
            HeaderEncoding::Bin16 | HeaderEncoding::Bin32 => {
                let (style, crc) = match encoding {
                    HeaderEncoding::Bin32 => (ZBIN32, crc::crc32(&body).to_vec()),
                    _ => (ZBIN, crc::crc16(&body).to_vec()),
                };
                let mut out = vec![ZPAD, ZDLE, style];
                table.escape_into(&body, &mut out);
                table.escape_into(&crc, &mut out);
                out
            }
        }
    }
}

/// 헤더 시작 위치(`*` ZDLE 앞의 첫 ZPAD) 탐색
///
/// 버퍼 끝에 걸친 부분 시작(`*`, `**`)도 시작 후보로 돌려준다.
pub fn find_start(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] != ZPAD {
            i += 1;
            continue;
        }
        let start = i;
        while i < buf.len() && buf[i] == ZPAD {
            i += 1;
        }
        if i == buf.len() || buf[i] == ZDLE {
            return Some(start);
        }
    }
    None
}

/// 버퍼 앞의 헤더 하나를 파싱 (버퍼는 ZPAD로 시작해야 한다)
///
/// 데이터가 부족하면 `Ok(None)`.
pub fn parse(buf: &[u8]) -> Result<Option<(Header, HeaderEncoding, usize)>> {
    let mut i = 0;
    while i < buf.len() && buf[i] == ZPAD {
        i += 1;
    }
    if i == 0 {
        return Err(Error::Framing("header does not start with ZPAD".into()));
    }
    if i + 2 > buf.len() {
        return Ok(None);
    }
    if buf[i] != ZDLE {
        return Err(Error::Framing(format!("expected ZDLE, got 0x{:02X}", buf[i])));
    }
    let style = buf[i + 1];
    i += 2;

    match style {
        ZHEX => parse_hex(buf, i),
        ZBIN => parse_binary(buf, i, HeaderEncoding::Bin16),
        ZBIN32 => parse_binary(buf, i, HeaderEncoding::Bin32),
        other => Err(Error::Framing(format!("unknown header style 0x{:02X}", other))),
    }
}

fn hex_value(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::Framing(format!("invalid hex digit 0x{:02X}", c))),
    }
}

fn parse_hex(buf: &[u8], start: usize) -> Result<Option<(Header, HeaderEncoding, usize)>> {
    // 7바이트 * 2 + CR + LF
    if buf.len() < start + 16 {
        return Ok(None);
    }

    let mut raw = [0u8; 7];
    for (n, slot) in raw.iter_mut().enumerate() {
        let hi = hex_value(buf[start + n * 2])?;
        let lo = hex_value(buf[start + n * 2 + 1])?;
        *slot = (hi << 4) | lo;
    }

    let mut i = start + 14;
    if buf[i] != b'\r' || !matches!(buf[i + 1], b'\n' | 0x8A) {
        return Err(Error::Framing("hex header not terminated by CR LF".into()));
    }
    i += 2;
    if buf.get(i) == Some(&XON) {
        i += 1;
    }

    crc::verify(&raw[..5], &raw[5..])?;
    let header = header_from_body(&raw[..5])?;
    Ok(Some((header, HeaderEncoding::Hex, i)))
}

fn parse_binary(
    buf: &[u8],
    start: usize,
    encoding: HeaderEncoding,
) -> Result<Option<(Header, HeaderEncoding, usize)>> {
    let width = encoding.crc_width();
    let Some((raw, consumed)) = read_escaped(buf, start, 5 + width.byte_len())? else {
        return Ok(None);
    };
    crc::verify_parts(width, &[&raw[..5]], &raw[5..])?;
    let header = header_from_body(&raw[..5])?;
    Ok(Some((header, encoding, consumed)))
}

fn header_from_body(body: &[u8]) -> Result<Header> {
    let kind = HeaderKind::try_from(body[0])?;
    Ok(Header::new(kind, [body[1], body[2], body[3], body[4]]))
}
