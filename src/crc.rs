//! 무결성 코덱 (CRC16 / CRC32)
//!
//! - CRC16: CCITT/XModem (poly 0x1021, init 0), big-endian 출력
//! - CRC32: 표준 CRC-32 (crc32fast), little-endian 출력

use std::sync::OnceLock;

use crate::{Error, Result};

/// 세션이 협상한 CRC 폭
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcWidth {
    Crc16,
    Crc32,
}

impl CrcWidth {
    /// 체크섬 바이트 수
    pub fn byte_len(self) -> usize {
        match self {
            CrcWidth::Crc16 => 2,
            CrcWidth::Crc32 => 4,
        }
    }

    /// 데이터의 체크섬 계산
    pub fn compute(self, data: &[u8]) -> Vec<u8> {
        match self {
            CrcWidth::Crc16 => crc16(data).to_vec(),
            CrcWidth::Crc32 => crc32(data).to_vec(),
        }
    }

    /// 여러 조각을 이어 붙인 데이터의 체크섬 계산
    pub fn compute_parts(self, parts: &[&[u8]]) -> Vec<u8> {
        match self {
            CrcWidth::Crc16 => {
                let crc = parts.iter().fold(0u16, |crc, part| crc16_update(crc, part));
                crc.to_be_bytes().to_vec()
            }
            CrcWidth::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize().to_le_bytes().to_vec()
            }
        }
    }
}

static CRC16_TABLE: OnceLock<[u16; 256]> = OnceLock::new();

fn crc16_table() -> &'static [u16; 256] {
    CRC16_TABLE.get_or_init(|| {
        let mut table = [0u16; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let mut crc = (i as u16) << 8;
            for _ in 0..8 {
                crc = if crc & 0x8000 != 0 {
                    (crc << 1) ^ 0x1021
                } else {
                    crc << 1
                };
            }
            *slot = crc;
        }
        table
    })
}

/// CRC16 누적 갱신
pub fn crc16_update(crc: u16, data: &[u8]) -> u16 {
    let table = crc16_table();
    data.iter().fold(crc, |crc, &b| {
        (crc << 8) ^ table[(((crc >> 8) as u8) ^ b) as usize]
    })
}

/// CRC16 (big-endian 2바이트)
pub fn crc16(data: &[u8]) -> [u8; 2] {
    crc16_update(0, data).to_be_bytes()
}

/// CRC32 (little-endian 4바이트)
pub fn crc32(data: &[u8]) -> [u8; 4] {
    crc32fast::hash(data).to_le_bytes()
}

/// 체크섬 재계산 후 비교
///
/// 불일치 시 기대값과 계산값을 모두 담은 `Error::Integrity`를 반환한다.
pub fn verify(data: &[u8], expected: &[u8]) -> Result<()> {
    let width = match expected.len() {
        2 => CrcWidth::Crc16,
        4 => CrcWidth::Crc32,
        n => return Err(Error::Framing(format!("unsupported CRC length {}", n))),
    };
    verify_parts(width, &[data], expected)
}

/// 여러 조각에 대한 체크섬 검증
pub fn verify_parts(width: CrcWidth, parts: &[&[u8]], expected: &[u8]) -> Result<()> {
    let computed = width.compute_parts(parts);
    if computed.as_slice() != expected {
        return Err(Error::Integrity {
            expected: expected.to_vec(),
            computed,
        });
    }
    Ok(())
}
