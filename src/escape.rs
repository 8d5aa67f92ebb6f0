//! 이스케이프 코덱
//!
//! 채널이 특별하게 해석할 수 있는 옥텟을 2바이트 시퀀스로 치환한다.
//! - ZDLE 테이블: ZMODEM 서브패킷/헤더용 (지시자 0x18)
//! - 최소/확장 테이블: 텍스트 마커 모드의 바이너리 DATA용 (지시자 0xEE)

use std::sync::OnceLock;

/// ZMODEM 이스케이프 지시자 (CAN)
pub const ZDLE: u8 = 0x18;

/// 텍스트 마커 모드 이스케이프 지시자
pub const MAGIC_ESCAPE: u8 = 0xEE;

/// 0x7F 치환 코드
pub const ZRUB0: u8 = b'l';

/// 0xFF 치환 코드
pub const ZRUB1: u8 = b'm';

/// 항상 ZDLE 이스케이프되는 옥텟 (ZDLE, DLE, XON, XOFF 및 상위 비트 형태)
const ZDLE_ALWAYS: [u8; 7] = [0x18, 0x10, 0x11, 0x13, 0x90, 0x91, 0x93];

/// 확장 테이블에 추가되는 제어 옥텟
const EXTENDED_EXTRA: [u8; 5] = [0x02, 0x10, 0x1B, 0x1D, 0x9D];

/// 단일 옥텟 -> 2옥텟 치환 테이블
///
/// 모든 치환 시퀀스는 지시자로 시작하고, 두 번째 옥텟으로 원래 값이 유일하게 결정된다.
#[derive(Clone)]
pub struct EscapeTable {
    indicator: u8,
    encode: [Option<u8>; 256],
    decode: [Option<u8>; 256],
}

impl std::fmt::Debug for EscapeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reserved: Vec<u8> = (0..=255u8).filter(|&b| self.encode[b as usize].is_some()).collect();
        f.debug_struct("EscapeTable")
            .field("indicator", &self.indicator)
            .field("reserved", &reserved)
            .finish()
    }
}

impl EscapeTable {
    fn empty(indicator: u8) -> Self {
        Self {
            indicator,
            encode: [None; 256],
            decode: [None; 256],
        }
    }

    fn insert(&mut self, raw: u8, code: u8) {
        self.encode[raw as usize] = Some(code);
        self.decode[code as usize] = Some(raw);
    }

    /// 최소 테이블 (2개 항목)
    pub fn minimal() -> Self {
        let mut table = Self::empty(MAGIC_ESCAPE);
        table.insert(MAGIC_ESCAPE, MAGIC_ESCAPE);
        table.insert(0x7E, 0x31);
        table
    }

    /// 확장 테이블 (최소 + 제어 옥텟 5개)
    pub fn extended() -> Self {
        let mut table = Self::minimal();
        for (i, &raw) in EXTENDED_EXTRA.iter().enumerate() {
            table.insert(raw, 0x41 + i as u8);
        }
        table
    }

    /// ZMODEM 기본 ZDLE 테이블
    pub fn zdle() -> Self {
        let mut table = Self::empty(ZDLE);
        for &raw in ZDLE_ALWAYS.iter() {
            table.insert(raw, raw ^ 0x40);
        }
        table.accept_zdle_codes();
        table
    }

    /// 모든 제어 문자를 이스케이프하는 ZDLE 테이블 (ESCCTL)
    pub fn zdle_all_controls() -> Self {
        let mut table = Self::empty(ZDLE);
        for raw in (0x00..=0x1Fu8).chain(0x80..=0x9F) {
            table.insert(raw, raw ^ 0x40);
        }
        table.insert(0x7F, ZRUB0);
        table.insert(0xFF, ZRUB1);
        table.accept_zdle_codes();
        table
    }

    /// 상대가 어떤 옥텟을 이스케이프했든 디코드할 수 있도록 한다
    fn accept_zdle_codes(&mut self) {
        for code in (0x40..=0x5Fu8).chain(0xC0..=0xDF) {
            self.decode[code as usize] = Some(code ^ 0x40);
        }
        self.decode[ZRUB0 as usize] = Some(0x7F);
        self.decode[ZRUB1 as usize] = Some(0xFF);
    }

    /// 지시자 옥텟
    pub fn indicator(&self) -> u8 {
        self.indicator
    }

    /// 이스케이프 대상 여부
    pub fn is_reserved(&self, byte: u8) -> bool {
        self.encode[byte as usize].is_some()
    }

    /// 지시자 다음 옥텟을 원래 값으로 복원
    pub fn decode_code(&self, code: u8) -> Option<u8> {
        self.decode[code as usize]
    }

    /// `out` 뒤에 이스케이프 결과 추가
    pub fn escape_into(&self, data: &[u8], out: &mut Vec<u8>) {
        out.reserve(data.len() + data.len() / 8);
        for &b in data {
            match self.encode[b as usize] {
                Some(code) => {
                    out.push(self.indicator);
                    out.push(code);
                }
                None => out.push(b),
            }
        }
    }

    /// 이스케이프
    pub fn escape(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        self.escape_into(data, &mut out);
        out
    }

    /// 언이스케이프 (escape의 왼쪽 역함수)
    ///
    /// 알 수 없는 시퀀스나 끝에 남은 지시자는 그대로 통과시킨다.
    pub fn unescape(&self, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        let mut i = 0;
        while i < data.len() {
            let b = data[i];
            if b == self.indicator && i + 1 < data.len() {
                if let Some(raw) = self.decode[data[i + 1] as usize] {
                    out.push(raw);
                    i += 2;
                    continue;
                }
            }
            out.push(b);
            i += 1;
        }
        out
    }
}

/// ZDLE 디코드용 공유 테이블
///
/// 디코드 맵은 기본/ESCCTL 테이블이 동일하므로 수신측은 항상 이 테이블을 쓴다.
pub fn zdle_decoder() -> &'static EscapeTable {
    static TABLE: OnceLock<EscapeTable> = OnceLock::new();
    TABLE.get_or_init(EscapeTable::zdle)
}

/// 흐름 제어 옥텟 (XON/XOFF 및 상위 비트 형태), 수신 시 무시
pub fn is_flow_control(byte: u8) -> bool {
    matches!(byte, 0x11 | 0x13 | 0x91 | 0x93)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn all_tables() -> Vec<EscapeTable> {
        vec![
            EscapeTable::minimal(),
            EscapeTable::extended(),
            EscapeTable::zdle(),
            EscapeTable::zdle_all_controls(),
        ]
    }

    #[test]
    fn test_minimal_table() {
        let table = EscapeTable::minimal();
        assert_eq!(table.escape(&[0xEE, 0x7E, 0x41]), vec![0xEE, 0xEE, 0xEE, 0x31, 0x41]);
        assert_eq!(table.escape(&[0x02, 0x1B]), vec![0x02, 0x1B]);
    }

    #[test]
    fn test_extended_table() {
        let table = EscapeTable::extended();
        assert_eq!(
            table.escape(&[0x02, 0x10, 0x1B, 0x1D, 0x9D]),
            vec![0xEE, 0x41, 0xEE, 0x42, 0xEE, 0x43, 0xEE, 0x44, 0xEE, 0x45]
        );
    }

    #[test]
    fn test_zdle_table() {
        let table = EscapeTable::zdle();
        assert_eq!(table.escape(&[0x18]), vec![0x18, 0x58]);
        assert_eq!(table.escape(&[0x11, 0x93]), vec![0x18, 0x51, 0x18, 0xD3]);
        // 일반 제어 문자는 그대로
        assert_eq!(table.escape(&[0x0D, 0x7F]), vec![0x0D, 0x7F]);

        let all = EscapeTable::zdle_all_controls();
        assert_eq!(all.escape(&[0x0D, 0x7F, 0xFF]), vec![0x18, 0x4D, 0x18, ZRUB0, 0x18, ZRUB1]);
    }

    #[test]
    fn test_zdle_codes_never_collide_with_frame_ends() {
        let table = EscapeTable::zdle_all_controls();
        for code in b'h'..=b'k' {
            assert!(table.decode_code(code).is_none());
        }
    }

    #[test]
    fn test_zdle_decodes_foreign_escapes() {
        // 기본 테이블도 ESCCTL로 이스케이프된 입력을 복원
        let table = EscapeTable::zdle();
        assert_eq!(table.unescape(&[0x18, 0x4D, 0x18, ZRUB1]), vec![0x0D, 0xFF]);
    }

    #[test]
    fn test_unescape_passthrough() {
        let table = EscapeTable::minimal();
        // 알 수 없는 시퀀스 + 끝의 지시자
        assert_eq!(table.unescape(&[0xEE, 0x99, 0xEE]), vec![0xEE, 0x99, 0xEE]);
    }

    #[test]
    fn test_roundtrip_edge_inputs() {
        for table in all_tables() {
            let ind = table.indicator();
            let inputs: Vec<Vec<u8>> = vec![
                vec![],
                vec![ind],
                vec![ind, ind, ind],
                vec![ind, 0x31, ind, 0x41, ind, 0x58],
                (0..=255u8).collect(),
            ];
            for input in inputs {
                assert_eq!(table.unescape(&table.escape(&input)), input, "{:?}", table);
            }
        }
    }

    #[test]
    fn test_roundtrip_random() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for table in all_tables() {
            for _ in 0..200 {
                let len = rng.gen_range(0..512);
                let input: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                let escaped = table.escape(&input);
                assert!(escaped.len() >= input.len());
                assert_eq!(table.unescape(&escaped), input);
            }
        }
    }
}
