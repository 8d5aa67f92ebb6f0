//! 텍스트 마커 감지
//!
//! 마커 형식: `::TRZSZ:TRANSFER:<S|R|D>:<major.minor.patch>[:<unique id>]`
//! 마커 뒤에는 `[0-9:.]`가 아닌 종료 옥텟이 와야 한다.

use std::collections::VecDeque;

use tracing::debug;

use crate::session::{Detection, Protocol, TransferMode};

/// 마커 접두사
pub const MARKER_PREFIX: &[u8] = b"::TRZSZ:TRANSFER:";

/// 청크 경계에 걸친 마커를 위해 보존하는 최대 꼬리 길이
const MAX_TAIL: usize = 96;

/// 파싱된 마커
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicKeyRecord {
    pub mode: TransferMode,
    pub version: String,
    /// `:` 뒤의 숫자열
    pub unique_id: Option<String>,
}

impl MagicKeyRecord {
    /// 원격 셸이 윈도우인지 (id `1` 또는 `10`으로 끝나는 13자리)
    pub fn remote_is_windows(&self) -> bool {
        match self.unique_id.as_deref() {
            Some("1") => true,
            Some(id) => id.len() == 13 && id.ends_with("10"),
            None => false,
        }
    }

    pub fn detection(&self) -> Detection {
        Detection {
            protocol: Protocol::Trzsz,
            mode: self.mode,
            version: Some(self.version.clone()),
            unique_id: self.unique_id.clone(),
            remote_is_windows: self.remote_is_windows(),
        }
    }
}

/// 접두사 뒤 부분 파싱 결과
enum Parsed {
    Record(MagicKeyRecord),
    /// 종료 옥텟 전에 데이터가 끝남
    Incomplete,
    Invalid,
}

fn digits(buf: &[u8], i: &mut usize) -> Option<usize> {
    let start = *i;
    while *i < buf.len() && buf[*i].is_ascii_digit() {
        *i += 1;
    }
    (*i > start).then_some(*i - start)
}

/// 접두사 바로 뒤부터 파싱
fn parse_after_prefix(buf: &[u8]) -> Parsed {
    let mut i = 0;
    let Some(&mode) = buf.first() else {
        return Parsed::Incomplete;
    };
    let mode = match mode {
        b'S' => TransferMode::Receive,
        b'R' => TransferMode::Send,
        b'D' => TransferMode::SendDir,
        _ => return Parsed::Invalid,
    };
    i += 1;

    match buf.get(i) {
        None => return Parsed::Incomplete,
        Some(b':') => i += 1,
        Some(_) => return Parsed::Invalid,
    }

    // major.minor.patch
    let version_start = i;
    for part in 0..3 {
        if digits(buf, &mut i).is_none() {
            return if i == buf.len() { Parsed::Incomplete } else { Parsed::Invalid };
        }
        if part < 2 {
            match buf.get(i) {
                None => return Parsed::Incomplete,
                Some(b'.') => i += 1,
                Some(_) => return Parsed::Invalid,
            }
        }
    }
    let version_end = i;

    let mut unique_id = None;
    if buf.get(i) == Some(&b':') {
        i += 1;
        let id_start = i;
        if digits(buf, &mut i).is_some() {
            unique_id = Some(String::from_utf8_lossy(&buf[id_start..i]).into_owned());
        } else if i == buf.len() {
            return Parsed::Incomplete;
        }
    }

    match buf.get(i) {
        None => Parsed::Incomplete,
        Some(b) if b.is_ascii_digit() || *b == b':' || *b == b'.' => Parsed::Invalid,
        Some(_) => Parsed::Record(MagicKeyRecord {
            mode,
            version: String::from_utf8_lossy(&buf[version_start..version_end]).into_owned(),
            unique_id,
        }),
    }
}

/// 청크 단위로 마커를 찾는 스캐너
///
/// 마지막 마커 후보(또는 접두사의 앞부분)를 꼬리로 보존해서
/// 경계에 걸친 마커도 한 번만 감지한다.
#[derive(Debug, Default)]
pub struct MarkerScanner {
    tail: Vec<u8>,
}

impl MarkerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// 데이터 추가 후 완성된 마커를 모두 반환
    pub fn scan(&mut self, data: &[u8]) -> Vec<MagicKeyRecord> {
        let mut buf = std::mem::take(&mut self.tail);
        buf.extend_from_slice(data);

        let mut records = Vec::new();
        let mut pos = 0;
        while let Some(offset) = find(&buf[pos..], MARKER_PREFIX) {
            let start = pos + offset;
            let body = start + MARKER_PREFIX.len();
            match parse_after_prefix(&buf[body..]) {
                Parsed::Record(record) => {
                    debug!("magic key marker: {:?}", record);
                    records.push(record);
                    pos = body;
                }
                Parsed::Incomplete => {
                    if buf.len() - start <= MAX_TAIL {
                        self.tail = buf[start..].to_vec();
                    }
                    return records;
                }
                Parsed::Invalid => pos = body,
            }
        }

        // 접두사 앞부분으로 끝나면 보존
        let rest = &buf[pos..];
        if let Some(n) = (1..MARKER_PREFIX.len())
            .rev()
            .find(|&n| n <= rest.len() && rest[rest.len() - n..] == MARKER_PREFIX[..n])
        {
            self.tail = rest[rest.len() - n..].to_vec();
        }
        records
    }

    pub fn reset(&mut self) {
        self.tail.clear();
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// 최근 unique id 캐시
///
/// 같은 id의 마커가 다시 출력되어도(화면 다시 그리기 등) 한 번만 감지한다.
/// 가득 차면 오래된 절반을 버린다.
#[derive(Debug)]
pub struct UniqueIdCache {
    ids: VecDeque<String>,
    capacity: usize,
    windows_shell: bool,
}

impl UniqueIdCache {
    pub fn new(capacity: usize, windows_shell: bool) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
            windows_shell,
        }
    }

    /// 이미 본 id면 true, 아니면 기록 후 false
    pub fn check_and_insert(&mut self, unique_id: Option<&str>) -> bool {
        let Some(id) = unique_id else {
            return false;
        };
        if id.len() < 8 {
            return false;
        }
        // 로컬이 윈도우가 아니면 `00`으로 끝나는 13자리 id는 재사용된다
        if !self.windows_shell && id.len() == 13 && id.ends_with("00") {
            return false;
        }
        if self.ids.iter().any(|seen| seen == id) {
            return true;
        }
        if self.ids.len() >= self.capacity {
            let keep = self.capacity / 2;
            let drop = self.ids.len() - keep;
            self.ids.drain(..drop);
        }
        self.ids.push_back(id.to_string());
        false
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
