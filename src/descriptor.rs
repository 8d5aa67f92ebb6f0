//! 전송 디스크립터 (파일 메타데이터)
//!
//! ZFILE 서브패킷 페이로드 형식:
//! `name NUL "size mtime(8진) mode(8진) serial files_remaining bytes_remaining" NUL`

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::{Error, Result};

/// 일반 파일 모드 비트 (S_IFREG)
pub const REGULAR_FILE_MODE: u32 = 0o100000;

/// 파일 하나에 대한 오퍼 메타데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub name: String,
    pub size: Option<u64>,
    /// 유닉스 시간 (초)
    pub mtime: Option<u64>,
    pub mode: Option<u32>,
    pub files_remaining: Option<u32>,
    pub bytes_remaining: Option<u64>,
}

impl TransferDescriptor {
    /// 이름만으로 생성 (검증 포함)
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let descriptor = Self {
            name: name.into(),
            size: None,
            mtime: None,
            mode: None,
            files_remaining: None,
            bytes_remaining: None,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Result<Self> {
        let secs = mtime
            .duration_since(UNIX_EPOCH)
            .map_err(|_| Error::Validation("mtime before 1970".into()))?
            .as_secs();
        self.mtime = Some(secs);
        Ok(self)
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// 배치 내 남은 파일 수 / 바이트 수 설정
    pub fn with_remaining(mut self, files: u32, bytes: u64) -> Result<Self> {
        self.files_remaining = Some(files);
        self.bytes_remaining = Some(bytes);
        self.validate()?;
        Ok(self)
    }

    /// 검증
    ///
    /// 프로토콜 시그니처와 비슷한 이름은 경고만 남긴다.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("name is required".into()));
        }
        if self.name.contains('\0') {
            return Err(Error::Validation("name contains NUL".into()));
        }
        if self.files_remaining == Some(0) {
            return Err(Error::Validation(
                "files_remaining of 0 is invalid; leave it absent".into(),
            ));
        }
        if looks_like_signature(self.name.as_bytes()) {
            warn!("file name {:?} resembles a ZMODEM header", self.name);
        }
        Ok(())
    }

    /// ZFILE 페이로드로 인코딩
    pub fn encode(&self) -> Vec<u8> {
        let mode = self.mode.map(|m| m | REGULAR_FILE_MODE);
        let fields = [
            self.size.map(|v| v.to_string()),
            self.mtime.map(|v| format!("{:o}", v)),
            mode.map(|v| format!("{:o}", v)),
            Some("0".to_string()),
            self.files_remaining.map(|v| v.to_string()),
            self.bytes_remaining.map(|v| v.to_string()),
        ];

        // 마지막으로 값이 있는 필드까지만 기록, 중간의 빈 값은 0 (serial 제외)
        let last = fields
            .iter()
            .enumerate()
            .filter(|(i, f)| *i != 3 && f.is_some())
            .map(|(i, _)| i + 1)
            .last()
            .unwrap_or(0);

        let info: Vec<String> = fields[..last]
            .iter()
            .map(|f| f.clone().unwrap_or_else(|| "0".to_string()))
            .collect();

        let mut out = Vec::with_capacity(self.name.len() + 64);
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.extend_from_slice(info.join(" ").as_bytes());
        out.push(0);
        out
    }

    /// ZFILE 페이로드 파싱 (0 값은 "없음"으로 취급)
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let nul = payload
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Framing("file offer without NUL terminator".into()))?;
        let name = String::from_utf8_lossy(&payload[..nul]).into_owned();

        let rest = &payload[nul + 1..];
        let info_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let info = String::from_utf8_lossy(&rest[..info_end]);
        let mut parts = info.split_ascii_whitespace();

        let size = parse_field(parts.next(), 10, "size")?;
        let mtime = parse_field(parts.next(), 8, "mtime")?.filter(|&v| v != 0);
        let mode = narrow(parse_field(parts.next(), 8, "mode")?.filter(|&v| v != 0), "mode")?;
        let _serial = parts.next();
        let files_remaining = narrow(
            parse_field(parts.next(), 10, "files_remaining")?.filter(|&v| v != 0),
            "files_remaining",
        )?;
        let bytes_remaining = parse_field(parts.next(), 10, "bytes_remaining")?;

        let descriptor = Self {
            name,
            size,
            mtime,
            mode,
            files_remaining,
            bytes_remaining,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// 경로 구성요소를 제거한 파일 이름
    pub fn base_name(&self) -> &str {
        self.name
            .rsplit(&['/', '\\'][..])
            .find(|s| !s.is_empty())
            .unwrap_or(&self.name)
    }
}

fn parse_field(value: Option<&str>, radix: u32, field: &str) -> Result<Option<u64>> {
    match value {
        None => Ok(None),
        Some(v) if v.starts_with('-') => Err(Error::Validation(format!(
            "{} must be non-negative, got {}",
            field, v
        ))),
        Some(v) => u64::from_str_radix(v, radix)
            .map(Some)
            .map_err(|_| Error::Validation(format!("invalid {}: {}", field, v))),
    }
}

fn narrow(value: Option<u64>, field: &str) -> Result<Option<u32>> {
    value
        .map(|v| {
            u32::try_from(v)
                .map_err(|_| Error::Validation(format!("{} out of range: {}", field, v)))
        })
        .transpose()
}

/// `*` ZDLE [AC] 또는 `**` ZDLE `B` 포함 여부
fn looks_like_signature(name: &[u8]) -> bool {
    name.windows(3)
        .any(|w| w[0] == b'*' && w[1] == 0x18 && (w[2] == b'A' || w[2] == b'C'))
        || name
            .windows(4)
            .any(|w| w[0] == b'*' && w[1] == b'*' && w[2] == 0x18 && w[3] == b'B')
}
