//! 엔진 설정

use crate::{Error, Result, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_DOWNLOAD_SIZE};

/// termxfer 엔진 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 바이너리 헤더(ZMODEM) 감지 활성화
    pub zmodem_enabled: bool,

    /// 텍스트 마커(trzsz) 감지 활성화
    pub magic_key_enabled: bool,

    /// 다운로드 단일 파일 최대 크기 (None이면 제한 없음)
    pub max_download_size: Option<u64>,

    /// 업로드 단일 파일 최대 크기 (None이면 제한 없음)
    pub max_upload_size: Option<u64>,

    /// 송신 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 수신 시 CRC32 광고, 상대가 허용하면 송신 시 CRC32 사용
    pub prefer_crc32: bool,

    /// 모든 제어 문자 이스케이프 (ESCCTL)
    pub escape_all_controls: bool,

    /// 원격의 quiet 플래그를 따를지 여부
    pub honor_quiet: bool,

    /// 터미널에 진행률 라인 출력
    pub terminal_progress: bool,

    /// unique id 중복 제거 캐시 크기
    pub dedupe_capacity: usize,

    /// 하트비트 주기 (밀리초), 0이면 비활성화
    pub heartbeat_interval_ms: u64,

    /// 업로드 시작 전 인터럽트 대기 (밀리초)
    pub upload_interrupt_delay_ms: u64,

    /// 업로드 시작 마커 대기 한도 (밀리초)
    pub upload_start_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zmodem_enabled: true,
            magic_key_enabled: true,
            max_download_size: Some(DEFAULT_MAX_DOWNLOAD_SIZE),
            max_upload_size: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            prefer_crc32: true,
            escape_all_controls: false,
            honor_quiet: true,
            terminal_progress: true,
            dedupe_capacity: 100,
            heartbeat_interval_ms: 30_000,   // 30초
            upload_interrupt_delay_ms: 200,
            upload_start_timeout_ms: 1_000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 설정 검증
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Validation("chunk_size must be positive".into()));
        }
        if self.dedupe_capacity == 0 {
            return Err(Error::Validation("dedupe_capacity must be positive".into()));
        }
        Ok(())
    }

    /// 원격 bufsize와 협상한 청크 크기
    pub fn negotiated_chunk_size(&self, remote_bufsize: Option<usize>) -> usize {
        match remote_bufsize {
            Some(n) if n > 0 => self.chunk_size.min(n),
            _ => self.chunk_size,
        }
    }

    /// 다운로드 크기 제한 검사
    pub fn check_download(&self, name: &str, size: u64) -> Result<()> {
        check_limit(name, size, self.max_download_size)
    }

    /// 업로드 크기 제한 검사
    pub fn check_upload(&self, name: &str, size: u64) -> Result<()> {
        check_limit(name, size, self.max_upload_size)
    }

    /// 저사양 기기용 설정
    pub fn low_resource() -> Self {
        Self {
            chunk_size: 8 * 1024,             // 8KB
            max_download_size: Some(50 * 1024 * 1024),
            prefer_crc32: false,
            dedupe_capacity: 32,
            ..Self::default()
        }
    }

    /// 고성능 기기용 설정
    pub fn high_performance() -> Self {
        Self {
            chunk_size: 128 * 1024,           // 128KB
            max_download_size: None,
            prefer_crc32: true,
            terminal_progress: false,
            ..Self::default()
        }
    }
}

fn check_limit(name: &str, size: u64, limit: Option<u64>) -> Result<()> {
    match limit {
        Some(limit) if size > limit => Err(Error::LimitExceeded {
            name: name.to_string(),
            size,
            limit,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.check_download("a.txt", 11).is_ok());
        assert!(matches!(
            config.check_download("huge.bin", DEFAULT_MAX_DOWNLOAD_SIZE + 1),
            Err(Error::LimitExceeded { .. })
        ));
        assert!(config.check_upload("huge.bin", u64::MAX).is_ok());
    }

    #[test]
    fn test_negotiated_chunk_size() {
        let config = Config::default();
        assert_eq!(config.negotiated_chunk_size(Some(1024)), 1024);
        assert_eq!(config.negotiated_chunk_size(Some(0)), config.chunk_size);
        assert_eq!(config.negotiated_chunk_size(None), config.chunk_size);
    }

    #[test]
    fn test_zero_chunk_rejected() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_presets() {
        assert!(Config::low_resource().chunk_size < Config::high_performance().chunk_size);
        assert!(Config::high_performance().max_download_size.is_none());
    }
}
