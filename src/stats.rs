//! 전송 통계

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::session::{Progress, TransferEvent};

/// 청크 기록
#[derive(Debug, Clone, Copy)]
struct ChunkArrival {
    timestamp: Instant,
    size: usize,
}

/// 최근 청크 기반 처리율 윈도우
#[derive(Debug, Clone)]
pub struct RateWindow {
    arrivals: VecDeque<ChunkArrival>,
    window_size: usize,
}

impl RateWindow {
    pub fn new(window_size: usize) -> Self {
        Self {
            arrivals: VecDeque::with_capacity(window_size),
            window_size: window_size.max(2),
        }
    }

    /// 청크 기록
    pub fn record(&mut self, size: usize) {
        if self.arrivals.len() >= self.window_size {
            self.arrivals.pop_front();
        }
        self.arrivals.push_back(ChunkArrival {
            timestamp: Instant::now(),
            size,
        });
    }

    /// 바이트 처리율 계산 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let (Some(first), Some(last)) = (self.arrivals.front(), self.arrivals.back()) else {
            return 0.0;
        };
        let duration = last.timestamp.duration_since(first.timestamp);
        if self.arrivals.len() < 2 || duration.is_zero() {
            return 0.0;
        }

        // 첫 청크는 구간 시작점
        let total_size: usize = self.arrivals.iter().skip(1).map(|a| a.size).sum();
        total_size as f64 / duration.as_secs_f64()
    }

    pub fn reset(&mut self) {
        self.arrivals.clear();
    }
}

/// 전체 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 세션 수
    pub sessions: u64,

    /// 완료된 파일 수 (송수신)
    pub files_completed: u64,

    /// 건너뛴 파일 수
    pub files_skipped: u64,

    /// 크기 제한으로 거부된 파일 수
    pub files_rejected: u64,

    /// 총 전송 바이트
    pub total_bytes: u64,

    /// 총 청크 수
    pub total_chunks: u64,

    /// 중단된 세션 수
    pub aborted_sessions: u64,

    /// 최근 처리율 윈도우
    pub rate: RateWindow,
}

impl TransferStats {
    pub fn new(window_size: usize) -> Self {
        Self {
            start_time: Instant::now(),
            sessions: 0,
            files_completed: 0,
            files_skipped: 0,
            files_rejected: 0,
            total_bytes: 0,
            total_chunks: 0,
            aborted_sessions: 0,
            rate: RateWindow::new(window_size),
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 전체 처리율 (bytes/sec)
    pub fn overall_throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / elapsed
    }

    /// 이벤트 반영
    pub fn record_event(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::Progress(progress) => {
                self.total_chunks += 1;
                self.total_bytes += progress.chunk_bytes;
                self.rate.record(progress.chunk_bytes as usize);
            }
            TransferEvent::FileReceived { .. } | TransferEvent::FileSent { .. } => {
                self.files_completed += 1;
            }
            TransferEvent::FileSkipped { .. } => self.files_skipped += 1,
            TransferEvent::LimitExceeded { .. } => self.files_rejected += 1,
            TransferEvent::SessionEnded { state, .. } => {
                self.sessions += 1;
                if *state == crate::session::SessionState::Aborted {
                    self.aborted_sessions += 1;
                }
                self.rate.reset();
            }
            TransferEvent::SendRequested { .. } | TransferEvent::Notice(_) => {}
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sessions: {} ({} aborted) | Files: {} done, {} skipped, {} rejected | Bytes: {} | Throughput: {:.2} MB/s",
            self.elapsed().as_secs_f64(),
            self.sessions,
            self.aborted_sessions,
            self.files_completed,
            self.files_skipped,
            self.files_rejected,
            self.total_bytes,
            self.overall_throughput() / 1_000_000.0,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(32)
    }
}

/// 사람이 읽기 쉬운 바이트 단위
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// 터미널에 덮어쓰는 진행률 라인 (`\r` + 줄 지우기)
pub fn progress_line(progress: &Progress) -> String {
    let percent = if progress.total_bytes == 0 {
        100.0
    } else {
        progress.bytes_done as f64 * 100.0 / progress.total_bytes as f64
    };
    format!(
        "\r\x1b[K{} {:.2}% {}/{}",
        progress.file_name,
        percent,
        format_bytes(progress.bytes_done),
        format_bytes(progress.total_bytes)
    )
}
