//! 세션 공통 타입
//!
//! 세션은 I/O를 직접 수행하지 않는다. 모든 출력은 `Action`으로 outbox에 쌓이고,
//! 멀티플렉서가 순서대로 호스트에 전달한다.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::descriptor::TransferDescriptor;
use crate::escape::ZDLE;
use crate::header::{self, Header, HeaderEncoding};
use crate::subpacket::{self, Subpacket};
use crate::crc::CrcWidth;
use crate::{Error, Result};

/// 중단 시퀀스 (CAN x5 + BS x5)
pub const ABORT_SEQUENCE: [u8; 10] = [
    0x18, 0x18, 0x18, 0x18, 0x18, 0x08, 0x08, 0x08, 0x08, 0x08,
];

/// 상대 중단으로 간주하는 연속 CAN 수
const PEER_ABORT_CANS: usize = 5;

/// 세션 방향 (로컬 기준)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Send,
    Receive,
}

/// 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Negotiating,
    Offering,
    Transferring,
    Closing,
    Ended,
    Aborted,
}

impl SessionState {
    /// 더 이상 입력을 받지 않는 상태
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Aborted)
    }
}

/// 감지된 프로토콜
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// 바이너리 헤더 (ZMODEM)
    Zmodem,
    /// 텍스트 마커 (trzsz)
    Trzsz,
}

/// 원격 요청에 따른 로컬 동작
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// 원격이 받으려 한다 (로컬이 보낸다)
    Send,
    /// 원격이 보내려 한다 (로컬이 받는다)
    Receive,
    /// 원격이 디렉토리를 받으려 한다
    SendDir,
}

impl TransferMode {
    pub fn session_kind(self) -> SessionKind {
        match self {
            TransferMode::Receive => SessionKind::Receive,
            TransferMode::Send | TransferMode::SendDir => SessionKind::Send,
        }
    }
}

/// 감지 콜백에 전달되는 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub protocol: Protocol,
    pub mode: TransferMode,
    pub version: Option<String>,
    pub unique_id: Option<String>,
    pub remote_is_windows: bool,
}

/// 감지 콜백의 결정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// 멀티플렉서 타이머
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    /// 업로드 전 인터럽트 대기 종료
    UploadInterruptElapsed,
    /// 업로드 시작 대기 한도
    UploadStartDeadline,
}

/// 진행률
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub file_name: String,
    pub bytes_done: u64,
    pub total_bytes: u64,
    /// 이번 청크 크기
    pub chunk_bytes: u64,
}

/// 호스트에 알리는 전송 이벤트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// 원격이 수신 대기 중, 호스트가 `send_files`를 호출해야 한다
    SendRequested { protocol: Protocol },
    Progress(Progress),
    FileReceived {
        descriptor: TransferDescriptor,
        payload: Bytes,
    },
    FileSent { name: String, size: u64 },
    FileSkipped { name: String },
    LimitExceeded { name: String, size: u64, limit: u64 },
    /// 세션 종료 (state는 Ended 또는 Aborted)
    SessionEnded { state: SessionState, message: String },
    /// 세션과 무관한 안내
    Notice(String),
}

/// 세션이 요청하는 부수 효과
#[derive(Debug, Clone)]
pub enum Action {
    /// 완전한 프레임 단위로 채널에 쓴다
    ToChannel(Bytes),
    ToTerminal(Bytes),
    ReadChunk(ChunkRequest),
    Schedule(Duration, Timer),
    Notify(TransferEvent),
}

/// 세션 출력 큐
pub type Outbox = Vec<Action>;

/// 송신 파일 원본
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    Path(PathBuf),
}

impl FileSource {
    /// 동기 청크 읽기
    pub fn read_chunk(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        match self {
            FileSource::Memory(data) => Ok(slice_memory(data, offset, len)),
            FileSource::Path(path) => {
                let mut file = std::fs::File::open(path)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = Vec::with_capacity(len);
                file.take(len as u64).read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }

    /// 비동기 청크 읽기
    pub async fn read_chunk_async(&self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt};

        match self {
            FileSource::Memory(data) => Ok(slice_memory(data, offset, len)),
            FileSource::Path(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = Vec::with_capacity(len);
                file.take(len as u64).read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

fn slice_memory(data: &Bytes, offset: u64, len: usize) -> Bytes {
    let start = (offset as usize).min(data.len());
    let end = start.saturating_add(len).min(data.len());
    data.slice(start..end)
}

/// 보낼 파일
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub size: u64,
    pub mtime: Option<u64>,
    pub mode: Option<u32>,
    pub source: FileSource,
}

impl OutgoingFile {
    /// 메모리 데이터로 생성
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            mtime: None,
            mode: None,
            source: FileSource::Memory(data),
        }
    }

    /// 파일 경로로 생성 (메타데이터 조회)
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_file() {
            return Err(Error::Validation(format!("{} is not a regular file", path.display())));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Validation(format!("{} has no file name", path.display())))?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode() & 0o777)
        };
        #[cfg(not(unix))]
        let mode = None;

        Ok(Self {
            name,
            size: metadata.len(),
            mtime,
            mode,
            source: FileSource::Path(path.to_path_buf()),
        })
    }
}

/// 진행 중인 읽기 요청
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    /// 요청 식별자 (오래된 응답 폐기용)
    pub id: u64,
    pub file_index: usize,
    pub offset: u64,
    pub len: usize,
    pub source: FileSource,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

impl ChunkRequest {
    pub fn new(file: &OutgoingFile, file_index: usize, offset: u64, len: usize) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            file_index,
            offset,
            len,
            source: file.source.clone(),
        }
    }
}

/// 파일 하나의 전송 커서
#[derive(Debug)]
pub struct TransferHandle {
    pub descriptor: TransferDescriptor,
    /// 현재 바이트 오프셋
    pub offset: u64,
    /// 확인된 바이트 수 (단조 증가)
    acked: u64,
    buffer: BytesMut,
}

impl TransferHandle {
    pub fn new(descriptor: TransferDescriptor) -> Self {
        let capacity = descriptor.size.unwrap_or(0).min(16 * 1024 * 1024) as usize;
        Self {
            descriptor,
            offset: 0,
            acked: 0,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn expected_size(&self) -> Option<u64> {
        self.descriptor.size
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// 수신 데이터 추가
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.offset += data.len() as u64;
    }

    /// 송신 커서 이동 (버퍼 없음)
    pub fn advance(&mut self, len: u64) {
        self.offset += len;
    }

    /// 되감기 (상대의 재전송 요청)
    pub fn rewind(&mut self, offset: u64) {
        self.offset = offset;
        self.buffer.truncate(offset as usize);
    }

    pub fn acknowledge(&mut self, upto: u64) {
        self.acked = self.acked.max(upto);
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    /// 선언된 크기만큼 받았는지
    pub fn is_complete(&self) -> bool {
        matches!(self.expected_size(), Some(size) if self.offset >= size)
    }

    pub fn into_parts(self) -> (TransferDescriptor, Bytes) {
        (self.descriptor, self.buffer.freeze())
    }
}

/// ZMODEM 수신 바이트 버퍼
///
/// 헤더 앞의 잡음을 버리고, 연속된 CAN으로 상대 중단을 감지한다.
#[derive(Debug, Default)]
pub(crate) struct WireBuffer {
    buf: Vec<u8>,
    can_run: usize,
}

impl WireBuffer {
    pub fn push(&mut self, data: &[u8]) -> Result<()> {
        for &b in data {
            if b == ZDLE {
                self.can_run += 1;
                if self.can_run >= PEER_ABORT_CANS {
                    return Err(Error::PeerAborted);
                }
            } else {
                self.can_run = 0;
            }
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// 다음 헤더, 앞의 잡음은 버린다
    pub fn next_header(&mut self) -> Result<Option<(Header, HeaderEncoding)>> {
        let Some(start) = header::find_start(&self.buf) else {
            if !self.buf.is_empty() {
                trace!("discarding {} bytes of line noise", self.buf.len());
                self.buf.clear();
            }
            return Ok(None);
        };
        if start > 0 {
            trace!("discarding {} bytes before header", start);
            self.buf.drain(..start);
        }
        match header::parse(&self.buf)? {
            Some((header, encoding, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some((header, encoding)))
            }
            None => Ok(None),
        }
    }

    pub fn next_subpacket(&mut self, width: CrcWidth) -> Result<Option<Subpacket>> {
        match subpacket::parse(&self.buf, width)? {
            Some((subpacket, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(subpacket))
            }
            None => Ok(None),
        }
    }

    /// 앞의 바이트 하나 확인
    pub fn peek(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    pub fn skip(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
