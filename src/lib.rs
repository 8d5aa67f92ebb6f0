//! # termxfer
//!
//! 대화형 터미널 바이트 스트림 안에서 동작하는 파일 전송 엔진
//!
//! ## 핵심 특징
//! - **ZMODEM**: 출력 스트림에서 `ZRQINIT`/`ZRINIT` 헤더를 감지해 송수신 세션 시작
//! - **trzsz 마커**: `::TRZSZ:TRANSFER:` 텍스트 마커 감지, 줄 단위 프로토콜로 전송
//! - **I/O 없는 세션**: 세션은 `Action`만 만들고, 멀티플렉서가 호스트에 전달
//! - **채널 코덱**: 기본 웹소켓 / Kubernetes exec 채널
//! - **tokio 드라이버**: mpsc 명령 큐 + 비동기 파일 읽기 + 하트비트

pub mod addon;
pub mod config;
pub mod crc;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod escape;
pub mod header;
pub mod magic_key;
pub mod magic_session;
pub mod message;
pub mod receiver;
pub mod sender;
pub mod sentry;
pub mod session;
pub mod sink;
pub mod stats;
pub mod subpacket;

pub use addon::{Addon, Host};
pub use config::Config;
pub use descriptor::TransferDescriptor;
pub use driver::{AddonCmd, AddonHandle, DriverOutput};
pub use error::{Error, Result};
pub use escape::EscapeTable;
pub use magic_key::{MagicKeyRecord, MarkerScanner, UniqueIdCache};
pub use magic_session::{MagicFilter, MagicSession};
pub use message::{ChannelMessage, DefaultCodec, Frame, Inbound, K8sChannelCodec, MessageCodec};
pub use receiver::ReceiveSession;
pub use sender::SendSession;
pub use sentry::{Sentry, ZmodemSession};
pub use session::{
    Action, Decision, Detection, OutgoingFile, Progress, Protocol, SessionKind, SessionState,
    TransferEvent, TransferMode,
};
pub use sink::{DirectorySink, OverwritePolicy};
pub use stats::TransferStats;

/// 크레이트 버전 (trzsz ACT 메시지에 사용)
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 기본 송신 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024; // 32KB

/// 기본 다운로드 크기 제한 (바이트)
pub const DEFAULT_MAX_DOWNLOAD_SIZE: u64 = 200 * 1024 * 1024; // 200MB
