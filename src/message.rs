//! 채널 메시지 정의와 와이어 코덱
//!
//! 터미널 쪽 메시지(data/binary/resize/heartbeat)를 채널 프레임으로 바꾸고,
//! 채널 프레임을 터미널 출력으로 되돌린다.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;

/// 채널로 보내는 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// 키 입력 (텍스트)
    Data(String),

    /// 바이너리 입력 (마우스 이벤트, 전송 프레임)
    Binary(Bytes),

    /// 터미널 크기 변경
    Resize { cols: u16, rows: u16 },

    /// 연결 유지
    Heartbeat,
}

/// 채널 프레임 (웹소켓 텍스트/바이너리 메시지에 대응)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// 디코드된 채널 입력
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// 터미널 출력 바이트
    Data(Bytes),

    /// 원격 프로세스 종료 / 서비스 에러
    Exit { code: Option<i32>, message: String },

    /// 하트비트 응답 등 무시할 프레임
    Ignore,
}

/// 메시지 <-> 프레임 변환
pub trait MessageCodec: Send {
    /// `None`이면 보내지 않는다
    fn encode(&self, message: ChannelMessage) -> Option<Frame>;

    fn decode(&self, frame: Frame) -> Result<Inbound>;
}

/// 기본 코덱: data/binary만 그대로 전달
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

#[derive(Deserialize)]
struct TypedMessage {
    #[serde(rename = "type")]
    kind: String,
}

impl MessageCodec for DefaultCodec {
    fn encode(&self, message: ChannelMessage) -> Option<Frame> {
        match message {
            ChannelMessage::Data(text) => Some(Frame::Text(text)),
            ChannelMessage::Binary(bytes) => Some(Frame::Binary(bytes)),
            ChannelMessage::Resize { .. } | ChannelMessage::Heartbeat => None,
        }
    }

    fn decode(&self, frame: Frame) -> Result<Inbound> {
        match frame {
            Frame::Text(text) => {
                if let Ok(typed) = serde_json::from_str::<TypedMessage>(&text) {
                    if typed.kind == "heartbeat" {
                        debug!("heartbeat from server");
                        return Ok(Inbound::Ignore);
                    }
                }
                Ok(Inbound::Data(Bytes::from(text)))
            }
            Frame::Binary(bytes) => Ok(Inbound::Data(bytes)),
        }
    }
}

/// Kubernetes exec 채널 번호
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum K8sChannel {
    StdIn = 0,
    StdOut = 1,
    StdErr = 2,
    ServiceError = 3,
    Resize = 4,
}

impl K8sChannel {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(K8sChannel::StdIn),
            1 => Some(K8sChannel::StdOut),
            2 => Some(K8sChannel::StdErr),
            3 => Some(K8sChannel::ServiceError),
            4 => Some(K8sChannel::Resize),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct K8sResize {
    #[serde(rename = "Width")]
    width: u16,
    #[serde(rename = "Height")]
    height: u16,
}

/// 서비스 에러 채널의 status 객체 (일부 필드만)
#[derive(Deserialize)]
struct K8sStatus {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
}

/// Kubernetes exec 코덱 (`channel.k8s.io` / `base64.channel.k8s.io`)
///
/// 첫 옥텟(base64 모드는 첫 문자)이 채널 번호다. 하트비트는 빈 stdin 프레임.
#[derive(Debug, Clone, Copy, Default)]
pub struct K8sChannelCodec {
    pub base64: bool,
}

impl K8sChannelCodec {
    pub fn new(base64: bool) -> Self {
        Self { base64 }
    }

    fn frame(&self, channel: K8sChannel, payload: &[u8]) -> Frame {
        if self.base64 {
            Frame::Text(format!("{}{}", channel as u8, STANDARD.encode(payload)))
        } else {
            let mut buf = BytesMut::with_capacity(payload.len() + 1);
            buf.put_u8(channel as u8);
            buf.put_slice(payload);
            Frame::Binary(buf.freeze())
        }
    }

    fn split(&self, frame: Frame) -> Result<Option<(u8, Bytes)>> {
        match frame {
            Frame::Text(text) if self.base64 => {
                let mut chars = text.chars();
                let Some(channel) = chars.next().and_then(|c| c.to_digit(10)) else {
                    return Ok(None);
                };
                Ok(Some((channel as u8, Bytes::from(STANDARD.decode(chars.as_str())?))))
            }
            Frame::Text(text) => {
                let bytes = Bytes::from(text);
                Ok(bytes.first().map(|&c| (c, bytes.slice(1..))))
            }
            Frame::Binary(bytes) => Ok(bytes.first().map(|&c| (c, bytes.slice(1..)))),
        }
    }
}

impl MessageCodec for K8sChannelCodec {
    fn encode(&self, message: ChannelMessage) -> Option<Frame> {
        match message {
            ChannelMessage::Data(text) => Some(self.frame(K8sChannel::StdIn, text.as_bytes())),
            ChannelMessage::Binary(bytes) => Some(self.frame(K8sChannel::StdIn, &bytes)),
            ChannelMessage::Resize { cols, rows } => {
                let json = serde_json::to_vec(&K8sResize {
                    width: cols,
                    height: rows,
                })
                .ok()?;
                Some(self.frame(K8sChannel::Resize, &json))
            }
            ChannelMessage::Heartbeat => Some(self.frame(K8sChannel::StdIn, &[])),
        }
    }

    fn decode(&self, frame: Frame) -> Result<Inbound> {
        let Some((channel, payload)) = self.split(frame)? else {
            return Ok(Inbound::Ignore);
        };
        match K8sChannel::from_u8(channel) {
            // 서버는 stdin 채널로 하트비트에 응답한다
            Some(K8sChannel::StdIn) => Ok(Inbound::Ignore),
            Some(K8sChannel::StdOut | K8sChannel::StdErr) => Ok(Inbound::Data(payload)),
            Some(K8sChannel::ServiceError) => Ok(service_error(&payload)),
            Some(K8sChannel::Resize) | None => {
                warn!("unhandled message channel {}", channel);
                Ok(Inbound::Ignore)
            }
        }
    }
}

/// 서비스 에러 메시지에서 종료 코드 추출
fn service_error(payload: &[u8]) -> Inbound {
    let text = String::from_utf8_lossy(payload).into_owned();
    let (status, message) = match serde_json::from_str::<K8sStatus>(&text) {
        Ok(status) => (status.status, status.message),
        Err(_) => (String::new(), text),
    };
    if status == "Success" {
        return Inbound::Exit {
            code: Some(0),
            message: "exit code 0".into(),
        };
    }

    match exit_code(&message) {
        Some(137) => Inbound::Exit {
            code: Some(137),
            message: "exit code 137: pod terminated".into(),
        },
        Some(code) => Inbound::Exit {
            code: Some(code),
            message: format!("exit code {}: {}", code, message),
        },
        None => Inbound::Exit { code: None, message },
    }
}

/// `exit code N` 패턴
fn exit_code(message: &str) -> Option<i32> {
    let idx = message.rfind("exit code ")?;
    let digits: String = message[idx + "exit code ".len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
