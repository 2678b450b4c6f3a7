//! 控制器与Worker之间的线路协议
//!
//! 每一帧要么是一个控制信号（JSON字符串 `"HELLO"` 等），
//! 要么是一个命令信封：
//!
//! ```json
//! {"command": "trun", "state": 1, "id": 7, "code": 0, "data": {"run_id": 7}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{SawError, SawResult};

/// 命令携带的数据
pub type CommandData = Map<String, Value>;

/// 命令信封中必须出现的键
pub const ENVELOPE_KEYS: [&str; 5] = ["command", "state", "id", "code", "data"];

/// 命令生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CommandState {
    New,
    Running,
    Resulted,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::New => "NEW",
            CommandState::Running => "RUNNING",
            CommandState::Resulted => "RESULTED",
        }
    }
}

impl TryFrom<u8> for CommandState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CommandState::New),
            1 => Ok(CommandState::Running),
            2 => Ok(CommandState::Resulted),
            other => Err(format!("无效的命令状态: {other}")),
        }
    }
}

impl From<CommandState> for u8 {
    fn from(state: CommandState) -> Self {
        match state {
            CommandState::New => 0,
            CommandState::Running => 1,
            CommandState::Resulted => 2,
        }
    }
}

/// 命令结果码, 只有在 `Resulted` 状态下才有意义
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum CommandCode {
    Void,
    Success,
    Error,
}

impl TryFrom<u8> for CommandCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0 => Ok(CommandCode::Void),
            1 => Ok(CommandCode::Success),
            2 => Ok(CommandCode::Error),
            other => Err(format!("无效的命令结果码: {other}")),
        }
    }
}

impl From<CommandCode> for u8 {
    fn from(code: CommandCode) -> Self {
        match code {
            CommandCode::Void => 0,
            CommandCode::Success => 1,
            CommandCode::Error => 2,
        }
    }
}

/// 命令信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub command: String,
    pub state: CommandState,
    pub id: u64,
    pub code: CommandCode,
    pub data: CommandData,
}

impl WireMessage {
    /// 结构检查: 只看信封键是否齐全, 不解析取值
    pub fn is_valid(value: &Value) -> bool {
        match value.as_object() {
            Some(object) => ENVELOPE_KEYS.iter().all(|key| object.contains_key(*key)),
            None => false,
        }
    }
}

/// 信封之外的控制信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    Hello,
    Bye,
    Accept,
    Invalid,
}

/// 一帧线路消息
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Frame {
    Signal(Signal),
    Command(WireMessage),
}

impl Frame {
    pub fn from_value(value: Value) -> SawResult<Frame> {
        match value {
            Value::String(ref text) => serde_json::from_value::<Signal>(value.clone())
                .map(Frame::Signal)
                .map_err(|_| SawError::malformed(format!("未知的控制信号: {text}"))),
            Value::Object(_) if WireMessage::is_valid(&value) => {
                let message = serde_json::from_value::<WireMessage>(value)
                    .map_err(|e| SawError::malformed(e.to_string()))?;
                Ok(Frame::Command(message))
            }
            other => Err(SawError::malformed(format!("无法识别的消息: {other}"))),
        }
    }

    pub fn encode(&self) -> SawResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<WireMessage> for Frame {
    fn from(message: WireMessage) -> Self {
        Frame::Command(message)
    }
}

/// `tadd` 命令数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadKnowPayload {
    pub name: String,
}

/// `trun` 命令数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadRunPayload {
    pub run_id: u64,
    pub application_id: String,
    pub unique_id: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// `tres` 命令数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadResultPayload {
    pub run_id: u64,
    pub application_id: String,
    pub unique_id: String,
    pub success: bool,
    pub result: Value,
}

/// 把类型化的数据转换成命令数据
pub fn to_data<T: Serialize>(payload: &T) -> SawResult<CommandData> {
    match serde_json::to_value(payload)? {
        Value::Object(map) => Ok(map),
        other => Err(SawError::Serialization(format!(
            "命令数据必须是对象: {other}"
        ))),
    }
}

/// 从命令数据中解析类型化的数据
pub fn from_data<T: for<'de> Deserialize<'de>>(data: &CommandData) -> SawResult<T> {
    Ok(serde_json::from_value(Value::Object(data.clone()))?)
}
