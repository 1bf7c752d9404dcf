// 响应信封：所有接口统一返回 {status, data?, message?}。
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DATA_LABEL: &str = "data";
pub const MSG_LABEL: &str = "message";
pub const STATUS_LABEL: &str = "status";

pub type JsonRow = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<JsonRow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Envelope {
    pub fn with_data(data: Vec<JsonRow>) -> Self {
        Self {
            status: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"{STATUS_LABEL}\":false}}"))
    }
}

pub fn error_envelope(message: impl Into<String>) -> Envelope {
    Envelope {
        status: false,
        data: None,
        message: Some(message.into()),
    }
}

pub fn ok_envelope() -> Envelope {
    Envelope {
        status: true,
        data: None,
        message: None,
    }
}
