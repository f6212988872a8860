// src/api/message.rs

//! The typed message catalog of the API protocol.
//!
//! Each message owns a fixed wire type id carried in the frame header. The
//! byte-level encoding of a message body is an opaque capability provided by
//! [`crate::api::codec`]; nothing in the connection layer inspects payload
//! bytes directly.

use bincode::{Decode, Encode};

/// Severity of a forwarded log line. Higher variants are more verbose; a
/// client subscribed at a level receives that level and everything terser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Encode, Decode)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
}

/// The kind of entity an entry in the registry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum EntityKind {
    BinarySensor,
    Sensor,
    TextSensor,
    Switch,
    Light,
    Fan,
    Climate,
}

/// The serializable state of an entity, one variant per entity kind.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum EntityState {
    Binary(bool),
    Measurement(f32),
    Text(String),
    Switch(bool),
    Light { on: bool, brightness: f32 },
    Fan { on: bool, speed_level: u8 },
    Climate { mode: u8, current: f32, target: f32 },
}

/// Declared type of one service-call argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum ServiceArgType {
    Bool,
    Int,
    Float,
    String,
    BoolArray,
    IntArray,
    FloatArray,
    StringArray,
}

/// A concrete service-call argument value sent by a client.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum ServiceArgValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    String(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i32>),
    FloatArray(Vec<f32>),
    StringArray(Vec<String>),
}

impl ServiceArgValue {
    pub fn arg_type(&self) -> ServiceArgType {
        match self {
            ServiceArgValue::Bool(_) => ServiceArgType::Bool,
            ServiceArgValue::Int(_) => ServiceArgType::Int,
            ServiceArgValue::Float(_) => ServiceArgType::Float,
            ServiceArgValue::String(_) => ServiceArgType::String,
            ServiceArgValue::BoolArray(_) => ServiceArgType::BoolArray,
            ServiceArgValue::IntArray(_) => ServiceArgType::IntArray,
            ServiceArgValue::FloatArray(_) => ServiceArgType::FloatArray,
            ServiceArgValue::StringArray(_) => ServiceArgType::StringArray,
        }
    }
}

/// Every message the API speaks, in both directions.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum ApiMessage {
    Hello {
        client_info: String,
        api_version_major: u32,
        api_version_minor: u32,
    },
    HelloResponse {
        api_version_major: u32,
        api_version_minor: u32,
        server_info: String,
        name: String,
    },
    ConnectRequest {
        password: String,
    },
    ConnectResponse {
        invalid_password: bool,
    },
    DisconnectRequest,
    DisconnectResponse,
    PingRequest,
    PingResponse,
    DeviceInfoRequest,
    DeviceInfoResponse {
        name: String,
        version: String,
        uses_password: bool,
    },
    ListEntitiesRequest,
    ListEntitiesEntryResponse {
        kind: EntityKind,
        key: u32,
        object_id: String,
        name: String,
    },
    ListEntitiesDoneResponse,
    SubscribeStatesRequest,
    EntityStateResponse {
        key: u32,
        state: EntityState,
    },
    SubscribeLogsRequest {
        level: LogLevel,
    },
    LogMessageResponse {
        level: LogLevel,
        tag: String,
        line: String,
    },
    SubscribeHomeassistantServicesRequest,
    HomeassistantServiceResponse {
        service: String,
        data: Vec<(String, String)>,
        is_event: bool,
    },
    GetTimeRequest,
    GetTimeResponse {
        epoch_seconds: u32,
    },
    SubscribeHomeAssistantStatesRequest,
    SubscribeHomeAssistantStateResponse {
        entity_id: String,
        attribute: String,
        once: bool,
    },
    HomeAssistantStateResponse {
        entity_id: String,
        attribute: String,
        state: String,
    },
    ExecuteServiceRequest {
        key: u32,
        args: Vec<ServiceArgValue>,
    },
    ExecuteServiceResponse {
        success: bool,
        error: String,
    },
    CameraImageRequest {
        single: bool,
        stream: bool,
    },
    CameraImageResponse {
        data: Vec<u8>,
        done: bool,
    },
    ZWaveProxyFrame {
        data: Vec<u8>,
    },
}

impl ApiMessage {
    /// The wire type id carried in the frame header for this message.
    pub fn message_type(&self) -> u16 {
        match self {
            ApiMessage::Hello { .. } => 1,
            ApiMessage::HelloResponse { .. } => 2,
            ApiMessage::ConnectRequest { .. } => 3,
            ApiMessage::ConnectResponse { .. } => 4,
            ApiMessage::DisconnectRequest => 5,
            ApiMessage::DisconnectResponse => 6,
            ApiMessage::PingRequest => 7,
            ApiMessage::PingResponse => 8,
            ApiMessage::DeviceInfoRequest => 9,
            ApiMessage::DeviceInfoResponse { .. } => 10,
            ApiMessage::ListEntitiesRequest => 11,
            ApiMessage::ListEntitiesEntryResponse { .. } => 12,
            ApiMessage::ListEntitiesDoneResponse => 19,
            ApiMessage::SubscribeStatesRequest => 20,
            ApiMessage::EntityStateResponse { .. } => 22,
            ApiMessage::SubscribeLogsRequest { .. } => 28,
            ApiMessage::LogMessageResponse { .. } => 29,
            ApiMessage::SubscribeHomeassistantServicesRequest => 34,
            ApiMessage::HomeassistantServiceResponse { .. } => 35,
            ApiMessage::GetTimeRequest => 36,
            ApiMessage::GetTimeResponse { .. } => 37,
            ApiMessage::SubscribeHomeAssistantStatesRequest => 38,
            ApiMessage::SubscribeHomeAssistantStateResponse { .. } => 39,
            ApiMessage::HomeAssistantStateResponse { .. } => 40,
            ApiMessage::ExecuteServiceRequest { .. } => 41,
            ApiMessage::ExecuteServiceResponse { .. } => 42,
            ApiMessage::CameraImageResponse { .. } => 45,
            ApiMessage::CameraImageRequest { .. } => 46,
            ApiMessage::ZWaveProxyFrame { .. } => 128,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ApiMessage::Hello { .. } => "Hello",
            ApiMessage::HelloResponse { .. } => "HelloResponse",
            ApiMessage::ConnectRequest { .. } => "ConnectRequest",
            ApiMessage::ConnectResponse { .. } => "ConnectResponse",
            ApiMessage::DisconnectRequest => "DisconnectRequest",
            ApiMessage::DisconnectResponse => "DisconnectResponse",
            ApiMessage::PingRequest => "PingRequest",
            ApiMessage::PingResponse => "PingResponse",
            ApiMessage::DeviceInfoRequest => "DeviceInfoRequest",
            ApiMessage::DeviceInfoResponse { .. } => "DeviceInfoResponse",
            ApiMessage::ListEntitiesRequest => "ListEntitiesRequest",
            ApiMessage::ListEntitiesEntryResponse { .. } => "ListEntitiesEntryResponse",
            ApiMessage::ListEntitiesDoneResponse => "ListEntitiesDoneResponse",
            ApiMessage::SubscribeStatesRequest => "SubscribeStatesRequest",
            ApiMessage::EntityStateResponse { .. } => "EntityStateResponse",
            ApiMessage::SubscribeLogsRequest { .. } => "SubscribeLogsRequest",
            ApiMessage::LogMessageResponse { .. } => "LogMessageResponse",
            ApiMessage::SubscribeHomeassistantServicesRequest => {
                "SubscribeHomeassistantServicesRequest"
            }
            ApiMessage::HomeassistantServiceResponse { .. } => "HomeassistantServiceResponse",
            ApiMessage::GetTimeRequest => "GetTimeRequest",
            ApiMessage::GetTimeResponse { .. } => "GetTimeResponse",
            ApiMessage::SubscribeHomeAssistantStatesRequest => {
                "SubscribeHomeAssistantStatesRequest"
            }
            ApiMessage::SubscribeHomeAssistantStateResponse { .. } => {
                "SubscribeHomeAssistantStateResponse"
            }
            ApiMessage::HomeAssistantStateResponse { .. } => "HomeAssistantStateResponse",
            ApiMessage::ExecuteServiceRequest { .. } => "ExecuteServiceRequest",
            ApiMessage::ExecuteServiceResponse { .. } => "ExecuteServiceResponse",
            ApiMessage::CameraImageRequest { .. } => "CameraImageRequest",
            ApiMessage::CameraImageResponse { .. } => "CameraImageResponse",
            ApiMessage::ZWaveProxyFrame { .. } => "ZWaveProxyFrame",
        }
    }
}
