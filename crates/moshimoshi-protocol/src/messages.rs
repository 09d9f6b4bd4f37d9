use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{
    ConsumerParams, DtlsParameters, ErrorPayload, MediaKind, ParticipantData, RtpCapabilities,
    RtpParameters, TransportDirection, TransportParams,
};

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Authenticate with the server; must be the first frame
    Authenticate { token: String },

    /// A call expecting exactly one `ServerMessage::Response` with the same id
    Request { id: u64, request: Request },

    /// Ping to keep connection alive
    Ping,
}

/// Calls a connected client can make
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    GetCapabilities,

    CreateTransport {
        direction: TransportDirection,
    },

    ConnectTransport {
        transport_id: String,
        dtls_parameters: DtlsParameters,
    },

    /// Join a meeting's room and record attendance
    Attend { meeting_id: Uuid },

    Produce {
        meeting_id: Uuid,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    Consume {
        transport_id: String,
        producer_id: String,
        /// Falls back to the router's own capabilities when omitted
        #[serde(default)]
        rtp_capabilities: Option<RtpCapabilities>,
    },

    CloseProducer { producer_id: String },

    GetParticipants { meeting_id: Uuid },

    Leave { meeting_id: Uuid },
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication successful
    Authenticated { connection_id: Uuid, user_id: Uuid },

    /// Answer to a `ClientMessage::Request`
    Response { id: u64, body: ResponseBody },

    /// Connection-level error (bad frame, failed authentication)
    Error(ErrorPayload),

    /// Pong response to ping
    Pong,

    /// Another participant in the meeting started producing
    NewProducer {
        meeting_id: Uuid,
        participant: ParticipantData,
    },

    /// A producer this client was consuming is gone
    ProducerClosed { producer_id: String },

    ParticipantJoined { meeting_id: Uuid, user_id: Uuid },

    ParticipantLeft { meeting_id: Uuid, user_id: Uuid },

    /// The owner left; the meeting accepts no more attendees
    MeetingFinished { meeting_id: Uuid },
}

/// Payload of a response, one variant per request kind plus `Error`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    Capabilities { rtp_capabilities: RtpCapabilities },

    TransportCreated(TransportParams),

    TransportConnected { transport_id: String },

    Attended { already: bool, message: String },

    Produced { producer_id: String },

    ConsumerCreated(ConsumerParams),

    ProducerClosed { producer_id: String },

    Participants { participants: Vec<ParticipantData> },

    Left { success: bool, message: String },

    Error(ErrorPayload),
}
