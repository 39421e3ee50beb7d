//! Session setup messages sent to agents
//!
//! When a transfer is admitted both agents receive a one-line text datagram on
//! their control port describing their half of it:
//!
//! ```text
//! CLIENT <transfer-id> <client-ip> <client-port> <server-agent-ip> <sockets> <buffer> <queue>
//! AGENT <transfer-id> <server-ip> <server-port> <sockets> <buffer> <queue>
//! ```

use crate::session::Session;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("Empty agent message")]
    Empty,

    #[error("Unknown agent message kind: {0}")]
    UnknownKind(String),

    #[error("Expected {expected} fields, got {actual}")]
    FieldCount { expected: usize, actual: usize },

    #[error("Invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Transfer parameters shared by both agents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferParams {
    pub parallel_sockets: u32,
    pub buffer_size: u32,
    pub queue_capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCommand {
    /// Sent to the client-side agent
    Client {
        transfer_id: Uuid,
        client_ip: Ipv4Addr,
        client_port: u16,
        server_agent_ip: Ipv4Addr,
        params: TransferParams,
    },
    /// Sent to the server-side agent
    Server {
        transfer_id: Uuid,
        server_ip: Ipv4Addr,
        server_port: u16,
        params: TransferParams,
    },
}

impl AgentCommand {
    pub fn for_client_agent(session: &Session) -> Self {
        let client = session.client();
        AgentCommand::Client {
            transfer_id: session.transfer_id(),
            client_ip: client.ip,
            client_port: client.tcp_port,
            server_agent_ip: session.server_side_agent().ip,
            params: params_of(session),
        }
    }

    pub fn for_server_agent(session: &Session) -> Self {
        let server = session.server();
        AgentCommand::Server {
            transfer_id: session.transfer_id(),
            server_ip: server.ip,
            server_port: server.tcp_port,
            params: params_of(session),
        }
    }

    pub fn transfer_id(&self) -> Uuid {
        match self {
            AgentCommand::Client { transfer_id, .. } | AgentCommand::Server { transfer_id, .. } => {
                *transfer_id
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

fn params_of(session: &Session) -> TransferParams {
    let tunables = session.tunables();
    TransferParams {
        parallel_sockets: tunables.parallel_sockets,
        buffer_size: tunables.buffer_size,
        queue_capacity: tunables.queue_capacity,
    }
}

impl fmt::Display for AgentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentCommand::Client {
                transfer_id,
                client_ip,
                client_port,
                server_agent_ip,
                params,
            } => write!(
                f,
                "CLIENT {} {} {} {} {} {} {}",
                transfer_id,
                client_ip,
                client_port,
                server_agent_ip,
                params.parallel_sockets,
                params.buffer_size,
                params.queue_capacity
            ),
            AgentCommand::Server {
                transfer_id,
                server_ip,
                server_port,
                params,
            } => write!(
                f,
                "AGENT {} {} {} {} {} {}",
                transfer_id,
                server_ip,
                server_port,
                params.parallel_sockets,
                params.buffer_size,
                params.queue_capacity
            ),
        }
    }
}

impl FromStr for AgentCommand {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let (kind, rest) = fields.split_first().ok_or(MessageError::Empty)?;

        match *kind {
            "CLIENT" => {
                expect_fields(rest, 7)?;
                Ok(AgentCommand::Client {
                    transfer_id: field(rest[0], "transfer id")?,
                    client_ip: field(rest[1], "client ip")?,
                    client_port: field(rest[2], "client port")?,
                    server_agent_ip: field(rest[3], "server agent ip")?,
                    params: parse_params(&rest[4..])?,
                })
            }
            "AGENT" => {
                expect_fields(rest, 6)?;
                Ok(AgentCommand::Server {
                    transfer_id: field(rest[0], "transfer id")?,
                    server_ip: field(rest[1], "server ip")?,
                    server_port: field(rest[2], "server port")?,
                    params: parse_params(&rest[3..])?,
                })
            }
            other => Err(MessageError::UnknownKind(other.to_string())),
        }
    }
}

fn expect_fields(fields: &[&str], expected: usize) -> Result<(), MessageError> {
    if fields.len() == expected {
        Ok(())
    } else {
        Err(MessageError::FieldCount {
            expected,
            actual: fields.len(),
        })
    }
}

fn field<T: FromStr>(value: &str, name: &'static str) -> Result<T, MessageError> {
    value.parse().map_err(|_| MessageError::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

fn parse_params(fields: &[&str]) -> Result<TransferParams, MessageError> {
    Ok(TransferParams {
        parallel_sockets: field(fields[0], "parallel sockets")?,
        buffer_size: field(fields[1], "buffer size")?,
        queue_capacity: field(fields[2], "queue capacity")?,
    })
}
