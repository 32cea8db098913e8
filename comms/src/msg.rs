use std::io;

use crate::{
    AnyPayload, Deserialize, Serialize, Tensor,
    protocol::{self, HEADER_SIZE, Header, META_LEN_SIZE, MetaLen},
};

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Connect { token: String },
    Accepted,
    Rejected { reason: String },
    Disconnect,
}

/// The outcome code of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Success,
    InvalidRequest,
    InvalidDataBlock,
}

/// The answer to every request sent through the channel.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Status {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Status {
    pub fn success() -> Self {
        Self {
            code: StatusCode::Success,
            message: String::new(),
        }
    }

    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }
}

/// The value carried by a data message.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Tensor(Tensor),
    Any(AnyPayload),
}

/// A named value exchanged during an iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub iter_id: u64,
    pub name: String,
    pub payload: Payload,
}

/// The messages of the transmit stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TransmitRequest {
    Start { iter_id: u64 },
    Data(DataMessage),
    Commit { iter_id: u64 },
}

impl TransmitRequest {
    pub fn iter_id(&self) -> u64 {
        match self {
            Self::Start { iter_id } | Self::Commit { iter_id } => *iter_id,
            Self::Data(data) => data.iter_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Data(_) => "data",
            Self::Commit { .. } => "commit",
        }
    }
}

/// Asks the peer to load a block of examples.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoadDataBlockRequest {
    pub count: u64,
    pub block_id: String,
}

/// The application layer message of the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Err(String),
    Control(Command),
    Transmit {
        seq: u64,
        request: TransmitRequest,
    },
    Response {
        seq: u64,
        status: Status,
    },
    LoadDataBlock {
        seq: u64,
        request: LoadDataBlockRequest,
    },
}

impl Msg {
    /// A short name of the message kind, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Err(_) => "err",
            Msg::Control(_) => "control",
            Msg::Transmit { request, .. } => request.kind(),
            Msg::Response { .. } => "response",
            Msg::LoadDataBlock { .. } => "load_data_block",
        }
    }

    fn buf_is_too_small<T>(size: usize, needed: usize) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("The given buffer is too small {size}, must at least be {needed} bytes"),
        ))
    }

    fn invalid_kind<T>(kind: u32) -> io::Result<T> {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Received an invalid kind header {kind}"),
        ))
    }

    /// Writes the header of a data frame: the json metadata prefixed by its length.
    fn write_meta<M: serde::Serialize>(buf: &mut Vec<u8>, header: Header, meta: &M) -> io::Result<()> {
        buf.extend_from_slice(&header);

        let at = buf.len();
        buf.extend_from_slice(&[0; META_LEN_SIZE]);
        serde_json::to_writer(&mut *buf, meta)?;

        let meta_len = (buf.len() - at - META_LEN_SIZE) as MetaLen;
        buf[at..at + META_LEN_SIZE].copy_from_slice(&meta_len.to_be_bytes());
        Ok(())
    }

    /// Splits the body of a data frame into its decoded metadata and raw tail.
    fn read_meta<M: serde::de::DeserializeOwned>(rest: &[u8]) -> io::Result<(M, &[u8])> {
        if rest.len() < META_LEN_SIZE {
            return Self::buf_is_too_small(rest.len(), META_LEN_SIZE);
        }

        let (len_buf, rest) = rest.split_at(META_LEN_SIZE);
        let mut raw_len = [0; META_LEN_SIZE];
        raw_len.copy_from_slice(len_buf);
        let meta_len = MetaLen::from_be_bytes(raw_len) as usize;

        if rest.len() < meta_len {
            return Self::buf_is_too_small(rest.len(), meta_len);
        }

        let (meta, tail) = rest.split_at(meta_len);
        Ok((serde_json::from_slice(meta)?, tail))
    }
}

impl<'a> Serialize<'a> for Msg {
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>> {
        match self {
            Msg::Err(e) => {
                buf.extend_from_slice(&protocol::ERR);
                Ok(Some(e.as_bytes()))
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&protocol::CONTROL);
                serde_json::to_writer(buf, cmd)?;
                Ok(None)
            }
            Msg::Transmit { seq, request } => match request {
                TransmitRequest::Start { iter_id } => {
                    buf.extend_from_slice(&protocol::START);
                    serde_json::to_writer(buf, &(seq, iter_id))?;
                    Ok(None)
                }
                TransmitRequest::Commit { iter_id } => {
                    buf.extend_from_slice(&protocol::COMMIT);
                    serde_json::to_writer(buf, &(seq, iter_id))?;
                    Ok(None)
                }
                TransmitRequest::Data(data) => {
                    let DataMessage {
                        iter_id,
                        name,
                        payload,
                    } = data;

                    match payload {
                        Payload::Tensor(tensor) => {
                            let meta = (seq, iter_id, name, tensor.shape());
                            Self::write_meta(buf, protocol::TENSOR, &meta)?;
                            Ok(Some(bytemuck::cast_slice(tensor.values())))
                        }
                        Payload::Any(any) => {
                            let meta = (seq, iter_id, name, &any.type_url);
                            Self::write_meta(buf, protocol::ANY, &meta)?;
                            Ok(Some(&any.value))
                        }
                    }
                }
            },
            Msg::Response { seq, status } => {
                buf.extend_from_slice(&protocol::RESPONSE);
                serde_json::to_writer(buf, &(seq, status))?;
                Ok(None)
            }
            Msg::LoadDataBlock { seq, request } => {
                buf.extend_from_slice(&protocol::LOAD_DATA_BLOCK);
                serde_json::to_writer(buf, &(seq, request))?;
                Ok(None)
            }
        }
    }
}

impl Deserialize for Msg {
    fn deserialize(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Self::buf_is_too_small(buf.len(), HEADER_SIZE);
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut header: Header = [0; HEADER_SIZE];
        header.copy_from_slice(kind_buf);

        match header {
            protocol::ERR => {
                let text = str::from_utf8(rest)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

                Ok(Self::Err(text.to_string()))
            }
            protocol::CONTROL => Ok(Self::Control(serde_json::from_slice(rest)?)),
            protocol::START => {
                let (seq, iter_id) = serde_json::from_slice(rest)?;
                let request = TransmitRequest::Start { iter_id };
                Ok(Self::Transmit { seq, request })
            }
            protocol::COMMIT => {
                let (seq, iter_id) = serde_json::from_slice(rest)?;
                let request = TransmitRequest::Commit { iter_id };
                Ok(Self::Transmit { seq, request })
            }
            protocol::TENSOR => {
                let ((seq, iter_id, name, shape), tail): ((u64, u64, String, Vec<usize>), _) =
                    Self::read_meta(rest)?;

                if tail.len() % size_of::<f32>() != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Tensor data of {} bytes is not a whole number of f32", tail.len()),
                    ));
                }

                let values: Vec<f32> = bytemuck::pod_collect_to_vec(tail);
                let data = DataMessage {
                    iter_id,
                    name,
                    payload: Payload::Tensor(Tensor::new(shape, values)?),
                };

                let request = TransmitRequest::Data(data);
                Ok(Self::Transmit { seq, request })
            }
            protocol::ANY => {
                let ((seq, iter_id, name, type_url), tail): ((u64, u64, String, String), _) =
                    Self::read_meta(rest)?;

                let any = AnyPayload {
                    type_url,
                    value: tail.to_vec(),
                };

                let data = DataMessage {
                    iter_id,
                    name,
                    payload: Payload::Any(any),
                };

                let request = TransmitRequest::Data(data);
                Ok(Self::Transmit { seq, request })
            }
            protocol::RESPONSE => {
                let (seq, status) = serde_json::from_slice(rest)?;
                Ok(Self::Response { seq, status })
            }
            protocol::LOAD_DATA_BLOCK => {
                let (seq, request) = serde_json::from_slice(rest)?;
                Ok(Self::LoadDataBlock { seq, request })
            }
            other => Self::invalid_kind(u32::from_be_bytes(other)),
        }
    }
}
